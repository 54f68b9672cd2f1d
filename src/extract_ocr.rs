//! OCR for image objects and scanned PDFs via external commands.
//!
//! The image command (default `tesseract stdin stdout -l eng`) receives the
//! image bytes on stdin and writes recognized text to stdout. The optional
//! PDF command does the same for a whole PDF, rasterizing pages first; it is
//! reached through [`ScannedPdfFallback`](docrelay_core::extract::ScannedPdfFallback)
//! when a PDF has no text layer.
//!
//! A missing binary or a non-zero exit is [`ExtractError::Ocr`] (permanent).
//! Running past the timeout is [`ExtractError::TimedOut`], which is retried.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use docrelay_core::error::ExtractError;
use docrelay_core::extract::{segment_text, TextExtractor, MIME_PDF};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::OcrConfig;

struct OcrCommand {
    program: String,
    args: Vec<String>,
}

pub struct OcrExtractor {
    image: OcrCommand,
    pdf: Option<OcrCommand>,
    timeout: Duration,
}

impl OcrExtractor {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            image: OcrCommand {
                program: command.into(),
                args,
            },
            pdf: None,
            timeout,
        }
    }

    /// Command used for `application/pdf`: PDF bytes on stdin, text on
    /// stdout.
    pub fn with_pdf_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.pdf = Some(OcrCommand {
            program: command.into(),
            args,
        });
        self
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        let substitute = |args: &[String]| -> Vec<String> {
            args.iter()
                .map(|a| a.replace("{language}", &config.language))
                .collect()
        };
        let ocr = Self::new(
            config.command.clone(),
            substitute(&config.args),
            Duration::from_secs(config.timeout_secs),
        );
        if config.pdf_fallback {
            ocr.with_pdf_command(config.pdf_command.clone(), substitute(&config.pdf_args))
        } else {
            ocr
        }
    }

    async fn run(&self, cmd: &OcrCommand, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExtractError::Ocr(format!("failed to start '{}': {}", cmd.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = bytes.to_vec();
            // Feed stdin concurrently so a large image cannot deadlock
            // against a full stdout pipe. Write errors surface as a bad exit.
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExtractError::TimedOut {
                extractor: format!("OCR command '{}'", cmd.program),
                timeout: self.timeout,
            })?
            .map_err(|e| ExtractError::Ocr(format!("waiting for '{}': {}", cmd.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Ocr(format!(
                "'{}' exited with {}: {}",
                cmd.program,
                output.status,
                stderr.trim().chars().take(500).collect::<String>()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TextExtractor for OcrExtractor {
    fn name(&self) -> &str {
        "ocr"
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type.starts_with("image/")
    }

    /// Images only in the registry; PDFs arrive here from the scanned-PDF
    /// fallback and need the PDF command.
    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
        let cmd = if content_type == MIME_PDF {
            self.pdf
                .as_ref()
                .ok_or_else(|| ExtractError::UnsupportedContentType(content_type.to_string()))?
        } else {
            &self.image
        };
        let text = self.run(cmd, bytes).await?;
        Ok(segment_text(&text))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> OcrExtractor {
        OcrExtractor::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn stdout_becomes_segments() {
        let ocr = sh("cat", Duration::from_secs(5));
        let segs = ocr
            .extract(b"INVOICE 42\n\nTotal due: 10", "image/png")
            .await
            .unwrap();
        assert_eq!(segs, vec!["INVOICE 42", "Total due: 10"]);
    }

    #[tokio::test]
    async fn blank_image_yields_no_segments() {
        let ocr = sh("cat >/dev/null; echo", Duration::from_secs(5));
        assert!(ocr.extract(b"\x89PNG", "image/png").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_command_is_ocr_error() {
        let ocr = sh("echo 'bad image' >&2; exit 1", Duration::from_secs(5));
        match ocr.extract(b"x", "image/png").await {
            Err(ExtractError::Ocr(msg)) => assert!(msg.contains("bad image")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_ocr_error() {
        let ocr = OcrExtractor::new("docrelay-no-such-ocr", vec![], Duration::from_secs(5));
        assert!(matches!(
            ocr.extract(b"x", "image/png").await,
            Err(ExtractError::Ocr(_))
        ));
    }

    #[tokio::test]
    async fn slow_command_times_out_as_retryable() {
        let ocr = sh("sleep 5", Duration::from_millis(100));
        let err = ocr.extract(b"x", "image/png").await.unwrap_err();
        assert!(matches!(err, ExtractError::TimedOut { .. }), "{:?}", err);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("did not finish"));
    }

    #[tokio::test]
    async fn pdfs_use_the_pdf_command() {
        let ocr = sh("cat >/dev/null; echo image", Duration::from_secs(5))
            .with_pdf_command("sh", vec!["-c".into(), "cat >/dev/null; echo page one".into()]);
        assert_eq!(ocr.extract(b"%PDF", MIME_PDF).await.unwrap(), vec!["page one"]);
        assert_eq!(ocr.extract(b"\x89PNG", "image/png").await.unwrap(), vec!["image"]);
    }

    #[tokio::test]
    async fn pdfs_are_unsupported_without_a_pdf_command() {
        let ocr = sh("cat", Duration::from_secs(5));
        assert!(matches!(
            ocr.extract(b"%PDF", MIME_PDF).await,
            Err(ExtractError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn language_is_substituted_into_args() {
        let config = OcrConfig {
            language: "deu".into(),
            ..OcrConfig::default()
        };
        let ocr = OcrExtractor::from_config(&config);
        assert_eq!(ocr.image.args, vec!["stdin", "stdout", "-l", "deu"]);
        let pdf = ocr.pdf.as_ref().unwrap();
        assert!(pdf.args.iter().any(|a| a.contains("-l deu")));
        assert!(!pdf.args.iter().any(|a| a.contains("{language}")));
        assert!(ocr.supports("image/tiff"));
        assert!(!ocr.supports("application/pdf"));
    }
}
