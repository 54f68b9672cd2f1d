//! Text extraction abstraction.
//!
//! The processor does not know how text is obtained from a given format;
//! it asks an [`ExtractorRegistry`] for the first [`TextExtractor`] that
//! supports the object's content type. Native capabilities such as OCR
//! binaries are therefore a matter of which extractors get registered.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ExtractError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Turns object bytes of a supported content type into ordered text
/// segments.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Short name used in logs (e.g. `"plain"`, `"document"`, `"ocr"`).
    fn name(&self) -> &str;

    fn supports(&self, content_type: &str) -> bool;

    /// Extract text. An object with no text yields an empty vector, not an
    /// error.
    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError>;
}

/// Ordered set of extractors; the first one that supports a content type
/// handles it.
#[derive(Default, Clone)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extractor: Arc<dyn TextExtractor>) {
        self.extractors.push(extractor);
    }

    pub fn with(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.register(extractor);
        self
    }

    pub fn find(&self, content_type: &str) -> Option<&Arc<dyn TextExtractor>> {
        self.extractors.iter().find(|e| e.supports(content_type))
    }

    pub fn names(&self) -> Vec<&str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Extract with the first matching extractor.
    pub async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
        let extractor = self
            .find(content_type)
            .ok_or_else(|| ExtractError::UnsupportedContentType(content_type.to_string()))?;
        extractor.extract(bytes, content_type).await
    }
}

/// Routes PDFs without a text layer to OCR.
///
/// Scanned PDFs parse successfully but yield no text; indexing them as empty
/// would record "no extractable text" for a document that has plenty. When
/// the text-layer extractor returns zero segments for `application/pdf`, the
/// same bytes are handed to `ocr`, whose result (possibly still empty) wins.
pub struct ScannedPdfFallback {
    text_layer: Arc<dyn TextExtractor>,
    ocr: Arc<dyn TextExtractor>,
}

impl ScannedPdfFallback {
    pub fn new(text_layer: Arc<dyn TextExtractor>, ocr: Arc<dyn TextExtractor>) -> Self {
        Self { text_layer, ocr }
    }
}

#[async_trait]
impl TextExtractor for ScannedPdfFallback {
    fn name(&self) -> &str {
        self.text_layer.name()
    }

    fn supports(&self, content_type: &str) -> bool {
        self.text_layer.supports(content_type)
    }

    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
        let segments = self.text_layer.extract(bytes, content_type).await?;
        if segments.is_empty() && content_type == MIME_PDF {
            return self.ocr.extract(bytes, content_type).await;
        }
        Ok(segments)
    }
}

/// Detect a MIME type from an object key's extension.
///
/// Unknown extensions map to `application/octet-stream`, which no built-in
/// extractor accepts.
pub fn detect_content_type(key: &str) -> String {
    let ext = key
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    let mime = match ext.as_deref() {
        Some("md" | "markdown") => "text/markdown",
        Some("txt" | "text" | "log") => "text/plain",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("yaml" | "yml") => "text/yaml",
        Some("xml") => "application/xml",
        Some("rst") => "text/x-rst",
        Some("html" | "htm") => "text/html",
        Some("pdf") => MIME_PDF,
        Some("docx") => MIME_DOCX,
        Some("pptx") => MIME_PPTX,
        Some("xlsx") => MIME_XLSX,
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("tif" | "tiff") => "image/tiff",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => MIME_OCTET_STREAM,
    };
    mime.to_string()
}

/// Pick the content type for an object: the store-reported type when it is
/// specific, otherwise detection by key.
///
/// Parameters such as `; charset=utf-8` are dropped.
pub fn resolve_content_type(reported: Option<&str>, key: &str) -> String {
    let reported = reported
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty() && ct != MIME_OCTET_STREAM && ct != "binary/octet-stream");
    reported.unwrap_or_else(|| detect_content_type(key))
}

/// Split text into paragraph segments on blank lines, trimming each and
/// dropping empty ones.
pub fn segment_text(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\x0c', "\n\n");
    normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
