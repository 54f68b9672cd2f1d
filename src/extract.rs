//! Text extractors for plain text and binary documents (PDF, OOXML).
//!
//! Both implement [`TextExtractor`] and are registered in the processor's
//! [`ExtractorRegistry`](docrelay_core::extract::ExtractorRegistry). Images
//! are handled by [`crate::extract_ocr`].
//!
//! Segments follow the structure of the source format: paragraphs for text,
//! DOCX, and PDF; one segment per slide for PPTX; one per worksheet for
//! XLSX.

use std::io::Read;

use async_trait::async_trait;
use docrelay_core::error::ExtractError;
use docrelay_core::extract::{segment_text, TextExtractor, MIME_DOCX, MIME_PDF, MIME_PPTX, MIME_XLSX};
use quick_xml::events::Event;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// UTF-8 text formats: `text/*`, JSON, XML, YAML.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    fn name(&self) -> &str {
        "plain"
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type.starts_with("text/")
            || matches!(
                content_type,
                "application/json"
                    | "application/xml"
                    | "application/yaml"
                    | "application/x-yaml"
                    | "application/x-ndjson"
            )
    }

    async fn extract(&self, bytes: &[u8], _content_type: &str) -> Result<Vec<String>, ExtractError> {
        let text = String::from_utf8_lossy(bytes);
        Ok(segment_text(text.trim_start_matches('\u{feff}')))
    }
}

/// PDF via `pdf-extract`; DOCX, PPTX, and XLSX via `zip` + `quick-xml`.
///
/// Parsing is CPU-bound and runs on the blocking pool.
pub struct DocumentExtractor;

#[async_trait]
impl TextExtractor for DocumentExtractor {
    fn name(&self) -> &str {
        "document"
    }

    fn supports(&self, content_type: &str) -> bool {
        matches!(content_type, MIME_PDF | MIME_DOCX | MIME_PPTX | MIME_XLSX)
    }

    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
        let owned = bytes.to_vec();
        let ct = content_type.to_string();
        tokio::task::spawn_blocking(move || extract_segments(&owned, &ct))
            .await
            .map_err(|e| corrupt(content_type, format!("extraction task failed: {}", e)))?
    }
}

fn corrupt(content_type: &str, message: impl Into<String>) -> ExtractError {
    ExtractError::Corrupt {
        content_type: content_type.to_string(),
        message: message.into(),
    }
}

/// Extract segments from a supported binary document.
pub fn extract_segments(bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    // pdf-extract panics on some malformed inputs instead of erroring.
    let result = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes));
    match result {
        Ok(Ok(text)) => Ok(segment_text(&text)),
        Ok(Err(e)) => Err(corrupt(MIME_PDF, e.to_string())),
        Err(_) => Err(corrupt(MIME_PDF, "PDF parser panicked")),
    }
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive<'a>(bytes: &'a [u8], content_type: &str) -> Result<Archive<'a>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| corrupt(content_type, e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    content_type: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| corrupt(content_type, format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| corrupt(content_type, e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(corrupt(
            content_type,
            format!(
                "ZIP entry {} exceeds size limit ({} bytes)",
                name, MAX_XML_ENTRY_BYTES
            ),
        ));
    }
    Ok(out)
}

/// Collect text runs (`<*:t>`) grouped by paragraph (`<*:p>`).
///
/// Shared by DOCX (`w:p`/`w:t`) and PPTX (`a:p`/`a:t`), which use the same
/// local names.
fn paragraphs(xml: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                let text = te
                    .unescape()
                    .map_err(|e| corrupt(content_type, e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    let para = current.trim();
                    if !para.is_empty() {
                        out.push(para.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(content_type, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = open_archive(bytes, MIME_DOCX)?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MIME_DOCX)?;
    paragraphs(&doc_xml, MIME_DOCX)
}

/// Sort `prefix<N>.xml` entry names by `N`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = open_archive(bytes, MIME_PPTX)?;
    let mut out = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name, MIME_PPTX)?;
        let slide = paragraphs(&xml, MIME_PPTX)?.join("\n");
        if !slide.is_empty() {
            out.push(slide);
        }
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = open_archive(bytes, MIME_XLSX)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let mut out = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MIME_XLSX)?;
        let cells = extract_xlsx_sheet_cells(&sheet_xml, &shared_strings)?;
        if !cells.is_empty() {
            out.push(cells);
        }
    }
    Ok(out)
}

/// Workbooks with only numeric cells have no shared-strings part.
fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    if archive.index_for_name("xl/sharedStrings.xml").is_none() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MIME_XLSX)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(ref mut s) = current {
                    s.push_str(&te.unescape().map_err(|e| corrupt(MIME_XLSX, e.to_string()))?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(MIME_XLSX, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_xlsx_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if cell_is_shared_str {
                    if let Some(text) = s.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                        cells.push(text.clone());
                    }
                } else if !s.is_empty() {
                    cells.push(s.to_string());
                }
                in_v = false;
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(MIME_XLSX, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
