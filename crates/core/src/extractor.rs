//! Format-specific extraction into pages and datasets.
//!
//! Every extractor is wrapped by [`extract_document`], which never fails: a total failure
//! becomes a single page holding an error marker such as `"[PdfExtractor Error] ..."`.
//! Callers check [`ExtractedDocument::error_marker`] before segmenting anything.
//! Extraction blocks (the OCR fallback uses a blocking HTTP client); async callers run it
//! on `tokio::task::spawn_blocking`.

use crate::error::IngestError;
use crate::models::FileType;
use crate::segmenter::split_delimited;
use base64::{engine::general_purpose::STANDARD, Engine};
use calamine::{open_workbook_auto, Data, Reader};
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub text: String,
    pub source: String,
    pub page: Option<u32>,
}

/// One sheet or delimited file. `rows[0]` is the header row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub sheet_name: String,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub pages: Vec<ExtractedPage>,
    pub tables: Vec<ExtractedTable>,
}

impl ExtractedDocument {
    pub fn failure(extractor: &str, source: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            pages: vec![ExtractedPage {
                text: format!("[{extractor} Error] {reason}"),
                source: source.to_string(),
                page: None,
            }],
            tables: Vec::new(),
        }
    }

    pub fn error_marker(&self) -> Option<&str> {
        self.pages
            .first()
            .map(|page| page.text.as_str())
            .filter(|text| is_error_marker(text))
    }

    pub fn raw_text(&self) -> String {
        self.pages
            .iter()
            .map(|page| page.text.as_str())
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.raw_text().trim().is_empty() && self.tables.iter().all(|table| table.rows.is_empty())
    }
}

/// `"[<Name> Error] ..."` at the start of the text.
pub fn is_error_marker(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('[')
        && trimmed
            .split_once(']')
            .is_some_and(|(head, _)| head.ends_with(" Error"))
}

pub trait Extractor {
    fn name(&self) -> &'static str;
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError>;
}

pub fn extractor_for(file_type: FileType) -> Box<dyn Extractor + Send + Sync> {
    match file_type {
        FileType::Pdf => Box::new(PdfExtractor),
        FileType::Docx => Box::new(WordExtractor),
        FileType::Xlsx => Box::new(SpreadsheetExtractor),
        FileType::Csv => Box::new(DelimitedTextExtractor),
        FileType::Text => Box::new(PlainTextExtractor),
    }
}

pub fn extract_document(path: &Path, file_type: FileType) -> ExtractedDocument {
    let extractor = extractor_for(file_type);
    let source = file_label(path);

    match extractor.extract(path) {
        Ok(extracted) if extracted.is_empty() => {
            warn!(path = %path.display(), extractor = extractor.name(), "no content extracted");
            ExtractedDocument::failure(extractor.name(), &source, "no readable content")
        }
        Ok(extracted) => {
            debug!(
                path = %path.display(),
                pages = extracted.pages.len(),
                tables = extracted.tables.len(),
                "extracted document"
            );
            extracted
        }
        Err(error) => {
            warn!(path = %path.display(), extractor = extractor.name(), error = %error, "extraction failed");
            ExtractedDocument::failure(extractor.name(), &source, error)
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn sheet_label(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "Sheet1".to_string())
}

pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "PlainTextExtractor"
    }

    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let bytes = std::fs::read(path)?;
        Ok(ExtractedDocument {
            pages: vec![ExtractedPage {
                text: String::from_utf8_lossy(&bytes).into_owned(),
                source: file_label(path),
                page: Some(1),
            }],
            tables: Vec::new(),
        })
    }
}

/// CSV or TSV. The parsed rows become one dataset and no page is emitted, so the content
/// is segmented and chunked once, from the dataset.
pub struct DelimitedTextExtractor;

impl Extractor for DelimitedTextExtractor {
    fn name(&self) -> &'static str {
        "DelimitedTextExtractor"
    }

    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes).replace('\r', "");

        let is_tsv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tsv"));
        let first_line = text.lines().next().unwrap_or_default();
        let delimiter = if is_tsv || first_line.contains('\t') {
            '\t'
        } else {
            ','
        };

        let rows: Vec<Vec<String>> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| split_delimited(line, delimiter))
            .collect();

        Ok(ExtractedDocument {
            pages: Vec::new(),
            tables: vec![ExtractedTable {
                sheet_name: sheet_label(path),
                rows,
            }],
        })
    }
}

/// Every worksheet becomes one dataset.
pub struct SpreadsheetExtractor;

impl Extractor for SpreadsheetExtractor {
    fn name(&self) -> &'static str {
        "SpreadsheetExtractor"
    }

    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let mut workbook = open_workbook_auto(path)
            .map_err(|error| IngestError::Extraction(format!("cannot open workbook: {error}")))?;

        let mut tables = Vec::new();
        for sheet_name in workbook.sheet_names().to_vec() {
            let range = workbook.worksheet_range(&sheet_name).map_err(|error| {
                IngestError::Extraction(format!("cannot read sheet {sheet_name}: {error}"))
            })?;
            let rows: Vec<Vec<String>> = range
                .rows()
                .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
                .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
                .collect();
            if !rows.is_empty() {
                tables.push(ExtractedTable { sheet_name, rows });
            }
        }

        Ok(ExtractedDocument {
            pages: Vec::new(),
            tables,
        })
    }
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(value) => value.clone(),
        Data::Int(value) => value.to_string(),
        Data::Float(value) if value.fract() == 0.0 => format!("{value:.0}"),
        Data::Float(value) => value.to_string(),
        Data::Bool(value) => value.to_string(),
        Data::DateTime(value) => value.to_string(),
        Data::DateTimeIso(value) | Data::DurationIso(value) => value.clone(),
        Data::Error(error) => format!("#ERR:{error:?}"),
    }
}

/// `word/document.xml` text runs; each `w:p` closes a paragraph with a blank line.
pub struct WordExtractor;

impl Extractor for WordExtractor {
    fn name(&self) -> &'static str {
        "WordExtractor"
    }

    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let bytes = std::fs::read(path)?;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
            .map_err(|error| IngestError::Extraction(error.to_string()))?;

        let mut document_xml = Vec::new();
        archive
            .by_name("word/document.xml")
            .map_err(|error| IngestError::Extraction(format!("word/document.xml: {error}")))?
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut document_xml)?;
        if document_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(IngestError::Extraction(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }

        Ok(ExtractedDocument {
            pages: vec![ExtractedPage {
                text: word_paragraphs(&document_xml)?,
                source: file_label(path),
                page: Some(1),
            }],
            tables: Vec::new(),
        })
    }
}

fn word_paragraphs(xml: &[u8]) -> Result<String, IngestError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) if element.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(text)) if in_text => {
                let unescaped = text
                    .unescape()
                    .map_err(|error| IngestError::Extraction(error.to_string()))?;
                current.push_str(&unescaped);
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim().to_string();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph);
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::Extraction(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

/// Text layer through `lopdf`, then the multimodal OCR endpoint when one is configured.
pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "PdfExtractor"
    }

    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let source = file_label(path);
        let pages = match extract_text_layer(path) {
            Ok(pages) => pages,
            Err(parse_error) => match parse_llm_ocr_config() {
                None => return Err(parse_error),
                Some(config) => {
                    warn!(path = %path.display(), error = %parse_error, "text layer unreadable; trying OCR");
                    extract_with_llm_ocr(path, &config).map_err(|ocr_error| {
                        IngestError::Extraction(format!(
                            "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                        ))
                    })?
                }
            },
        };

        Ok(ExtractedDocument {
            pages: pages
                .into_iter()
                .map(|(number, text)| ExtractedPage {
                    text,
                    source: source.clone(),
                    page: Some(number),
                })
                .collect(),
            tables: Vec::new(),
        })
    }
}

fn extract_text_layer(path: &Path) -> Result<Vec<(u32, String)>, IngestError> {
    let document =
        Document::load(path).map_err(|error| IngestError::Extraction(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::Extraction(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push((page_no, text));
        }
    }

    if pages.is_empty() {
        return Err(IngestError::Extraction(format!(
            "pdf had no readable page text: {}",
            path.display()
        )));
    }

    Ok(pages)
}

fn parse_llm_ocr_config() -> Option<OcrEndpointConfig> {
    let endpoint = std::env::var("LLM_OCR_ENDPOINT").ok()?;
    let endpoint = endpoint.trim().to_string();
    if endpoint.is_empty() {
        return None;
    }

    let api_key = std::env::var("LLM_OCR_API_KEY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|key| !key.is_empty());

    Some(OcrEndpointConfig { endpoint, api_key })
}

fn extract_with_llm_ocr(
    path: &Path,
    config: &OcrEndpointConfig,
) -> Result<Vec<(u32, String)>, IngestError> {
    let pdf = std::fs::read(path)?;
    let payload = LlmOcrRequest {
        pdf_base64: STANDARD.encode(pdf),
        source_path: path.to_string_lossy().to_string(),
    };

    let mut request = Client::new()
        .post(&config.endpoint)
        .header("content-type", "application/json")
        .json(&payload);

    if let Some(api_key) = &config.api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request.send()?;

    if !response.status().is_success() {
        return Err(IngestError::OcrFailed(format!(
            "multimodal OCR request to {} returned {}",
            config.endpoint,
            response.status()
        )));
    }

    let payload: LlmOcrResponse = response.json()?;
    payload_to_pages(&payload, path)
}

fn payload_to_pages(
    payload: &LlmOcrResponse,
    path: &Path,
) -> Result<Vec<(u32, String)>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                (!text.is_empty()).then(|| (page.page.unwrap_or(1), text.to_string()))
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim();
                (!normalized.is_empty()).then(|| ((index + 1) as u32, normalized.to_string()))
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "multimodal OCR response was empty for {}",
        path.display()
    )))
}
