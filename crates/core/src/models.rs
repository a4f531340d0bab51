use crate::error::IngestError;
use crate::typing::TypedCell;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    /// Forward-only moves; going back to `Pending` requires [`Document::reset_for_reprocess`].
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Xlsx,
    Csv,
    Text,
}

impl FileType {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "xlsx" | "xls" => Some(FileType::Xlsx),
            "csv" | "tsv" => Some(FileType::Csv),
            "txt" | "md" => Some(FileType::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Xlsx => "xlsx",
            FileType::Csv => "csv",
            FileType::Text => "txt",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub document_type: String,
    pub status: DocumentStatus,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(filename: impl Into<String>, file_type: FileType) -> Self {
        let filename = filename.into();
        let document_type = classify_document_type(file_type, &filename).to_string();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename,
            file_type,
            document_type,
            status: DocumentStatus::Pending,
            metadata: Map::new(),
            error: None,
            uploaded_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, next: DocumentStatus) -> Result<(), IngestError> {
        if !self.status.can_transition_to(next) {
            return Err(IngestError::InvalidArgument(format!(
                "document {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = DocumentStatus::Failed;
        self.error = Some(reason.into());
    }

    /// The only path back to `Pending`. Callers clear derived rows first.
    pub fn reset_for_reprocess(&mut self) {
        self.status = DocumentStatus::Pending;
        self.error = None;
        self.metadata.remove("embedding_status");
        self.metadata.remove("extraction_summary");
    }
}

/// Facet used by retrieval filters, derived from the filename first and the file type second.
pub fn classify_document_type(file_type: FileType, filename: &str) -> &'static str {
    const FAMILIES: [(&str, [&str; 4]); 3] = [
        ("financial_report", ["financial", "report", "statement", "budget"]),
        ("research_document", ["research", "study", "analysis", "whitepaper"]),
        ("legal_document", ["contract", "agreement", "legal", "terms"]),
    ];

    let lowered = filename.to_lowercase();
    for (family, terms) in FAMILIES {
        if terms.iter().any(|term| lowered.contains(term)) {
            return family;
        }
    }

    match file_type {
        FileType::Pdf => "pdf_document",
        FileType::Docx => "word_document",
        FileType::Xlsx => "spreadsheet",
        FileType::Csv | FileType::Text => "general_document",
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Heading,
    Title,
    Paragraph,
    ListItem,
    TableCaption,
    DataRow,
    DataSummary,
    Header,
    Footer,
}

impl SegmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentType::Heading => "heading",
            SegmentType::Title => "title",
            SegmentType::Paragraph => "paragraph",
            SegmentType::ListItem => "list_item",
            SegmentType::TableCaption => "table_caption",
            SegmentType::DataRow => "data_row",
            SegmentType::DataSummary => "data_summary",
            SegmentType::Header => "header",
            SegmentType::Footer => "footer",
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "heading" => Ok(SegmentType::Heading),
            "title" => Ok(SegmentType::Title),
            "paragraph" => Ok(SegmentType::Paragraph),
            "list_item" => Ok(SegmentType::ListItem),
            "table_caption" => Ok(SegmentType::TableCaption),
            "data_row" => Ok(SegmentType::DataRow),
            "data_summary" => Ok(SegmentType::DataSummary),
            "header" => Ok(SegmentType::Header),
            "footer" => Ok(SegmentType::Footer),
            other => Err(IngestError::InvalidArgument(format!(
                "unknown segment type: {other}"
            ))),
        }
    }
}

/// Output unit of the segmenter, not yet bound to a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub sequence_number: u32,
    pub content: String,
    pub segment_type: SegmentType,
    pub section_title: Option<String>,
    pub content_length: usize,
    pub word_count: usize,
}

impl Segment {
    pub fn new(
        sequence_number: u32,
        content: String,
        segment_type: SegmentType,
        section_title: Option<String>,
    ) -> Self {
        Self {
            sequence_number,
            content_length: content.chars().count(),
            word_count: content.split_whitespace().count(),
            content,
            segment_type,
            section_title,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSegment {
    pub document_id: String,
    pub sequence_number: u32,
    pub segment_type: SegmentType,
    pub section_title: Option<String>,
    pub content: String,
    pub content_length: usize,
    pub word_count: usize,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
}

impl TextSegment {
    pub fn from_segment(document_id: &str, segment: Segment) -> Self {
        Self {
            document_id: document_id.to_string(),
            sequence_number: segment.sequence_number,
            segment_type: segment.segment_type,
            section_title: segment.section_title,
            content: segment.content,
            content_length: segment.content_length,
            word_count: segment.word_count,
            embedding: None,
            embedding_model: None,
        }
    }

    pub fn record_id(&self) -> String {
        format!("segment:{}:{}", self.document_id, self.sequence_number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredCell {
    pub row_index: usize,
    pub column_index: usize,
    pub column_name: String,
    pub value: TypedCell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub document_id: String,
    pub table_index: usize,
    pub name: String,
    pub row_count: usize,
    pub column_count: usize,
    pub has_header: bool,
    pub rows: Vec<Vec<String>>,
    pub cells: Vec<StructuredCell>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyValue {
    pub document_id: String,
    pub key_name: String,
    pub category: Option<String>,
    pub value: TypedCell,
    pub extraction_method: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    Table,
    TablePart,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub source: String,
    pub page: Option<u32>,
    pub section: String,
    pub chunk_index: usize,
    pub kind: ChunkKind,
    /// `(part, total)` for table parts, both 1-based.
    pub part: Option<(usize, usize)>,
    /// Half-open data row range `[start, end)` carried by table chunks.
    pub row_range: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub token_count: usize,
    pub embedding: Option<Vec<f32>>,
}

/// A unit stored in the vector and lexical indexes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub document_id: String,
    pub filename: String,
    pub document_type: String,
    pub sequence_number: Option<u32>,
    pub section: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Vector,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keyword" | "lexical" => Ok(SearchMode::Keyword),
            "vector" | "semantic" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(IngestError::InvalidArgument(format!(
                "unknown search mode: {other}. Use keyword, vector, or hybrid."
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub document_type: Option<String>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            document_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Vector,
    Keyword,
    Hybrid,
    KeywordOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: IndexRecord,
    pub distance: Option<f64>,
    pub similarity: Option<f64>,
    pub keyword_rank: Option<f64>,
    pub combined_score: Option<f64>,
    pub search_type: SearchType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub mode: SearchMode,
    pub hits: Vec<SearchHit>,
    pub errors: Vec<String>,
}

impl SearchResult {
    pub fn is_degraded(&self) -> bool {
        self.hits
            .iter()
            .any(|hit| hit.search_type == SearchType::KeywordOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        let mut document = Document::new("notes.txt", FileType::Text);
        document
            .transition(DocumentStatus::Processing)
            .expect("pending -> processing");
        document
            .transition(DocumentStatus::Completed)
            .expect("processing -> completed");
        assert!(document.transition(DocumentStatus::Pending).is_err());
        assert!(document.transition(DocumentStatus::Processing).is_err());

        document.reset_for_reprocess();
        assert_eq!(document.status, DocumentStatus::Pending);
    }

    #[test]
    fn document_type_prefers_filename_keywords() {
        assert_eq!(
            classify_document_type(FileType::Pdf, "Q3_Financial_Summary.pdf"),
            "financial_report"
        );
        assert_eq!(
            classify_document_type(FileType::Docx, "service-agreement.docx"),
            "legal_document"
        );
        assert_eq!(classify_document_type(FileType::Xlsx, "inventory.xlsx"), "spreadsheet");
        assert_eq!(classify_document_type(FileType::Text, "notes.txt"), "general_document");
    }

    #[test]
    fn segment_type_parses_config_names() {
        assert_eq!("list_item".parse::<SegmentType>().ok(), Some(SegmentType::ListItem));
        assert_eq!(" Footer ".parse::<SegmentType>().ok(), Some(SegmentType::Footer));
        assert!("banner".parse::<SegmentType>().is_err());
    }

    #[test]
    fn segment_counts_words_and_chars() {
        let segment = Segment::new(0, "Three little words".to_string(), SegmentType::Title, None);
        assert_eq!(segment.word_count, 3);
        assert_eq!(segment.content_length, 18);
    }
}
