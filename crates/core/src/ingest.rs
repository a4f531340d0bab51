//! Document-level orchestration: register, extract, segment, type tables, pull
//! key-values, chunk, persist and optionally embed.

use crate::chunking::{Chunker, TokenCounter};
use crate::config::{IndexUnit, PipelineConfig};
use crate::embeddings::EmbeddingProvider;
use crate::error::IngestError;
use crate::extractor::{extract_document, ExtractedDocument};
use crate::key_values::extract_key_values;
use crate::models::{
    Chunk, Document, DocumentStatus, FileType, KeyValue, Segment, Table, TextSegment,
};
use crate::pipeline::{EmbedOptions, Embeddable, EmbeddingPipeline, EmbeddingReport};
use crate::rate_limit::RateLimiter;
use crate::segmenter::{clean_text, detect_tabular, segment, segment_dataset, split_delimited};
use crate::store::DocumentStore;
use crate::tables::{build_table, extract_tables};
use crate::traits::{KeywordIndex, VectorIndex};
use crate::SearchError;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

const SAMPLE_SEGMENTS: usize = 3;
const SAMPLE_KEY_VALUES: usize = 5;
const SAMPLE_CHARS: usize = 200;

/// Supported files under `folder`, sorted.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| FileType::from_path(entry.path()).is_some())
        .map(|entry| entry.path().to_path_buf())
        .collect();

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub document_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub segments: usize,
    pub tables: usize,
    pub key_values: usize,
    pub chunks: usize,
    pub embedding: Option<EmbeddingReport>,
    pub errors: Vec<String>,
}

impl ProcessingReport {
    fn new(document: &Document) -> Self {
        Self {
            document_id: document.id.clone(),
            filename: document.filename.clone(),
            status: document.status,
            segments: 0,
            tables: 0,
            key_values: 0,
            chunks: 0,
            embedding: None,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderReport {
    pub reports: Vec<ProcessingReport>,
    pub skipped_files: Vec<SkippedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub document: Document,
    pub segment_count: usize,
    pub embedded_segments: usize,
    pub segment_types: BTreeMap<String, usize>,
    pub table_count: usize,
    pub key_value_count: usize,
    pub sample_segments: Vec<String>,
    pub sample_key_values: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub total_documents: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_file_type: BTreeMap<String, usize>,
    pub total_segments: usize,
    pub embedded_segments: usize,
    pub daily_api_calls: u64,
    pub daily_api_limit: u64,
}

/// Derived rows for one document before they are persisted.
struct Structured {
    segments: Vec<TextSegment>,
    tables: Vec<Table>,
    key_values: Vec<KeyValue>,
    chunks: Vec<Chunk>,
}

pub struct DocumentPipeline {
    config: PipelineConfig,
    store: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorIndex>,
    keywords: Arc<dyn KeywordIndex>,
    embeddings: EmbeddingPipeline,
    chunker: Chunker,
}

impl DocumentPipeline {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn EmbeddingProvider>,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorIndex>,
        keywords: Arc<dyn KeywordIndex>,
    ) -> Result<Self, IngestError> {
        let embeddings = EmbeddingPipeline::new(
            config.embedding.clone(),
            provider,
            limiter,
            store.clone(),
            vectors.clone(),
            keywords.clone(),
        )?;
        let chunker = Chunker::new(config.chunking.clone())?;

        Ok(Self {
            config,
            store,
            vectors,
            keywords,
            embeddings,
            chunker,
        })
    }

    /// Swaps the chunker's tokenizer, e.g. for offline runs.
    pub fn with_token_counter(mut self, counter: TokenCounter) -> Result<Self, IngestError> {
        self.chunker = Chunker::with_counter(self.config.chunking.clone(), counter)?;
        Ok(self)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn embeddings(&self) -> &EmbeddingPipeline {
        &self.embeddings
    }

    /// Creates the pending document row with its checksum and source path.
    pub async fn register(&self, path: &Path) -> Result<Document, IngestError> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
        let file_type = FileType::from_path(path)
            .ok_or_else(|| IngestError::UnsupportedFileType(filename.clone()))?;

        let mut document = Document::new(filename, file_type);
        document
            .metadata
            .insert("checksum".to_string(), Value::String(digest_file(path)?));
        document.metadata.insert(
            "source_path".to_string(),
            Value::String(path.to_string_lossy().to_string()),
        );
        self.store.save_document(&document).await?;
        Ok(document)
    }

    pub async fn ingest_file(&self, path: &Path) -> Result<ProcessingReport, IngestError> {
        let mut document = self.register(path).await?;
        self.process_document(&mut document, path).await
    }

    /// Best effort over a folder: files that cannot even be registered are listed as skipped.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<FolderReport, IngestError> {
        let files = discover_documents(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }

        let mut report = FolderReport::default();
        for path in files {
            match self.ingest_file(&path).await {
                Ok(processed) => report.reports.push(processed),
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping file");
                    report.skipped_files.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Runs one pending document to `completed` or `failed`.
    ///
    /// Only an extraction failure fails the document. Embedding problems lower coverage and
    /// show up in the report's `errors`; store errors abort the run and are returned.
    pub async fn process_document(
        &self,
        document: &mut Document,
        path: &Path,
    ) -> Result<ProcessingReport, IngestError> {
        document.transition(DocumentStatus::Processing)?;
        self.store.save_document(document).await?;
        info!(document_id = %document.id, filename = %document.filename, "processing document");

        match self.run(document, path).await {
            Ok(report) => Ok(report),
            Err(failure) => {
                error!(document_id = %document.id, error = %failure, "processing aborted");
                document.fail(failure.to_string());
                if let Err(save_error) = self.store.save_document(document).await {
                    warn!(document_id = %document.id, error = %save_error, "could not record failure");
                }
                Err(failure)
            }
        }
    }

    async fn run(
        &self,
        document: &mut Document,
        path: &Path,
    ) -> Result<ProcessingReport, IngestError> {
        let owned_path = path.to_path_buf();
        let file_type = document.file_type;
        let extracted =
            tokio::task::spawn_blocking(move || extract_document(&owned_path, file_type))
                .await
                .map_err(|error| IngestError::Extraction(format!("extraction task failed: {error}")))?;

        if let Some(marker) = extracted.error_marker() {
            warn!(document_id = %document.id, marker, "extraction failed");
            document.fail(marker);
            self.store.save_document(document).await?;

            let mut report = ProcessingReport::new(document);
            report.errors.push(marker.to_string());
            return Ok(report);
        }

        let mut structured = self.structure(&document.id, &extracted);
        let mut report = ProcessingReport::new(document);
        if let Err(failure) = self.pull_key_values(&document.id, &extracted, &mut structured) {
            warn!(document_id = %document.id, error = %failure, "key-value extraction failed");
            report.errors.push(failure.to_string());
        }
        report.segments = structured.segments.len();
        report.tables = structured.tables.len();
        report.key_values = structured.key_values.len();
        report.chunks = structured.chunks.len();

        self.store.save_segments(&structured.segments).await?;
        let records: Vec<_> = structured
            .segments
            .iter()
            .map(|segment| segment.to_record(document))
            .collect();
        self.keywords.index_records(&records).await?;
        self.store.save_tables(&structured.tables).await?;
        self.store.save_key_values(&structured.key_values).await?;

        document.metadata.insert(
            "extraction_summary".to_string(),
            extraction_summary(&extracted, &structured),
        );
        document.transition(DocumentStatus::Completed)?;
        self.store.save_document(document).await?;
        info!(
            document_id = %document.id,
            segments = report.segments,
            tables = report.tables,
            key_values = report.key_values,
            chunks = report.chunks,
            "document structured"
        );

        if self.config.embedding.enable_auto_embeddings {
            let embedded = match self.config.embedding.index_unit {
                IndexUnit::Segments => {
                    self.embeddings
                        .embed_document(document, EmbedOptions::default())
                        .await
                }
                IndexUnit::Chunks => {
                    self.embeddings
                        .embed_chunks(document, &mut structured.chunks, EmbedOptions::default())
                        .await
                }
            };
            match embedded {
                Ok(embedding) => {
                    report.errors.extend(embedding.errors.iter().cloned());
                    report.embedding = Some(embedding);
                }
                Err(failure) => {
                    warn!(document_id = %document.id, error = %failure, "embedding run failed");
                    report.errors.push(format!("embedding failed: {failure}"));
                }
            }
        }

        report.status = document.status;
        Ok(report)
    }

    fn structure(&self, document_id: &str, extracted: &ExtractedDocument) -> Structured {
        let raw_text = extracted.raw_text();

        let segments = if raw_text.trim().is_empty() {
            segment_datasets(extracted, &self.config)
        } else {
            segment(&raw_text, &self.config.segmenter)
        }
        .into_iter()
        .map(|segment| TextSegment::from_segment(document_id, segment))
        .collect();

        Structured {
            segments,
            // One table pass only, so the same rows are never typed twice.
            tables: self.detect_tables(document_id, extracted, &raw_text),
            key_values: Vec::new(),
            chunks: self.chunker.chunk(document_id, extracted),
        }
    }

    /// Datasets from the extractor win; otherwise whole-text CSV, otherwise the line scan.
    fn detect_tables(
        &self,
        document_id: &str,
        extracted: &ExtractedDocument,
        raw_text: &str,
    ) -> Vec<Table> {
        if !extracted.tables.is_empty() {
            return extracted
                .tables
                .iter()
                .enumerate()
                .map(|(index, dataset)| {
                    build_table(
                        document_id,
                        index,
                        dataset.sheet_name.clone(),
                        dataset.rows.clone(),
                        true,
                    )
                })
                .collect();
        }

        if let Some(delimiter) =
            detect_tabular(raw_text, self.config.segmenter.tabular_probe_lines)
        {
            let rows: Vec<Vec<String>> = raw_text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| split_delimited(line, delimiter))
                .collect();
            return vec![build_table(document_id, 0, "Table_1", rows, true)];
        }

        extract_tables(document_id, raw_text)
    }

    fn pull_key_values(
        &self,
        document_id: &str,
        extracted: &ExtractedDocument,
        structured: &mut Structured,
    ) -> Result<(), IngestError> {
        let normalized = clean_text(&extracted.raw_text());
        if normalized.is_empty() {
            return Ok(());
        }
        structured.key_values = extract_key_values(document_id, &normalized)?;
        Ok(())
    }

    /// Clears every derived row and index entry, then runs the pipeline again.
    pub async fn reprocess(&self, document_id: &str) -> Result<ProcessingReport, IngestError> {
        let mut document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| SearchError::NotFound(format!("document {document_id}")))?;
        let path = document
            .metadata
            .get("source_path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| {
                IngestError::InvalidArgument(format!(
                    "document {document_id} has no recorded source path"
                ))
            })?;

        self.store.clear_derived(document_id).await?;
        self.vectors.delete_document_vectors(document_id).await?;
        self.keywords.delete_document_records(document_id).await?;

        document.reset_for_reprocess();
        if let Ok(checksum) = digest_file(&path) {
            document
                .metadata
                .insert("checksum".to_string(), Value::String(checksum));
        }
        self.store.save_document(&document).await?;
        info!(document_id, path = %path.display(), "reprocessing document");

        self.process_document(&mut document, &path).await
    }

    pub async fn document_summary(&self, document_id: &str) -> Result<DocumentSummary, IngestError> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| SearchError::NotFound(format!("document {document_id}")))?;
        let segments = self.store.segments(document_id).await?;
        let tables = self.store.tables(document_id).await?;
        let key_values = self.store.key_values(document_id).await?;

        let mut segment_types = BTreeMap::new();
        for segment in &segments {
            *segment_types
                .entry(segment.segment_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        Ok(DocumentSummary {
            segment_count: segments.len(),
            embedded_segments: segments
                .iter()
                .filter(|segment| segment.embedding.is_some())
                .count(),
            segment_types,
            table_count: tables.len(),
            key_value_count: key_values.len(),
            sample_segments: segments
                .iter()
                .take(SAMPLE_SEGMENTS)
                .map(|segment| segment.content.chars().take(SAMPLE_CHARS).collect())
                .collect(),
            sample_key_values: key_values
                .iter()
                .take(SAMPLE_KEY_VALUES)
                .map(|pair| (pair.key_name.clone(), pair.value.text_value.clone()))
                .collect(),
            document,
        })
    }

    pub async fn stats(&self) -> Result<PipelineStats, IngestError> {
        let documents = self.store.list_documents().await?;
        let mut stats = PipelineStats {
            total_documents: documents.len(),
            daily_api_calls: self.embeddings.limiter().count(),
            daily_api_limit: self.embeddings.limiter().limit(),
            ..PipelineStats::default()
        };

        for document in &documents {
            *stats
                .by_status
                .entry(document.status.to_string())
                .or_insert(0) += 1;
            *stats
                .by_file_type
                .entry(document.file_type.to_string())
                .or_insert(0) += 1;

            let segments = self.store.segments(&document.id).await?;
            stats.total_segments += segments.len();
            stats.embedded_segments += segments
                .iter()
                .filter(|segment| segment.embedding.is_some())
                .count();
        }
        Ok(stats)
    }
}

/// Each dataset is segmented on its own, with sequence numbers continuing across sheets
/// and section titles prefixed by the sheet name.
fn segment_datasets(extracted: &ExtractedDocument, config: &PipelineConfig) -> Vec<Segment> {
    let mut segments = Vec::new();
    for dataset in &extracted.tables {
        for mut piece in segment_dataset(&dataset.rows, &config.segmenter) {
            piece.sequence_number = segments.len() as u32;
            piece.section_title = Some(match piece.section_title.take() {
                Some(title) => format!("{} - {title}", dataset.sheet_name),
                None => dataset.sheet_name.clone(),
            });
            segments.push(piece);
        }
    }
    segments
}

fn extraction_summary(extracted: &ExtractedDocument, structured: &Structured) -> Value {
    let mut segment_types: BTreeMap<&str, usize> = BTreeMap::new();
    for segment in &structured.segments {
        *segment_types.entry(segment.segment_type.as_str()).or_insert(0) += 1;
    }

    json!({
        "pages": extracted.pages.len(),
        "datasets": extracted.tables.len(),
        "segments": structured.segments.len(),
        "segment_types": segment_types,
        "tables": structured.tables.len(),
        "key_values": structured.key_values.len(),
        "chunks": structured.chunks.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::whitespace_counter;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::SegmentType;
    use crate::stores::MemoryStore;
    use tempfile::tempdir;

    fn pipeline(config: PipelineConfig) -> (DocumentPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(CharacterNgramEmbedder {
            dimensions: config.embedding.dimensions,
        });
        let pipeline = DocumentPipeline::new(
            config,
            provider,
            Arc::new(RateLimiter::new(1_000)),
            store.clone(),
            store.clone(),
            store.clone(),
        )
        .and_then(|pipeline| pipeline.with_token_counter(whitespace_counter()))
        .expect("pipeline");
        (pipeline, store)
    }

    fn offline_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.embedding.dimensions = 16;
        config.embedding.batch_pause_ms = 0;
        config.embedding.retry_delay_ms = 0;
        config
    }

    #[test]
    fn discovery_keeps_supported_files_only() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("nested/a.CSV"), "x,y").unwrap();
        fs::write(dir.path().join("image.png"), "png").unwrap();

        let found = discover_documents(dir.path());
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|path| FileType::from_path(path).is_some()));
    }

    #[test]
    fn digest_is_hex_sha256() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            digest_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn text_document_is_structured_and_indexed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("maintenance.txt");
        fs::write(
            &path,
            "PUMP MAINTENANCE\n\nOperating Pressure: 4.5\nService Date: 2024-03-01\n\n\
             Inspect the impeller every quarter and record any vibration readings in the log.",
        )
        .unwrap();

        let (pipeline, store) = pipeline(offline_config());
        let report = pipeline.ingest_file(&path).await.unwrap();

        assert_eq!(report.status, DocumentStatus::Completed);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.key_values, 2);

        let segments = store.segments(&report.document_id).await.unwrap();
        assert_eq!(segments[0].segment_type, SegmentType::Heading);
        assert!(segments.iter().any(|segment| segment.embedding.is_some()));

        let document = store.get_document(&report.document_id).await.unwrap().unwrap();
        assert_eq!(document.metadata["extraction_summary"]["key_values"], 2);
        assert!(document.metadata.contains_key("checksum"));
        assert!(document.metadata.contains_key("embedding_status"));
    }

    #[tokio::test]
    async fn key_values_come_from_normalized_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rota.txt");
        fs::write(
            &path,
            "Shift  Lead:\tDana   Ortiz\n\nThe night crew hands over at six in the morning.",
        )
        .unwrap();

        let mut config = offline_config();
        config.embedding.enable_auto_embeddings = false;
        let (pipeline, store) = pipeline(config);
        let report = pipeline.ingest_file(&path).await.unwrap();

        let pairs = store.key_values(&report.document_id).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key_name, "Shift Lead");
        assert_eq!(pairs[0].value.text_value, "Dana Ortiz");
    }

    #[tokio::test]
    async fn extraction_marker_fails_the_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.pdf");
        fs::write(&path, b"not a pdf").unwrap();

        let (pipeline, store) = pipeline(offline_config());
        let report = pipeline.ingest_file(&path).await.unwrap();

        assert_eq!(report.status, DocumentStatus::Failed);
        assert!(report.errors[0].starts_with("[PdfExtractor Error]"));
        assert!(store.segments(&report.document_id).await.unwrap().is_empty());
        let document = store.get_document(&report.document_id).await.unwrap().unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn csv_document_becomes_summary_rows_and_typed_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fleet.csv");
        fs::write(&path, "name,year,active\nAtlas,2019,yes\nBorealis,2021,no\n").unwrap();

        let mut config = offline_config();
        config.embedding.enable_auto_embeddings = false;
        let (pipeline, store) = pipeline(config);
        let report = pipeline.ingest_file(&path).await.unwrap();

        let segments = store.segments(&report.document_id).await.unwrap();
        assert_eq!(segments[0].segment_type, SegmentType::DataSummary);
        assert_eq!(
            segments
                .iter()
                .filter(|segment| segment.segment_type == SegmentType::DataRow)
                .count(),
            2
        );

        let tables = store.tables(&report.document_id).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "fleet");
        assert_eq!(tables[0].cells.len(), 6);
        assert_eq!(report.chunks, 1);
        assert!(report.embedding.is_none());
    }

    fn write_workbook(path: &Path) {
        use std::io::Write;

        let sheet = |rows: String| {
            format!(r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{rows}</sheetData></worksheet>"#)
        };
        let text = |cell: &str, value: &str| {
            format!(r#"<c r="{cell}" t="inlineStr"><is><t>{value}</t></is></c>"#)
        };
        let fleet = sheet(format!(
            r#"<row r="1">{}{}</row><row r="3">{}<c r="B3"><v>2019</v></c></row><row r="4">{}<c r="B4"><v>2021.5</v></c></row>"#,
            text("A1", "name"),
            text("B1", "year"),
            text("A3", "Atlas"),
            text("A4", "Borealis"),
        ));
        let crew = sheet(format!(
            r#"<row r="1">{}{}</row><row r="2">{}<c r="B2" t="b"><v>1</v></c></row>"#,
            text("A1", "role"),
            text("B1", "active"),
            text("A2", "Pilot"),
        ));
        let entries = [
            (
                "xl/workbook.xml",
                r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Fleet" sheetId="1" r:id="rId1"/><sheet name="Crew" sheetId="2" r:id="rId2"/></sheets></workbook>"#.to_string(),
            ),
            (
                "xl/_rels/workbook.xml.rels",
                r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Target="worksheets/sheet2.xml"/></Relationships>"#.to_string(),
            ),
            ("xl/worksheets/sheet1.xml", fleet),
            ("xl/worksheets/sheet2.xml", crew),
        ];

        let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, body) in entries {
            writer.start_file(name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn workbook_sheets_become_numbered_segments_and_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("operations.xlsx");
        write_workbook(&path);

        let mut config = offline_config();
        config.embedding.enable_auto_embeddings = false;
        let (pipeline, store) = pipeline(config);
        let report = pipeline.ingest_file(&path).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Completed, "{:?}", report.errors);

        let segments = store.segments(&report.document_id).await.unwrap();
        let sequence: Vec<u32> = segments.iter().map(|segment| segment.sequence_number).collect();
        assert_eq!(sequence, vec![0, 1, 2, 3, 4]);
        assert_eq!(segments[0].segment_type, SegmentType::DataSummary);
        assert_eq!(
            segments[0].section_title.as_deref(),
            Some("Fleet - Dataset overview")
        );
        assert_eq!(segments[1].content, "name: Atlas; year: 2019");
        assert_eq!(segments[2].content, "name: Borealis; year: 2021.5");
        assert_eq!(segments[3].section_title.as_deref(), Some("Crew - Dataset overview"));
        assert_eq!(segments[4].content, "role: Pilot; active: true");
        assert_eq!(segments[4].section_title.as_deref(), Some("Crew - Row 1"));

        let tables = store.tables(&report.document_id).await.unwrap();
        let names: Vec<&str> = tables.iter().map(|table| table.name.as_str()).collect();
        assert_eq!(names, vec!["Fleet", "Crew"]);
        assert_eq!(tables[0].cells.len(), 4);
        assert_eq!(report.chunks, 2);
    }

    #[tokio::test]
    async fn reprocess_replaces_derived_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "Owner: Operations team\n\nA short paragraph about nothing much.").unwrap();

        let (pipeline, store) = pipeline(offline_config());
        let first = pipeline.ingest_file(&path).await.unwrap();
        let before = store.key_values(&first.document_id).await.unwrap().len();

        fs::write(&path, "Completely different text without any pairs in it at all.").unwrap();
        let second = pipeline.reprocess(&first.document_id).await.unwrap();

        assert_eq!(second.document_id, first.document_id);
        assert_eq!(before, 1);
        assert!(store.key_values(&first.document_id).await.unwrap().is_empty());
        let segments = store.segments(&first.document_id).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].content.starts_with("Completely"));

        let stats = pipeline.stats().await.unwrap();
        assert_eq!(stats.total_documents, 1);
        assert_eq!(stats.by_status.get("completed"), Some(&1));

        let summary = pipeline.document_summary(&first.document_id).await.unwrap();
        assert_eq!(summary.segment_count, 1);
        assert_eq!(summary.key_value_count, 0);
    }

    #[tokio::test]
    async fn unsupported_files_are_rejected_at_registration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.png");
        fs::write(&path, "png").unwrap();
        let (pipeline, _) = pipeline(offline_config());
        assert!(matches!(
            pipeline.ingest_file(&path).await,
            Err(IngestError::UnsupportedFileType(_))
        ));
    }
}
