//! Token-bounded chunking for flowing pages and extracted datasets.
//!
//! Token counting uses the `cl100k_base` encoding (the one behind the default OpenAI
//! embedding model) and falls back to a whitespace counter if the encoding cannot load.

use crate::config::ChunkingConfig;
use crate::error::IngestError;
use crate::extractor::{ExtractedDocument, ExtractedTable};
use crate::models::{Chunk, ChunkKind, ChunkMetadata};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

const OUTLINE_HEADING: &str = r"^\d+(?:\.\d+)*\.?\s+\S";
const ID_CODE: &str = r"^[A-Z0-9][A-Z0-9._/\-]*$";
const BOILERPLATE_PREFIXES: [&str; 7] = [
    "page ",
    "copyright",
    "confidential",
    "all rights reserved",
    "table of contents",
    "printed on",
    "document no",
];

pub fn cl100k_counter() -> TokenCounter {
    match tiktoken_rs::cl100k_base() {
        Ok(encoding) => {
            let encoding = Arc::new(encoding);
            Arc::new(move |text: &str| encoding.encode_ordinary(text).len())
        }
        Err(error) => {
            warn!(error = %error, "cl100k_base unavailable; falling back to whitespace token counter");
            whitespace_counter()
        }
    }
}

pub fn whitespace_counter() -> TokenCounter {
    Arc::new(|text: &str| {
        let tokens = text.split_whitespace().count();
        if tokens == 0 && !text.trim().is_empty() {
            1
        } else {
            tokens
        }
    })
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// A heading after boilerplate filtering and stitching; offsets are byte positions in the page.
#[derive(Debug, Clone, PartialEq)]
pub struct Heading {
    pub start: usize,
    pub end: usize,
    pub label: String,
}

pub struct Chunker {
    config: ChunkingConfig,
    counter: TokenCounter,
    outline_re: Regex,
    id_code_re: Regex,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        Self::with_counter(config, cl100k_counter())
    }

    pub fn with_counter(config: ChunkingConfig, counter: TokenCounter) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self {
            config,
            counter,
            outline_re: Regex::new(OUTLINE_HEADING)?,
            id_code_re: Regex::new(ID_CODE)?,
        })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        (self.counter)(text)
    }

    /// Pages first, then datasets; `chunk_index` runs across the whole document.
    pub fn chunk(&self, document_id: &str, extracted: &ExtractedDocument) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        for page in &extracted.pages {
            let start = chunks.len();
            chunks.extend(self.chunk_text(document_id, &page.source, page.page, &page.text, start));
        }
        for table in &extracted.tables {
            let start = chunks.len();
            chunks.extend(self.chunk_table(document_id, table, start));
        }

        debug!(document_id, chunks = chunks.len(), "chunked document");
        chunks
    }

    pub fn detect_headings(&self, text: &str) -> Vec<Heading> {
        let mut raw = Vec::new();
        let mut offset = 0usize;

        for line in text.split_inclusive('\n') {
            let trimmed = line.trim();
            if !trimmed.is_empty() && self.is_heading(trimmed) && !self.is_boilerplate(trimmed) {
                let leading = line.len() - line.trim_start().len();
                let start = offset + leading;
                raw.push(Heading {
                    start,
                    end: start + trimmed.len(),
                    label: trimmed.to_string(),
                });
            }
            offset += line.len();
        }

        let mut stitched: Vec<Heading> = Vec::new();
        for heading in raw {
            let joinable = stitched.last().is_some_and(|previous| {
                heading.start.saturating_sub(previous.end) <= self.config.heading_stitch_window
                    && self.gap_is_blank(&text[previous.end..heading.start])
            });
            match stitched.last_mut() {
                Some(previous) if joinable => {
                    previous.label = format!("{} {}", previous.label, heading.label);
                    previous.end = heading.end;
                }
                _ => stitched.push(heading),
            }
        }
        stitched
    }

    /// Body text between two headings keeps them apart; only blank or boilerplate lines may sit there.
    fn gap_is_blank(&self, gap: &str) -> bool {
        gap.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .all(|line| self.is_boilerplate(line))
    }

    fn is_heading(&self, line: &str) -> bool {
        if self.outline_re.is_match(line) {
            return true;
        }
        line.chars().count() > 10
            && line.chars().any(char::is_alphabetic)
            && !line.chars().any(char::is_lowercase)
    }

    fn is_boilerplate(&self, line: &str) -> bool {
        if self.id_code_re.is_match(line) || self.count_tokens(line) < 2 {
            return true;
        }
        let lowered = line.to_lowercase();
        BOILERPLATE_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
    }

    pub fn chunk_text(
        &self,
        document_id: &str,
        source: &str,
        page: Option<u32>,
        text: &str,
        start_index: usize,
    ) -> Vec<Chunk> {
        let headings = self.detect_headings(text);
        let mut sections: Vec<(String, &str)> = Vec::new();

        match headings.first() {
            None => sections.push((self.config.default_section.clone(), text)),
            Some(first) => {
                sections.push((self.config.default_section.clone(), &text[..first.start]));
                for (index, heading) in headings.iter().enumerate() {
                    let body_end = headings
                        .get(index + 1)
                        .map(|next| next.start)
                        .unwrap_or(text.len());
                    sections.push((heading.label.clone(), &text[heading.end..body_end]));
                }
            }
        }

        let mut chunks = Vec::new();
        for (label, body) in sections {
            for piece in self.window(&normalize_whitespace(body)) {
                let chunk_index = start_index + chunks.len();
                chunks.push(Chunk {
                    chunk_id: make_chunk_id(document_id, page.unwrap_or(0), chunk_index, &piece),
                    token_count: self.count_tokens(&piece),
                    metadata: ChunkMetadata {
                        source: source.to_string(),
                        page,
                        section: label.clone(),
                        chunk_index,
                        kind: ChunkKind::Text,
                        part: None,
                        row_range: None,
                    },
                    text: piece,
                    embedding: None,
                });
            }
        }
        chunks
    }

    /// Word-aligned sliding window. A single word above the target forms its own piece.
    fn window(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Vec::new();
        }

        let costs: Vec<usize> = words
            .iter()
            .map(|word| self.count_tokens(word).max(1))
            .collect();
        let target = self.config.target_tokens;
        let overlap = self.config.overlap_tokens;

        let mut pieces = Vec::new();
        let mut start = 0usize;
        loop {
            let mut end = start;
            let mut used = 0usize;
            while end < words.len() && (end == start || used + costs[end] <= target) {
                used += costs[end];
                end += 1;
            }
            pieces.push(words[start..end].join(" "));
            if end >= words.len() {
                break;
            }

            let mut next = end;
            let mut carried = 0usize;
            while next > start + 1 && carried + costs[next - 1] <= overlap {
                carried += costs[next - 1];
                next -= 1;
            }
            start = next;
        }
        pieces
    }

    /// The first row of the dataset is its header; data rows are numbered from 0.
    pub fn chunk_table(
        &self,
        document_id: &str,
        table: &ExtractedTable,
        start_index: usize,
    ) -> Vec<Chunk> {
        let Some((headers, data_rows)) = table.rows.split_first() else {
            return Vec::new();
        };
        let row_count = data_rows.len();
        let header_line = format!(
            "Dataset: {}. Columns: {}",
            table.sheet_name,
            headers.join(", ")
        );
        let serialized: Vec<String> = data_rows
            .iter()
            .map(|row| serialize_row(headers, row))
            .collect();

        let sample_count = self.config.table_sample_rows.min(row_count);
        let mut whole = header_line.clone();
        if sample_count > 0 {
            whole.push_str("\nSample rows:\n");
            whole.push_str(&serialized[..sample_count].join("\n"));
        }
        if row_count > 0 {
            whole.push_str("\nRows:\n");
            whole.push_str(&serialized.join("\n"));
        }

        let total_tokens = self.count_tokens(&whole);
        if total_tokens <= self.config.safe_table_tokens || row_count == 0 {
            return vec![self.table_chunk(
                document_id,
                &table.sheet_name,
                start_index,
                whole,
                total_tokens,
                ChunkKind::Table,
                None,
                (0, row_count),
            )];
        }

        let batch = self.config.table_row_batch;
        let parts = row_count.div_ceil(batch);
        debug!(
            table = %table.sheet_name,
            total_tokens,
            parts,
            "splitting oversized dataset"
        );

        (0..parts)
            .map(|part| {
                let row_start = part * batch;
                let row_end = (row_start + batch).min(row_count);
                let text = format!(
                    "{header_line} (part {} of {parts}, rows {row_start} to {})\n{}",
                    part + 1,
                    row_end - 1,
                    serialized[row_start..row_end].join("\n")
                );
                let tokens = self.count_tokens(&text);
                self.table_chunk(
                    document_id,
                    &table.sheet_name,
                    start_index + part,
                    text,
                    tokens,
                    ChunkKind::TablePart,
                    Some((part + 1, parts)),
                    (row_start, row_end),
                )
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn table_chunk(
        &self,
        document_id: &str,
        sheet_name: &str,
        chunk_index: usize,
        text: String,
        token_count: usize,
        kind: ChunkKind,
        part: Option<(usize, usize)>,
        row_range: (usize, usize),
    ) -> Chunk {
        Chunk {
            chunk_id: make_chunk_id(document_id, 0, chunk_index, &text),
            text,
            token_count,
            metadata: ChunkMetadata {
                source: sheet_name.to_string(),
                page: None,
                section: sheet_name.to_string(),
                chunk_index,
                kind,
                part,
                row_range: Some(row_range),
            },
            embedding: None,
        }
    }
}

fn serialize_row(headers: &[String], row: &[String]) -> String {
    headers
        .iter()
        .zip(row.iter())
        .map(|(header, value)| format!("{header}: {value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn make_chunk_id(document_id: &str, page: u32, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExtractedPage;

    fn chunker(config: ChunkingConfig) -> Chunker {
        Chunker::with_counter(config, whitespace_counter()).unwrap()
    }

    fn small_config() -> ChunkingConfig {
        ChunkingConfig {
            target_tokens: 10,
            overlap_tokens: 3,
            table_row_batch: 4,
            safe_table_tokens: 40,
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn outline_and_caps_headings_are_found() {
        let chunker = chunker(ChunkingConfig::default());
        let text = "2.4.2 Pump Curves\nbody text here that runs long enough to separate the headings from each other\nSAFETY REQUIREMENTS\nmore body";
        let labels: Vec<_> = chunker
            .detect_headings(text)
            .into_iter()
            .map(|heading| heading.label)
            .collect();
        assert_eq!(labels, vec!["2.4.2 Pump Curves", "SAFETY REQUIREMENTS"]);
    }

    #[test]
    fn boilerplate_headings_are_filtered() {
        let chunker = chunker(ChunkingConfig::default());
        let text = "DOC-2024-0001\nbody\nCONFIDENTIAL MATERIAL\nbody\nPAGE 4 OF 10\nbody\nSUMMARIZATION\nbody";
        assert!(chunker.detect_headings(text).is_empty());
    }

    #[test]
    fn nearby_headings_are_stitched() {
        let chunker = chunker(ChunkingConfig::default());
        let text = "ANNUAL OPERATIONS REPORT\n1 Introduction\nThe plant ran all year.";
        let headings = chunker.detect_headings(text);
        assert_eq!(headings.len(), 1);
        assert_eq!(headings[0].label, "ANNUAL OPERATIONS REPORT 1 Introduction");
    }

    #[test]
    fn body_between_headings_is_kept() {
        let chunker = chunker(ChunkingConfig::default());
        let text = "ANNUAL OPERATIONS REPORT\nPrepared by ops\nSAFETY REQUIREMENTS\nWear gloves at all times.";
        let chunks = chunker.chunk_text("doc", "report.txt", Some(1), text, 0);

        let sections: Vec<_> = chunks.iter().map(|chunk| chunk.metadata.section.as_str()).collect();
        let texts: Vec<_> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        assert_eq!(sections, vec!["ANNUAL OPERATIONS REPORT", "SAFETY REQUIREMENTS"]);
        assert_eq!(texts, vec!["Prepared by ops", "Wear gloves at all times."]);
    }

    #[test]
    fn boilerplate_gap_still_stitches() {
        let chunker = chunker(ChunkingConfig::default());
        let text = "ANNUAL OPERATIONS REPORT\nPage 2\nSAFETY REQUIREMENTS\nWear gloves at all times.";
        let headings = chunker.detect_headings(text);
        assert_eq!(headings.len(), 1);
        assert_eq!(headings[0].label, "ANNUAL OPERATIONS REPORT SAFETY REQUIREMENTS");
    }

    #[test]
    fn text_without_headings_uses_default_section() {
        let chunker = chunker(ChunkingConfig::default());
        let chunks = chunker.chunk_text("doc", "notes.txt", Some(1), "just some plain words", 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.section, "Document");
        assert_eq!(chunks[0].token_count, 4);
    }

    #[test]
    fn sliding_window_respects_budget_and_overlaps() {
        let chunker = chunker(small_config());
        let text = (0..35).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunker.chunk_text("doc", "a.txt", None, &text, 0);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 10 + 3);
        }
        let first: Vec<&str> = chunks[0].text.split(' ').collect();
        let second: Vec<&str> = chunks[1].text.split(' ').collect();
        assert_eq!(&first[first.len() - 3..], &second[..3]);
        assert!(chunks.last().unwrap().text.ends_with("w34"));
        let indexes: Vec<_> = chunks.iter().map(|chunk| chunk.metadata.chunk_index).collect();
        assert_eq!(indexes, (0..chunks.len()).collect::<Vec<_>>());
    }

    #[test]
    fn sections_label_their_pieces() {
        let chunker = chunker(ChunkingConfig::default());
        let text = "Preface words\n1 Scope\nScope body words that run on for a while to move past the stitch window\n2 Terms\nTerms body";
        let chunks = chunker.chunk_text("doc", "manual.pdf", Some(2), text, 0);
        let sections: Vec<_> = chunks.iter().map(|chunk| chunk.metadata.section.as_str()).collect();
        assert_eq!(sections, vec!["Document", "1 Scope", "2 Terms"]);
        assert_eq!(chunks[2].text, "Terms body");
    }

    fn dataset(rows: usize) -> ExtractedTable {
        let mut data = vec![vec!["id".to_string(), "name".to_string()]];
        for index in 0..rows {
            data.push(vec![index.to_string(), format!("item{index}")]);
        }
        ExtractedTable {
            sheet_name: "Inventory".to_string(),
            rows: data,
        }
    }

    #[test]
    fn small_tables_fit_one_chunk() {
        let chunker = chunker(ChunkingConfig::default());
        let chunks = chunker.chunk_table("doc", &dataset(3), 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.kind, ChunkKind::Table);
        assert_eq!(chunks[0].metadata.row_range, Some((0, 3)));
        assert!(chunks[0].text.starts_with("Dataset: Inventory. Columns: id, name"));
        assert!(chunks[0].text.contains("Sample rows:"));
    }

    #[test]
    fn oversized_tables_split_into_covering_parts() {
        let chunker = chunker(small_config());
        let chunks = chunker.chunk_table("doc", &dataset(10), 5);

        assert_eq!(chunks.len(), 3);
        let mut expected_start = 0;
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.kind, ChunkKind::TablePart);
            assert_eq!(chunk.metadata.part, Some((index + 1, 3)));
            assert_eq!(chunk.metadata.chunk_index, 5 + index);
            let (start, end) = chunk.metadata.row_range.unwrap();
            assert_eq!(start, expected_start);
            assert!(end > start);
            expected_start = end;
        }
        assert_eq!(expected_start, 10);
        assert!(chunks[1].text.contains("(part 2 of 3, rows 4 to 7)"));
    }

    #[test]
    fn header_only_dataset_still_yields_a_chunk() {
        let chunker = chunker(ChunkingConfig {
            safe_table_tokens: 2,
            ..small_config()
        });
        let chunks = chunker.chunk_table("doc", &dataset(0), 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.kind, ChunkKind::Table);
        assert_eq!(chunks[0].metadata.row_range, Some((0, 0)));
        assert_eq!(chunks[0].text, "Dataset: Inventory. Columns: id, name");
    }

    #[test]
    fn documents_chunk_pages_then_tables() {
        let chunker = chunker(ChunkingConfig::default());
        let extracted = ExtractedDocument {
            pages: vec![ExtractedPage {
                text: "A page of text".to_string(),
                source: "report.pdf".to_string(),
                page: Some(1),
            }],
            tables: vec![dataset(2)],
        };
        let chunks = chunker.chunk("doc", &extracted);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.kind, ChunkKind::Text);
        assert_eq!(chunks[1].metadata.chunk_index, 1);
        assert_ne!(chunks[0].chunk_id, chunks[1].chunk_id);
    }
}
