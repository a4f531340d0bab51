//! Structural segmentation of extracted text.
//!
//! Delimited data (CSV/TSV-like) becomes one summary segment plus one segment per row.
//! Everything else is split into paragraphs and each paragraph is labelled by [`classify`].

use crate::config::SegmenterConfig;
use crate::models::{Segment, SegmentType};
use std::collections::HashSet;

const KEY_COLUMN_HINTS: [&str; 12] = [
    "name",
    "title",
    "model",
    "category",
    "type",
    "brand",
    "product",
    "make",
    "class",
    "status",
    "region",
    "department",
];

const MAX_SECTION_TITLE_CHARS: usize = 500;
const SHORT_SEGMENT_CHARS: usize = 100;
const MAX_TITLE_WORDS: usize = 10;
const MIN_TABULAR_LINES: usize = 3;
const MAX_TABULAR_CELL_CHARS: usize = 120;

pub fn segment(raw_text: &str, config: &SegmenterConfig) -> Vec<Segment> {
    let unified = raw_text.replace("\r\n", "\n").replace('\r', "\n");

    if let Some(delimiter) = detect_tabular(&unified, config.tabular_probe_lines) {
        return segment_tabular(&unified, delimiter, config);
    }

    segment_flowing(&clean_text(&unified), config)
}

/// Collapses runs of spaces and tabs, drops page furniture lines and keeps newlines.
pub fn clean_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(collapse_inline_whitespace)
        .filter(|line| !is_page_furniture(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn collapse_inline_whitespace(line: &str) -> String {
    line.split([' ', '\t', '\u{a0}'])
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_page_furniture(line: &str) -> bool {
    let lowered = line.trim().to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let numeric = |word: &str| !word.is_empty() && word.chars().all(|ch| ch.is_ascii_digit());

    match words.as_slice() {
        ["page", n] => numeric(n),
        ["page", n, "of", m] => numeric(n) && numeric(m),
        [n, "of", m] => numeric(n) && numeric(m),
        _ => false,
    }
}

/// Returns the delimiter when the first `probe_lines` lines read like a table: at least
/// three lines, the first one row-like, and four in five sharing its delimiter count with
/// short cells and no sentence ending.
pub fn detect_tabular(text: &str, probe_lines: usize) -> Option<char> {
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(probe_lines.max(MIN_TABULAR_LINES))
        .collect();
    if lines.len() < MIN_TABULAR_LINES {
        return None;
    }

    let first = lines[0];
    let delimiter = if first.contains('\t') { '\t' } else { ',' };
    let expected = first.matches(delimiter).count();
    if expected == 0 || !row_like(first, delimiter, expected) {
        return None;
    }

    let consistent = lines
        .iter()
        .filter(|line| row_like(line, delimiter, expected))
        .count();

    (consistent * 5 >= lines.len() * 4).then_some(delimiter)
}

fn row_like(line: &str, delimiter: char, expected: usize) -> bool {
    let trimmed = line.trim_end();
    line.matches(delimiter).count() == expected
        && !trimmed.ends_with(['.', '!', '?'])
        && split_delimited(line, delimiter)
            .iter()
            .all(|cell| cell.chars().count() <= MAX_TABULAR_CELL_CHARS)
}

/// Splits one delimited line, honouring double-quoted fields.
pub fn split_delimited(line: &str, delimiter: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ch if ch == delimiter && !quoted => {
                cells.push(current.trim().to_string());
                current.clear();
            }
            ch => current.push(ch),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

fn segment_tabular(text: &str, delimiter: char, config: &SegmenterConfig) -> Vec<Segment> {
    let rows: Vec<Vec<String>> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| split_delimited(line, delimiter))
        .collect();
    segment_dataset(&rows, config)
}

/// Summary plus one segment per row for already parsed rows; `rows[0]` is the header.
pub fn segment_dataset(rows: &[Vec<String>], config: &SegmenterConfig) -> Vec<Segment> {
    let Some((headers, rows)) = rows.split_first() else {
        return Vec::new();
    };

    let mut segments = Vec::new();
    let mut sequence = 0u32;

    segments.push(Segment::new(
        sequence,
        build_data_summary(headers, rows, config),
        SegmentType::DataSummary,
        Some("Dataset overview".to_string()),
    ));
    sequence += 1;

    for (index, row) in rows.iter().take(config.max_data_rows).enumerate() {
        let content = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(header, value)| format!("{header}: {value}"))
            .collect::<Vec<_>>()
            .join("; ");

        if content.is_empty() {
            continue;
        }

        segments.push(Segment::new(
            sequence,
            content,
            SegmentType::DataRow,
            Some(format!("Row {}", index + 1)),
        ));
        sequence += 1;
    }

    segments
}

pub fn key_columns(headers: &[String]) -> Vec<usize> {
    headers
        .iter()
        .enumerate()
        .filter(|(_, header)| {
            let lowered = header.to_lowercase();
            KEY_COLUMN_HINTS.iter().any(|hint| lowered.contains(hint))
        })
        .map(|(index, _)| index)
        .collect()
}

fn build_data_summary(headers: &[String], rows: &[Vec<String>], config: &SegmenterConfig) -> String {
    let mut summary = format!(
        "Dataset with {} rows and {} columns: {}.",
        rows.len(),
        headers.len(),
        headers.join(", ")
    );

    for column in key_columns(headers) {
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        let mut overflow = 0usize;

        for row in rows.iter().take(config.summary_sample_rows) {
            let Some(value) = row.get(column).filter(|value| !value.is_empty()) else {
                continue;
            };
            if !seen.insert(value.as_str()) {
                continue;
            }
            if values.len() < config.max_unique_values {
                values.push(value.as_str());
            } else {
                overflow += 1;
            }
        }

        if values.is_empty() {
            continue;
        }

        summary.push_str(&format!("\n{}: {}", headers[column], values.join(", ")));
        if overflow > 0 {
            summary.push_str(&format!(" (and {overflow} more)"));
        }
    }

    summary
}

fn segment_flowing(cleaned: &str, config: &SegmenterConfig) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut sequence = 0u32;
    let mut current_section: Option<String> = None;

    for paragraph in split_paragraphs(cleaned) {
        let word_count = paragraph.split_whitespace().count();
        if paragraph.chars().count() < config.min_paragraph_chars
            || word_count < config.min_paragraph_words
        {
            continue;
        }

        let segment_type = classify(&paragraph);
        if matches!(segment_type, SegmentType::Heading | SegmentType::Title) {
            current_section = Some(paragraph.chars().take(MAX_SECTION_TITLE_CHARS).collect());
        }

        segments.push(Segment::new(
            sequence,
            paragraph,
            segment_type,
            current_section.clone(),
        ));
        sequence += 1;
    }

    segments
}

/// Blank lines first, then single newlines, then sentence ends.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let by_blank_line = split_on_blank_lines(text);
    if by_blank_line.len() > 1 {
        return by_blank_line;
    }

    let by_line: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if by_line.len() > 1 {
        return by_line;
    }

    split_sentences(text)
}

fn split_on_blank_lines(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        current.push(line.trim());
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
}

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        let at_boundary = matches!(ch, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if at_boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// The single place where paragraph heuristics live.
pub fn classify(text: &str) -> SegmentType {
    let trimmed = text.trim();
    let lowered = trimmed.to_lowercase();

    if trimmed.chars().count() < SHORT_SEGMENT_CHARS {
        if is_all_caps(trimmed) || numbered_heading(trimmed) {
            return SegmentType::Heading;
        }
        if looks_like_title(trimmed) {
            return SegmentType::Title;
        }
    }

    if bullet_prefix(trimmed) || numbered_prefix(trimmed).is_some() {
        return SegmentType::ListItem;
    }

    if caption_prefix(&lowered) {
        return SegmentType::TableCaption;
    }

    SegmentType::Paragraph
}

fn is_all_caps(text: &str) -> bool {
    let mut cased = text.chars().filter(|ch| ch.is_alphabetic()).peekable();
    cased.peek().is_some() && cased.all(|ch| !ch.is_lowercase())
}

/// `12. Rest` or `3 Rest` -> `Rest`.
fn numbered_prefix(text: &str) -> Option<&str> {
    let digits = text.chars().take_while(|ch| ch.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let mut rest = &text[digits..];
    rest = rest.strip_prefix('.').unwrap_or(rest);
    let trimmed = rest.trim_start();
    if trimmed.len() == rest.len() || trimmed.is_empty() {
        return None;
    }
    Some(trimmed)
}

fn numbered_heading(text: &str) -> bool {
    numbered_prefix(text)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|ch| ch.is_ascii_uppercase())
}

fn looks_like_title(text: &str) -> bool {
    text.chars().next().is_some_and(|ch| ch.is_ascii_uppercase())
        && !text.contains(['.', '!', '?'])
        && text.split_whitespace().count() <= MAX_TITLE_WORDS
}

fn bullet_prefix(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some('-' | '•' | '*'))
        && chars.next().is_some_and(char::is_whitespace)
}

fn caption_prefix(lowered: &str) -> bool {
    ["table", "figure", "chart"].iter().any(|word| {
        lowered
            .strip_prefix(word)
            .map(|rest| {
                let trimmed = rest.trim_start();
                trimmed.len() < rest.len()
                    && trimmed.chars().next().is_some_and(|ch| ch.is_ascii_digit())
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SegmenterConfig {
        SegmenterConfig::default()
    }

    #[test]
    fn classify_covers_every_label() {
        assert_eq!(classify("EXECUTIVE SUMMARY"), SegmentType::Heading);
        assert_eq!(classify("2 Results And Discussion"), SegmentType::Heading);
        assert_eq!(classify("Quarterly Revenue Overview"), SegmentType::Title);
        assert_eq!(classify("- first bullet point here."), SegmentType::ListItem);
        assert_eq!(
            classify("Table 3 shows the regional breakdown of revenue across all markets."),
            SegmentType::TableCaption
        );
        assert_eq!(
            classify("The company grew steadily. Margins improved in the second half."),
            SegmentType::Paragraph
        );
    }

    #[test]
    fn long_numbered_lines_are_list_items() {
        let long_item = format!("3. {}", "lowercase words keep going ".repeat(6));
        assert_eq!(classify(&long_item), SegmentType::ListItem);
    }

    #[test]
    fn sequence_numbers_are_dense_and_start_at_zero() {
        let text = "INTRODUCTION\n\nThis report covers the full fiscal year.\n\nx\n\n\
                    Revenue grew by twelve percent year over year.";
        let segments = segment(text, &config());
        let numbers: Vec<u32> = segments.iter().map(|s| s.sequence_number).collect();
        assert_eq!(numbers, (0..segments.len() as u32).collect::<Vec<_>>());
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn paragraphs_inherit_the_current_section() {
        let text = "OVERVIEW\n\nSales increased in every region this year.";
        let segments = segment(text, &config());
        assert_eq!(segments[0].segment_type, SegmentType::Heading);
        assert_eq!(segments[1].section_title.as_deref(), Some("OVERVIEW"));
    }

    #[test]
    fn falls_back_to_lines_then_sentences() {
        let lines = split_paragraphs("first line here\nsecond line here");
        assert_eq!(lines.len(), 2);

        let sentences = split_paragraphs("One sentence here. Another one follows! Last?");
        assert_eq!(sentences, vec!["One sentence here.", "Another one follows!", "Last?"]);
    }

    #[test]
    fn cleaning_drops_page_furniture_and_collapses_spaces() {
        let cleaned = clean_text("Page 3\nSome   spaced\t\ttext\n4 of 10\nkeep 3 of them");
        assert_eq!(cleaned, "Some spaced text\nkeep 3 of them");
    }

    #[test]
    fn tabular_input_becomes_summary_and_rows() {
        let csv = "product_name,price,category\nWidget,9.99,Tools\nGadget,19.99,Tools\nGizmo,4.50,Toys\n";
        let segments = segment(csv, &config());

        assert_eq!(segments[0].segment_type, SegmentType::DataSummary);
        assert!(segments[0].content.contains("3 rows"));
        assert!(segments[0].content.contains("product_name: Widget, Gadget, Gizmo"));
        assert!(segments[0].content.contains("category: Tools, Toys"));
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[1].segment_type, SegmentType::DataRow);
        assert_eq!(
            segments[1].content,
            "product_name: Widget; price: 9.99; category: Tools"
        );
    }

    #[test]
    fn summary_caps_unique_values() {
        let mut csv = String::from("name,value\n");
        for i in 0..30 {
            csv.push_str(&format!("item{i},{i}\n"));
        }
        let limited = SegmenterConfig {
            max_unique_values: 5,
            max_data_rows: 10,
            ..config()
        };
        let segments = segment(&csv, &limited);
        assert!(segments[0].content.contains("(and 25 more)"));
        assert_eq!(segments.len(), 11);
    }

    #[test]
    fn prose_with_commas_is_not_tabular() {
        let text = "Hello, world\nThis line has none\nNeither does this one";
        assert_eq!(detect_tabular(text, 10), None);
    }

    #[test]
    fn paragraphs_with_commas_stay_prose() {
        let text = "In spring, the cooling loop must be flushed before the plant restarts.\n\n\
                    Too short to embed.\n\n\
                    At every shift, operators record inlet and outlet temperatures.";
        assert_eq!(detect_tabular(text, 10), None);

        let segments = segment(text, &config());
        assert_eq!(segments.len(), 3);
        assert!(segments
            .iter()
            .all(|segment| segment.segment_type != SegmentType::DataSummary
                && segment.segment_type != SegmentType::DataRow));
        assert!(segments[0].content.starts_with("In spring, the cooling loop"));
    }

    #[test]
    fn two_delimited_lines_are_not_enough() {
        assert_eq!(detect_tabular("name,year\nAtlas,2019", 10), None);
    }

    #[test]
    fn parsed_rows_skip_detection() {
        let rows = vec![
            vec!["title".to_string(), "note".to_string()],
            vec!["Pump".to_string(), "Replaced in March.".to_string()],
        ];
        let segments = segment_dataset(&rows, &config());
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].segment_type, SegmentType::DataSummary);
        assert!(segments[0].content.starts_with("Dataset with 1 rows and 2 columns"));
        assert_eq!(segments[1].content, "title: Pump; note: Replaced in March.");
        assert!(segment_dataset(&[], &config()).is_empty());
    }

    #[test]
    fn tab_delimiter_wins_when_present() {
        let text = "a\tb\n1\t2\n3\t4";
        assert_eq!(detect_tabular(text, 10), Some('\t'));
    }

    #[test]
    fn quoted_fields_keep_delimiters() {
        let cells = split_delimited(r#"1,"Smith, John","said ""hi""""#, ',');
        assert_eq!(cells, vec!["1", "Smith, John", "said \"hi\""]);
    }
}
