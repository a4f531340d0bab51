//! Embedded table discovery and cell typing.
//!
//! A line-window scan groups consecutive separator-heavy lines into blocks; each block is
//! split on the delimiter that yields the most columns and every cell runs through
//! [`crate::typing::coerce`].

use crate::models::{StructuredCell, Table};
use crate::segmenter::split_delimited;
use crate::typing::coerce;

const ROW_SEPARATORS: [&str; 4] = ["\t", "|", "  ", ","];
const BLOCK_DELIMITERS: [char; 3] = ['\t', '|', ','];

/// Rows of one discovered block, before typing.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBlock {
    pub rows: Vec<Vec<String>>,
}

pub fn is_table_row(line: &str) -> bool {
    ROW_SEPARATORS
        .iter()
        .any(|separator| line.matches(separator).count() >= 2)
}

pub fn detect_table_blocks(raw_text: &str) -> Vec<TableBlock> {
    let mut blocks = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    let flush = |pending: &mut Vec<&str>, blocks: &mut Vec<TableBlock>| {
        if pending.len() >= 2 {
            let rows = parse_table_lines(pending);
            if !rows.is_empty() {
                blocks.push(TableBlock { rows });
            }
        }
        pending.clear();
    };

    for line in raw_text.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && is_table_row(trimmed) {
            pending.push(trimmed);
        } else {
            flush(&mut pending, &mut blocks);
        }
    }
    flush(&mut pending, &mut blocks);

    blocks
}

pub fn parse_table_lines(lines: &[&str]) -> Vec<Vec<String>> {
    let Some(first) = lines.first() else {
        return Vec::new();
    };

    let mut best: Option<(char, usize)> = None;
    for delimiter in BLOCK_DELIMITERS {
        let columns = split_block_line(first, delimiter).len();
        if best.map_or(true, |(_, max)| columns > max) {
            best = Some((delimiter, columns));
        }
    }

    let rows: Vec<Vec<String>> = match best {
        Some((delimiter, columns)) if columns >= 2 => lines
            .iter()
            .map(|line| split_block_line(line, delimiter))
            .collect(),
        _ => {
            if split_on_wide_spaces(first).len() < 2 {
                return Vec::new();
            }
            lines.iter().map(|line| split_on_wide_spaces(line)).collect()
        }
    };

    rows.into_iter()
        .filter(|row| !row.is_empty() && !is_rule_row(row))
        .collect()
}

fn split_block_line(line: &str, delimiter: char) -> Vec<String> {
    if delimiter != '|' {
        return split_delimited(line, delimiter);
    }

    let inner = line.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn split_on_wide_spaces(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut spaces = 0usize;

    for ch in line.trim().chars() {
        if ch == ' ' {
            spaces += 1;
            continue;
        }
        if spaces >= 2 {
            cells.push(std::mem::take(&mut current));
        } else if spaces == 1 {
            current.push(' ');
        }
        spaces = 0;
        current.push(ch);
    }
    if !current.is_empty() {
        cells.push(current);
    }
    cells
}

/// Markdown separator rows such as `|---|:---:|`.
fn is_rule_row(row: &[String]) -> bool {
    row.iter()
        .all(|cell| !cell.is_empty() && cell.chars().all(|ch| matches!(ch, '-' | ':' | '=')))
}

/// Types every cell. With a header, row 0 names the columns and cells start at row 1.
pub fn build_table(
    document_id: &str,
    table_index: usize,
    name: impl Into<String>,
    rows: Vec<Vec<String>>,
    has_header: bool,
) -> Table {
    let column_count = rows.first().map(Vec::len).unwrap_or(0);
    let use_header = has_header && rows.len() > 1;

    let column_names: Vec<String> = if use_header {
        rows[0].clone()
    } else {
        (0..column_count)
            .map(|index| format!("Column_{}", index + 1))
            .collect()
    };

    let start = usize::from(use_header);
    let mut cells = Vec::new();
    for (row_index, row) in rows.iter().enumerate().skip(start) {
        for (column_index, raw) in row.iter().enumerate() {
            let Some(column_name) = column_names.get(column_index) else {
                continue;
            };
            cells.push(StructuredCell {
                row_index,
                column_index,
                column_name: column_name.clone(),
                value: coerce(raw),
            });
        }
    }

    Table {
        document_id: document_id.to_string(),
        table_index,
        name: name.into(),
        row_count: rows.len(),
        column_count,
        has_header: use_header,
        rows,
        cells,
    }
}

pub fn extract_tables(document_id: &str, raw_text: &str) -> Vec<Table> {
    detect_table_blocks(raw_text)
        .into_iter()
        .enumerate()
        .map(|(index, block)| {
            build_table(
                document_id,
                index,
                format!("Table_{}", index + 1),
                block.rows,
                true,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::{DataType, TypedValue};

    #[test]
    fn separator_heavy_lines_are_rows() {
        assert!(is_table_row("a | b | c"));
        assert!(is_table_row("x\ty\tz"));
        assert!(is_table_row("Name  Age  City"));
        assert!(!is_table_row("A sentence, with one comma"));
    }

    #[test]
    fn blocks_need_two_lines() {
        let text = "Intro line\nname,age,city\n\nAnother line\n";
        assert!(detect_table_blocks(text).is_empty());
    }

    #[test]
    fn blocks_flush_on_blank_and_plain_lines() {
        let text = "Header text\n\
                    Item | Qty | Price\n\
                    Bolt | 10 | $1.50\n\
                    Nut | 20 | $0.25\n\
                    \n\
                    Some prose follows here\n\
                    a\tb\tc\n\
                    1\t2\t3\n\
                    Closing remark";
        let blocks = detect_table_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].rows[0], vec!["Item", "Qty", "Price"]);
        assert_eq!(blocks[1].rows[1], vec!["1", "2", "3"]);
    }

    #[test]
    fn trailing_block_is_flushed_at_end_of_text() {
        let blocks = detect_table_blocks("x,y,z\n1,2,3");
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn wide_space_fallback_splits_columns() {
        let rows = parse_table_lines(&["Name  Age  City", "Ann Lee  34  Oslo"]);
        assert_eq!(rows[1], vec!["Ann Lee", "34", "Oslo"]);
    }

    #[test]
    fn markdown_rules_are_skipped() {
        let rows = parse_table_lines(&["| a | b |", "|---|---|", "| 1 | 2 |"]);
        assert_eq!(rows, vec![vec!["a", "b"], vec!["1", "2"]]);
    }

    #[test]
    fn cells_are_typed_under_header_names() {
        let rows = vec![
            vec!["Item".to_string(), "Qty".to_string(), "Shipped".to_string()],
            vec!["Bolt".to_string(), "10".to_string(), "2024-01-02".to_string()],
            vec!["Nut".to_string(), "2.5".to_string(), "yes".to_string(), "extra".to_string()],
        ];
        let table = build_table("doc-1", 0, "Table_1", rows, true);

        assert_eq!(table.row_count, 3);
        assert_eq!(table.column_count, 3);
        assert_eq!(table.cells.len(), 6);
        assert!(table
            .cells
            .iter()
            .all(|cell| cell.row_index < table.row_count && cell.column_index < table.column_count));

        let qty = &table.cells[1];
        assert_eq!(qty.column_name, "Qty");
        assert_eq!(qty.value.value, TypedValue::Integer(10));
        assert_eq!(table.cells[2].value.data_type(), DataType::Date);
        assert_eq!(table.cells[4].value.data_type(), DataType::Decimal);
        assert_eq!(table.cells[5].value.value, TypedValue::Boolean(true));
    }

    #[test]
    fn single_row_tables_use_generated_names() {
        let table = build_table("doc", 0, "T", vec![vec!["a".to_string(), "b".to_string()]], true);
        assert!(!table.has_header);
        assert_eq!(table.cells[1].column_name, "Column_2");
        assert_eq!(table.cells[0].row_index, 0);
    }
}
