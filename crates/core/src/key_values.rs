use crate::error::IngestError;
use crate::models::KeyValue;
use crate::typing::coerce;
use regex::Regex;

const KEY_VALUE_PATTERNS: [(&str, &str); 3] = [
    (r"([A-Za-z][A-Za-z \t]*):[ \t]*([^\n]+)", "regex_colon"),
    (r"([A-Za-z][A-Za-z \t]*?)[ \t]*=[ \t]*([^\n]+)", "regex_equals"),
    (r"([A-Za-z][A-Za-z \t]*?)[ \t]+-[ \t]+([^\n]+)", "regex_dash"),
];

const MIN_KEY_CHARS: usize = 3;

const CATEGORY_HINTS: [(&str, &[&str]); 3] = [
    (
        "financial",
        &["amount", "total", "price", "cost", "revenue", "balance", "tax", "fee"],
    ),
    ("date", &["date", "due", "issued", "period", "year"]),
    ("contact", &["email", "phone", "address", "contact", "fax"]),
];

/// Scans text with each pattern in turn. Matches from different patterns are not deduplicated.
pub fn extract_key_values(document_id: &str, text: &str) -> Result<Vec<KeyValue>, IngestError> {
    let mut facts = Vec::new();

    for (pattern, method) in KEY_VALUE_PATTERNS {
        let matcher = Regex::new(pattern)?;
        for captures in matcher.captures_iter(text) {
            let key = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let value = captures.get(2).map(|m| m.as_str().trim()).unwrap_or_default();

            if key.chars().count() < MIN_KEY_CHARS || value.is_empty() {
                continue;
            }

            facts.push(KeyValue {
                document_id: document_id.to_string(),
                key_name: key.to_string(),
                category: categorize(key),
                value: coerce(value),
                extraction_method: method.to_string(),
            });
        }
    }

    Ok(facts)
}

fn categorize(key: &str) -> Option<String> {
    let lowered = key.to_lowercase();
    CATEGORY_HINTS
        .iter()
        .find(|(_, hints)| hints.iter().any(|hint| lowered.contains(hint)))
        .map(|(category, _)| (*category).to_string())
}
