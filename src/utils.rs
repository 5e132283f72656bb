use chrono::NaiveDate;

use crate::types::{AggregatorError, Result};

/// Truncate text to at most `max_chars` characters on a char boundary,
/// appending an ellipsis when anything was cut.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

/// Parse a `YYYY-MM-DD` date string.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| AggregatorError::General(format!("Invalid date '{}': {}", value, e)))
}
