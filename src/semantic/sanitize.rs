//! Output alias sanitization.

use once_cell::sync::Lazy;
use regex::Regex;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9A-Za-z_]+").unwrap());
static UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").unwrap());

/// Turn arbitrary text into a safe column alias.
///
/// Runs of characters outside `[0-9A-Za-z_]` become one underscore, runs
/// of underscores collapse to one (so `customer__region` becomes
/// `customer_region`) and leading/trailing underscores are dropped. Empty
/// results become
/// `fallback`; results starting with a digit get `fallback_` prepended.
///
/// ```
/// use mantis_query::semantic::sanitize_identifier;
/// assert_eq!(sanitize_identifier(" 123 bad name ", "field"), "field_123_bad_name");
/// assert_eq!(sanitize_identifier("total-revenue", "metric"), "total_revenue");
/// ```
pub fn sanitize_identifier(raw: &str, fallback: &str) -> String {
    let cleaned = NON_WORD.replace_all(raw.trim(), "_");
    let cleaned = UNDERSCORES.replace_all(&cleaned, "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        return fallback.to_string();
    }
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("{}_{}", fallback, cleaned);
    }
    cleaned.to_string()
}
