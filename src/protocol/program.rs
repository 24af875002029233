//! Divider program text as staged for download.
//!
//! Programs are written one instruction per line with optional comments in
//! parentheses, e.g. `B 10 (ten divisions)`. The firmware expects a single
//! run of upper-case instructions with no comments or whitespace.

use regex::Regex;
use std::sync::LazyLock;

/// Parenthesized comments and any whitespace.
static STRIP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(.*?\)|\s").expect("Invalid program strip regex"));

/// Normalize program text for transmission.
///
/// Each line loses its comments and whitespace and is upper-cased; the
/// lines are then joined without separators.
///
/// ```
/// use divider_controller::protocol::program::normalize_program;
///
/// assert_eq!(normalize_program("b 10 (ten)\nm1\n"), "B10M1");
/// ```
pub fn normalize_program(text: &str) -> String {
    text.lines()
        .map(|line| STRIP_REGEX.replace_all(line, "").to_uppercase())
        .collect()
}
