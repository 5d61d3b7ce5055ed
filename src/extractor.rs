//! Extraction of 6-digit one-time codes from noisy email text.
//!
//! Codes arrive formatted in many ways: `628018`, `6 2 8 0 1 8`, `6-2-8-0-1-8`,
//! split across lines, or padded with `&nbsp;` and zero-width characters. The
//! extractor normalizes the text and then tries progressively looser strategies,
//! returning the first hit.
//!
//! # Example
//!
//! ```
//! use otp_keygate::extractor::extract_code;
//!
//! assert_eq!(extract_code(Some("Your code is 628018.")).as_deref(), Some("628018"));
//! assert_eq!(extract_code(Some("Your code is 6 2 8-0 1 8")).as_deref(), Some("628018"));
//! assert_eq!(extract_code(None), None);
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Number of digits in a code.
pub const CODE_LEN: usize = 6;

static HTML_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)&nbsp;|&#160;").expect("valid regex"));
static ZERO_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{200B}-\u{200D}\u{FEFF}]").expect("valid regex"));
static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\r\n\t]+").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+").expect("valid regex"));
// Six digits with at most three separator characters between neighbours
static LOOSE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9](?:[^0-9]{0,3}[0-9]){5}").expect("valid regex"));

/// A one-time code: exactly six ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OtpCode(String);

impl OtpCode {
    /// Wraps `code` if it consists of exactly six ASCII digits.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        (code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit()))
            .then(|| Self(code.to_string()))
    }

    /// Returns the digits.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the code, returning the digits.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::ops::Deref for OtpCode {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for OtpCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OtpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the most likely 6-digit code in `text`, or `None`.
///
/// Strategies, in order:
///
/// 1. a standalone run of exactly six digits,
/// 2. six digits separated by up to three non-digit characters each
///    (`6 2 8-0 1 8`), not touching other digits,
/// 3. the first six digits left after removing every non-digit character.
#[must_use]
pub fn extract_code(text: Option<&str>) -> Option<OtpCode> {
    let text = text?;
    if text.is_empty() {
        return None;
    }

    let normalized = normalize(text);

    clean_run(&normalized)
        .or_else(|| loose_run(&normalized))
        .or_else(|| stripped_digits(&normalized))
}

/// Replaces invisible and HTML-encoded spaces and collapses all whitespace.
fn normalize(text: &str) -> String {
    let text = HTML_SPACE.replace_all(text, " ");
    let text = ZERO_WIDTH.replace_all(&text, " ");
    let text = LINE_BREAKS.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn char_before(text: &str, index: usize) -> Option<char> {
    text[..index].chars().next_back()
}

fn char_after(text: &str, index: usize) -> Option<char> {
    text[index..].chars().next()
}

/// Exactly six digits with a word boundary on both sides.
fn clean_run(text: &str) -> Option<OtpCode> {
    DIGIT_RUN
        .find_iter(text)
        .filter(|run| run.len() == CODE_LEN)
        .find(|run| {
            !char_before(text, run.start()).is_some_and(is_word_char)
                && !char_after(text, run.end()).is_some_and(is_word_char)
        })
        .and_then(|run| OtpCode::parse(run.as_str()))
}

/// Six digits with short separators, starting and ending away from other digits.
fn loose_run(text: &str) -> Option<OtpCode> {
    // Every digit run starts at a position not preceded by a digit
    DIGIT_RUN.find_iter(text).find_map(|run| {
        let candidate = LOOSE_CODE.find(&text[run.start()..])?;
        let end = run.start() + candidate.end();
        if char_after(text, end).is_some_and(|c| c.is_ascii_digit()) {
            return None;
        }
        let digits: String = candidate
            .as_str()
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        OtpCode::parse(&digits)
    })
}

/// The first six digits once everything else is removed.
fn stripped_digits(text: &str) -> Option<OtpCode> {
    let digits: String = text
        .chars()
        .filter(char::is_ascii_digit)
        .take(CODE_LEN)
        .collect();
    OtpCode::parse(&digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(text: &str) -> Option<String> {
        extract_code(Some(text)).map(OtpCode::into_string)
    }

    #[test]
    fn test_clean_code() {
        assert_eq!(code("Your code is 628018.").as_deref(), Some("628018"));
        assert_eq!(code("628018").as_deref(), Some("628018"));
        assert_eq!(code("(628018)").as_deref(), Some("628018"));
    }

    #[test]
    fn test_clean_code_preferred_over_earlier_noise() {
        // A loose or stripped match earlier in the text must not win
        let text = "Order 12-34 on 5/6: your code is 481516";
        assert_eq!(code(text).as_deref(), Some("481516"));
    }

    #[test]
    fn test_clean_code_requires_word_boundary() {
        // Letters glued to the digits are not a clean run, the loose strategy
        // still finds the digits
        assert_eq!(code("ref A123456 ok").as_deref(), Some("123456"));
        // Non-ASCII letters count as boundaries
        assert_eq!(clean_run("kodó123456").unwrap().as_str(), "123456");
    }

    #[test]
    fn test_spaced_and_dashed_digits() {
        assert_eq!(code("Your code is 6 2 8-0 1 8").as_deref(), Some("628018"));
        assert_eq!(code("6-2-8-0-1-8").as_deref(), Some("628018"));
        assert_eq!(code("6 . 2 8 0 1 8").as_deref(), Some("628018"));
        assert_eq!(code("code: 628\n018").as_deref(), Some("628018"));
    }

    #[test]
    fn test_html_and_zero_width_noise() {
        assert_eq!(
            code("<b>6</b>&nbsp;2&#160;8\u{200B}0\u{FEFF}1 8").as_deref(),
            Some("628018")
        );
        assert_eq!(code("6&NBSP;2&nbsp;8 0 1 8").as_deref(), Some("628018"));
    }

    #[test]
    fn test_loose_run_rejects_adjacent_digits() {
        // A seventh digit glued to the end rules out the loose match; stripping wins
        assert!(loose_run("1-2-3-4-5-67").is_none());
        assert_eq!(code("1-2-3-4-5-67").as_deref(), Some("123456"));
        // Separators longer than three characters break the loose pattern
        assert_eq!(code("1 2 3 4 5 ---- 6").as_deref(), Some("123456"));
    }

    #[test]
    fn test_loose_run_skips_bad_start() {
        // The first run is followed by a seventh digit, the second one works
        assert_eq!(
            loose_run("1234567 1-2-3-4-5-6").unwrap().as_str(),
            "123456"
        );
    }

    #[test]
    fn test_stripped_digits_fallback() {
        assert_eq!(code("12 ab 34 cd 5678").as_deref(), Some("123456"));
        assert_eq!(code("1234567").as_deref(), Some("123456"));
    }

    #[test]
    fn test_no_code() {
        assert_eq!(extract_code(None), None);
        assert_eq!(code(""), None);
        assert_eq!(code("   \r\n\t "), None);
        assert_eq!(code("Your code is 12345"), None);
        assert_eq!(code("1 2 3 - 4 5"), None);
        assert_eq!(code("no digits at all"), None);
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "Your code is 6 2 8-0 1 8",
            "no code",
            "<p>123&nbsp;456</p>",
            "1234567",
        ];
        for input in inputs {
            assert_eq!(code(input), code(input));
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  a\r\n\tb&nbsp;&nbsp;c\u{200C}d  "), "a b c d");
    }

    #[test]
    fn test_otp_code_parse() {
        assert!(OtpCode::parse("000000").is_some());
        assert!(OtpCode::parse("12345").is_none());
        assert!(OtpCode::parse("12345a").is_none());
        assert!(OtpCode::parse("١٢٣٤٥٦").is_none());
        assert_eq!(OtpCode::parse("628018").unwrap().to_string(), "628018");
    }
}
