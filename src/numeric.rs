// 🔢 Numeric Normalizer
// Locale text ("2.360.524,26") <-> canonical Decimal (2360524.26)

use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;
use std::sync::OnceLock;

/// Raw token returned when a line carries no money-shaped value
pub const NO_TOKEN: &str = "N/A";

fn money_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,3}(?:\.\d{3})*,\d{2}\b").expect("money regex"))
}

// ============================================================================
// TEXT -> DECIMAL
// ============================================================================

/// Convert locale-formatted text into a Decimal.
///
/// Input without a decimal comma is rejected (returns zero): report lines are
/// full of codes like "PA10000025" that must never be read as money.
/// Anything unparsable also collapses to zero.
pub fn normalize(raw: &str) -> Decimal {
    if !raw.contains(',') {
        return Decimal::ZERO;
    }

    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let swapped = compact.replace('.', "").replace(',', ".");
    let cleaned: String = swapped
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    if cleaned.is_empty() {
        return Decimal::ZERO;
    }

    Decimal::from_str(&cleaned).unwrap_or(Decimal::ZERO)
}

// ============================================================================
// DECIMAL -> TEXT
// ============================================================================

/// Format a Decimal with two fraction digits in the source locale
/// (dot thousands separator, comma decimal separator).
pub fn denormalize(value: Decimal) -> String {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    rounded = rounded.abs();
    rounded.rescale(2);

    let plain = rounded.to_string();
    let (int_part, frac_part) = plain.split_once('.').unwrap_or((plain.as_str(), "00"));

    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.iter().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(*ch);
    }

    let sign = if negative { "-" } else { "" };
    format!("{}{},{}", sign, grouped, frac_part)
}

// ============================================================================
// LINE SCANNING
// ============================================================================

/// First money-shaped token on a line, with its normalized value.
///
/// Returns `(0, "N/A")` when the line has none.
pub fn extract_first_money_token(line: &str) -> (Decimal, String) {
    match money_re().find(line) {
        Some(m) => (normalize(m.as_str()), m.as_str().to_string()),
        None => (Decimal::ZERO, NO_TOKEN.to_string()),
    }
}

/// Every money-shaped token on a line, left to right
pub fn find_money_tokens(line: &str) -> Vec<String> {
    money_re()
        .find_iter(line)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// True when text carries both a thousands separator and a decimal comma
pub fn has_money_shape(text: &str) -> bool {
    text.contains('.') && text.contains(',')
}

// ============================================================================
// TESTS
// ============================================================================
