// 🧮 Code Aggregator
// Adjustment codes printed in the rendered report -> summed values

use crate::numeric::{find_money_tokens, normalize};
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

/// Two uppercase letters + 5..12 digits, as a whole token (e.g. PA10000025)
pub fn code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z]{2}\d{5,12}\b").expect("code regex"))
}

/// Sum of the last money token of every line, keyed by the first code on
/// that line. Lines with a code but no money token are ignored.
pub fn aggregate_by_code(full_text: &str) -> BTreeMap<String, Decimal> {
    let mut sums: BTreeMap<String, Decimal> = BTreeMap::new();

    for line in full_text.lines() {
        let Some(code) = code_re().find(line) else {
            continue;
        };

        let tokens = find_money_tokens(line);
        let Some(last) = tokens.last() else {
            continue;
        };

        *sums.entry(code.as_str().to_string()).or_insert(Decimal::ZERO) += normalize(last);
    }

    debug!("Aggregated {} adjustment codes", sums.len());
    sums
}

/// Total across every code
pub fn grand_total(sums: &BTreeMap<String, Decimal>) -> Decimal {
    sums.values().copied().sum()
}
