// ✅ Presence Verifier
// Which reference codes and amounts never appear in a document

use std::collections::HashSet;

/// Codes that are not a literal substring of `full_text`.
/// Input order is kept; repeated codes are reported once.
pub fn find_missing<S: AsRef<str>>(full_text: &str, codes: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();

    codes
        .iter()
        .map(|c| c.as_ref().trim())
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(*c))
        .filter(|c| !full_text.contains(c))
        .map(|c| c.to_string())
        .collect()
}

/// True when `amount` is printed as a whole number in `text`:
/// "550,00" does not match inside "1.550,00" or "550,001".
pub fn contains_amount(text: &str, amount: &str) -> bool {
    let is_numeric = |c: char| c.is_ascii_digit() || c == '.' || c == ',';

    !amount.is_empty()
        && text.match_indices(amount).any(|(start, _)| {
            let before = text[..start].chars().next_back();
            let after = text[start + amount.len()..].chars().next();
            !before.is_some_and(is_numeric) && !after.is_some_and(|c| c.is_ascii_digit())
        })
}
