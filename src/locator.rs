// 🔎 Label Locator
// Anchor search over page lines + page classification

use serde::{Deserialize, Serialize};

/// How an anchor label is compared against a trimmed line.
/// All modes are case-insensitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Equals,
    #[default]
    StartsWith,
    Contains,
}

/// A literal label plus the way it must match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub text: String,
    #[serde(default)]
    pub mode: MatchMode,
}

impl Anchor {
    pub fn new(text: &str, mode: MatchMode) -> Self {
        Anchor {
            text: text.to_string(),
            mode,
        }
    }

    pub fn equals(text: &str) -> Self {
        Anchor::new(text, MatchMode::Equals)
    }

    pub fn starts_with(text: &str) -> Self {
        Anchor::new(text, MatchMode::StartsWith)
    }

    pub fn contains(text: &str) -> Self {
        Anchor::new(text, MatchMode::Contains)
    }

    pub fn matches(&self, line: &str) -> bool {
        line_matches(line, &self.text, self.mode)
    }
}

/// Compare one line against a label
pub fn line_matches(line: &str, label: &str, mode: MatchMode) -> bool {
    let line = line.trim().to_uppercase();
    let label = label.trim().to_uppercase();

    match mode {
        MatchMode::Equals => line == label,
        MatchMode::StartsWith => line.starts_with(&label),
        MatchMode::Contains => line.contains(&label),
    }
}

/// Index of the first line matching `label`
pub fn find_anchor<S: AsRef<str>>(lines: &[S], label: &str, mode: MatchMode) -> Option<usize> {
    lines
        .iter()
        .position(|line| line_matches(line.as_ref(), label, mode))
}

/// A page matches when every anchor occurs somewhere in its text
pub fn classify_page<S: AsRef<str>>(full_text: &str, anchors: &[S]) -> bool {
    let haystack = full_text.to_uppercase();
    anchors
        .iter()
        .all(|anchor| haystack.contains(&anchor.as_ref().trim().to_uppercase()))
}

/// Indices of all pages that classify, ascending
pub fn find_pages<P: AsRef<str>, S: AsRef<str>>(pages: &[P], anchors: &[S]) -> Vec<usize> {
    pages
        .iter()
        .enumerate()
        .filter(|(_, page)| classify_page(page.as_ref(), anchors))
        .map(|(idx, _)| idx)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines() -> Vec<&'static str> {
        vec![
            "LIVRO REGISTRO DE APURAÇÃO DO ICMS",
            "  004 - Subtotal  ",
            "1.234,56",
            "TOTAL",
            "Total geral",
        ]
    }

    #[test]
    fn test_find_anchor_modes() {
        let lines = lines();

        assert_eq!(find_anchor(&lines, "total", MatchMode::Equals), Some(3));
        assert_eq!(find_anchor(&lines, "004 - SUBTOTAL", MatchMode::StartsWith), Some(1));
        assert_eq!(find_anchor(&lines, "apuração", MatchMode::Contains), Some(0));
        assert_eq!(find_anchor(&lines, "total g", MatchMode::StartsWith), Some(4));
        assert_eq!(find_anchor(&lines, "inexistente", MatchMode::Contains), None);
    }

    #[test]
    fn test_equals_ignores_surrounding_whitespace() {
        assert!(line_matches("   TOTAL  ", "total", MatchMode::Equals));
        assert!(!line_matches("TOTAL GERAL", "total", MatchMode::Equals));
    }

    #[test]
    fn test_accented_labels_fold_case() {
        assert!(Anchor::contains("saídas").matches("Relatório de SAÍDAS"));
        assert!(Anchor::starts_with("Observações").matches("OBSERVAÇÕES: nenhuma"));
    }

    #[test]
    fn test_classify_page_requires_all_anchors() {
        let page = "001 - Por saídas / prestações com débito do imposto\n...\n005 - Por entradas / aquisições com crédito do imposto";

        assert!(classify_page(page, &["001 - POR SAÍDAS", "005 - POR ENTRADAS"]));
        assert!(!classify_page(page, &["001 - POR SAÍDAS", "APURAÇÃO DOS SALDOS"]));
        assert!(classify_page(page, &[] as &[&str]));
    }

    #[test]
    fn test_find_pages_ascending() {
        let pages = vec!["ENTRADAS p1", "SAÍDAS p2", "entradas p3"];
        assert_eq!(find_pages(&pages, &["ENTRADAS"]), vec![0, 2]);
    }
}
