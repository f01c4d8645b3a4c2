// 🧭 Layout Extractor
// Walks the lines of a classified page and pulls field values out of a
// section, driven by one SectionLayout entry.
//
// Outside --(section anchor)--> Inside --(stop marker)--> Terminated
// A section without an anchor starts Inside at the top of the page.

use crate::document::RenderedDocument;
use crate::layout::{DuplicatePolicy, LayoutMode, LayoutTable, OffsetField, PageScan, SectionLayout};
use crate::locator::{find_pages, Anchor};
use crate::numeric::{extract_first_money_token, find_money_tokens, has_money_shape, normalize, NO_TOKEN};
use crate::report::{Diagnostic, DiagnosticKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Outside,
    Inside,
    Terminated,
}

// ============================================================================
// EXTRACTION RESULT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub section: String,

    /// Field -> normalized value
    pub values: BTreeMap<String, Decimal>,

    /// Field -> token as printed (NO_TOKEN when defaulted)
    pub raw: BTreeMap<String, String>,

    /// Free-capture tokens, document order
    pub captured: Vec<String>,

    /// Zero-based pages that were scanned
    pub pages: Vec<usize>,

    pub diagnostics: Vec<Diagnostic>,
}

impl Extraction {
    pub fn new(section: &str) -> Self {
        Extraction {
            section: section.to_string(),
            ..Default::default()
        }
    }

    /// Value of a field; unmatched fields read as zero
    pub fn value(&self, field: &str) -> Decimal {
        self.values.get(field).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn captured_total(&self) -> Decimal {
        self.captured.iter().map(|t| normalize(t)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.captured.is_empty()
    }

    pub fn record(&mut self, field: &str, value: Decimal, raw: &str, policy: DuplicatePolicy) {
        let keep_existing = match policy {
            DuplicatePolicy::LastWins => false,
            DuplicatePolicy::FirstNonZero => self.values.get(field).is_some_and(|v| !v.is_zero()),
        };

        if keep_existing {
            debug!(section = %self.section, field, "Keeping first non-zero value, ignoring {}", raw);
            return;
        }

        self.values.insert(field.to_string(), value);
        self.raw.insert(field.to_string(), raw.to_string());
    }

    fn diagnose(&mut self, kind: DiagnosticKind, message: String) {
        let diagnostic = Diagnostic::emit(kind, &self.section, message);
        self.diagnostics.push(diagnostic);
    }

    /// Fold a later page into this result
    fn absorb(&mut self, other: Extraction, policy: DuplicatePolicy) {
        for (field, value) in other.values {
            let raw = other.raw.get(&field).map(|r| r.as_str()).unwrap_or(NO_TOKEN);
            self.record(&field, value, raw, policy);
        }
        self.captured.extend(other.captured);
        self.pages.extend(other.pages);
        self.diagnostics.extend(other.diagnostics);
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

pub struct LayoutExtractor<'a> {
    layout: &'a SectionLayout,
}

impl<'a> LayoutExtractor<'a> {
    pub fn new(layout: &'a SectionLayout) -> Self {
        LayoutExtractor { layout }
    }

    /// Classify pages, then scan them as the section's `PageScan` says
    pub fn extract(&self, doc: &RenderedDocument) -> Extraction {
        let mut result = Extraction::new(&self.layout.id);
        let pages = find_pages(&doc.pages, &self.layout.page_anchors);

        if pages.is_empty() {
            result.diagnose(
                DiagnosticKind::PageNotFound,
                format!(
                    "No page of '{}' contains {:?}",
                    doc.name, self.layout.page_anchors
                ),
            );
            return result;
        }

        match self.layout.page_scan {
            PageScan::FirstMatch => result.absorb(self.extract_page(doc, pages[0]), self.layout.duplicates),
            PageScan::AllMatching => {
                for &page in &pages {
                    result.absorb(self.extract_page(doc, page), self.layout.duplicates);
                }
            }
            PageScan::FirstFound => {
                let mut misses = Vec::new();
                for &page in &pages {
                    let page_result = self.extract_page(doc, page);
                    if page_result.is_empty() {
                        misses.push(page_result);
                        continue;
                    }
                    misses.clear();
                    result.absorb(page_result, self.layout.duplicates);
                    break;
                }
                // Nothing anywhere: keep the first page's diagnostics only
                if let Some(first) = misses.into_iter().next() {
                    result.absorb(first, self.layout.duplicates);
                }
            }
        }

        debug!(
            section = %self.layout.id,
            pages = ?result.pages,
            fields = result.values.len(),
            captured = result.captured.len(),
            "Section extracted"
        );

        result
    }

    fn extract_page(&self, doc: &RenderedDocument, page: usize) -> Extraction {
        let mut page_result = self.extract_lines(&doc.page_lines(page));
        page_result.pages.push(page);
        page_result
    }

    /// Run the scan state machine over one page's lines
    pub fn extract_lines<S: AsRef<str>>(&self, lines: &[S]) -> Extraction {
        let mut out = Extraction::new(&self.layout.id);
        let mut state = match self.layout.section_anchor {
            Some(_) => ScanState::Outside,
            None => ScanState::Inside,
        };

        for (i, line) in lines.iter().enumerate() {
            let line = line.as_ref();
            match state {
                ScanState::Outside => {
                    if self.layout.section_anchor.as_ref().is_some_and(|a| a.matches(line)) {
                        state = ScanState::Inside;
                    }
                }
                ScanState::Inside => {
                    if self.is_stop(line) || self.is_capture_end(line, &out) {
                        state = ScanState::Terminated;
                        continue;
                    }
                    self.apply(i, lines, &mut out);
                }
                ScanState::Terminated => break,
            }
        }

        if state == ScanState::Outside {
            if let Some(anchor) = &self.layout.section_anchor {
                out.diagnose(
                    DiagnosticKind::AnchorNotFound,
                    format!("Section anchor '{}' not found", anchor.text),
                );
            }
            return out;
        }

        self.report_unmatched(&mut out);
        out
    }

    fn is_stop(&self, line: &str) -> bool {
        self.layout.stop_marker.as_ref().is_some_and(|m| m.matches(line))
    }

    /// Blank or very short line after values were captured
    fn is_capture_end(&self, line: &str, out: &Extraction) -> bool {
        self.layout.stop_on_blank_after_capture
            && matches!(self.layout.mode, LayoutMode::FreeCapture)
            && !out.captured.is_empty()
            && line.trim().chars().count() < 5
    }

    fn apply<S: AsRef<str>>(&self, i: usize, lines: &[S], out: &mut Extraction) {
        let line = lines[i].as_ref();
        let policy = self.layout.duplicates;

        match &self.layout.mode {
            LayoutMode::VerticalOffset { fields } => {
                for field in fields.iter().filter(|f| f.label.matches(line)) {
                    self.read_offset(i, lines, field, out);
                }
            }

            LayoutMode::HorizontalRow { row_anchor, fields, min_tokens, lookahead } => {
                if row_anchor.matches(line) {
                    self.read_row(i, lines, fields, *min_tokens, *lookahead, out);
                }
            }

            LayoutMode::CodeRow { codes } => {
                let Some(first) = line.split_whitespace().next() else {
                    return;
                };
                if !codes.iter().any(|c| c == first) {
                    return;
                }

                let (value, raw) = extract_first_money_token(line);
                if raw == NO_TOKEN {
                    out.diagnose(
                        DiagnosticKind::ValueNotFound,
                        format!("Code {} has no value on line {}", first, i + 1),
                    );
                } else {
                    out.record(first, value, &raw, policy);
                }
            }

            LayoutMode::FreeCapture => {
                if has_money_shape(line) {
                    out.captured.extend(
                        find_money_tokens(line)
                            .into_iter()
                            .filter(|t| !normalize(t).is_zero()),
                    );
                }
            }
        }
    }

    /// Value at label + offset. If that line is the stop marker the
    /// renderer placed the value above the label instead.
    fn read_offset<S: AsRef<str>>(&self, i: usize, lines: &[S], field: &OffsetField, out: &mut Extraction) {
        let target = i as isize + field.offset;
        if target < 0 || target as usize >= lines.len() {
            out.diagnose(
                DiagnosticKind::OffsetOutOfRange,
                format!(
                    "'{}' at line {} has no line at offset {}",
                    field.label.text,
                    i + 1,
                    field.offset
                ),
            );
            return;
        }

        let mut target = target as usize;
        if self.is_stop(lines[target].as_ref()) && i > 0 {
            debug!(field = %field.field, "Stop marker below label, reading line above");
            target = i - 1;
        }

        let (value, raw) = extract_first_money_token(lines[target].as_ref());
        if raw == NO_TOKEN {
            out.diagnose(
                DiagnosticKind::ValueNotFound,
                format!("No value for {} at line {}", field.field, target + 1),
            );
            return;
        }

        out.record(&field.field, value, &raw, self.layout.duplicates);
    }

    fn read_row<S: AsRef<str>>(
        &self,
        i: usize,
        lines: &[S],
        fields: &[String],
        min_tokens: usize,
        lookahead: usize,
        out: &mut Extraction,
    ) {
        let mut tokens = find_money_tokens(lines[i].as_ref());

        for next in lines.iter().skip(i + 1).take(lookahead) {
            if tokens.len() >= min_tokens || self.is_stop(next.as_ref()) {
                break;
            }
            tokens.extend(find_money_tokens(next.as_ref()));
        }

        if tokens.len() < min_tokens {
            out.diagnose(
                DiagnosticKind::RowRejected,
                format!(
                    "Row at line {} has {} values, expected at least {}",
                    i + 1,
                    tokens.len(),
                    min_tokens
                ),
            );
            return;
        }

        for (pos, field) in fields.iter().enumerate() {
            match tokens.get(pos) {
                Some(raw) => out.record(field, normalize(raw), raw, self.layout.duplicates),
                None => out.record(field, Decimal::ZERO, NO_TOKEN, self.layout.duplicates),
            }
        }
    }

    fn report_unmatched(&self, out: &mut Extraction) {
        match &self.layout.mode {
            LayoutMode::VerticalOffset { fields } => {
                for field in fields {
                    let already_reported = out
                        .diagnostics
                        .iter()
                        .any(|d| d.message.contains(&field.label.text) || d.message.contains(&field.field));
                    if !out.values.contains_key(&field.field) && !already_reported {
                        out.diagnose(
                            DiagnosticKind::AnchorNotFound,
                            format!("Label '{}' for {} not found", field.label.text, field.field),
                        );
                    }
                }
            }
            LayoutMode::HorizontalRow { row_anchor, fields, .. } => {
                if fields.iter().all(|f| !out.values.contains_key(f)) && out.diagnostics.is_empty() {
                    out.diagnose(
                        DiagnosticKind::AnchorNotFound,
                        format!("Row anchor '{}' not found", row_anchor.text),
                    );
                }
            }
            LayoutMode::CodeRow { codes } => {
                for code in codes {
                    if !out.values.contains_key(code) {
                        debug!(section = %self.layout.id, code = %code, "Code row not present");
                    }
                }
            }
            LayoutMode::FreeCapture => {
                if out.captured.is_empty() {
                    debug!(section = %self.layout.id, "Nothing captured");
                }
            }
        }
    }
}

/// Convenience for one-off lookups (inspect mode, tests)
pub fn extract_section(layout: &SectionLayout, doc: &RenderedDocument) -> Extraction {
    LayoutExtractor::new(layout).extract(doc)
}

/// Run every section of `table` against the documents that were loaded.
/// Sections whose document is absent are skipped; the loader already
/// reported why.
pub fn extract_all(table: &LayoutTable, documents: &BTreeMap<String, RenderedDocument>) -> BTreeMap<String, Extraction> {
    table
        .sections
        .iter()
        .filter_map(|section| {
            documents
                .get(&section.document)
                .map(|doc| (section.id.clone(), extract_section(section, doc)))
        })
        .collect()
}

/// First page carrying every anchor, with its lines (detective mode)
pub fn first_matching_page<'d>(doc: &'d RenderedDocument, anchors: &[Anchor]) -> Option<(usize, Vec<&'d str>)> {
    let labels: Vec<&str> = anchors.iter().map(|a| a.text.as_str()).collect();
    let page = *find_pages(&doc.pages, &labels).first()?;
    Some((page, doc.page_lines(page)))
}
