// 📄 Rendered Documents
// Page text access behind a trait; PDF (lopdf) and form-feed text sources

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Page separator used by plain-text renderings (pdftotext and friends)
pub const PAGE_BREAK: char = '\x0c';

// ============================================================================
// PAGE TEXT SOURCES
// ============================================================================

/// Anything that can turn a paginated file into one string per page.
/// Page order is reading order; line breaks are kept.
pub trait PageTextSource {
    fn page_texts(&self, path: &Path) -> Result<Vec<String>>;

    fn name(&self) -> &str;
}

/// PDF pages via lopdf's text extraction
pub struct PdfPageSource;

impl PageTextSource for PdfPageSource {
    fn page_texts(&self, path: &Path) -> Result<Vec<String>> {
        let doc = lopdf::Document::load(path)
            .with_context(|| format!("Failed to open PDF: {}", path.display()))?;

        let mut texts = Vec::new();
        for page_number in doc.get_pages().keys() {
            match doc.extract_text(&[*page_number]) {
                Ok(text) => texts.push(text),
                Err(e) => {
                    // Keep page numbering stable; an unreadable page is just empty
                    warn!("Page {} of {} has no extractable text: {}", page_number, path.display(), e);
                    texts.push(String::new());
                }
            }
        }

        Ok(texts)
    }

    fn name(&self) -> &str {
        "pdf"
    }
}

/// Text file with form feeds between pages
pub struct PlainTextPageSource;

impl PageTextSource for PlainTextPageSource {
    fn page_texts(&self, path: &Path) -> Result<Vec<String>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read text document: {}", path.display()))?;

        Ok(split_pages(&content))
    }

    fn name(&self) -> &str {
        "text"
    }
}

/// Pick a page source from the file extension
pub fn detect_source(path: &Path) -> Box<dyn PageTextSource> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);

    if is_pdf {
        Box::new(PdfPageSource)
    } else {
        Box::new(PlainTextPageSource)
    }
}

pub fn split_pages(content: &str) -> Vec<String> {
    content.split(PAGE_BREAK).map(|p| p.to_string()).collect()
}

// ============================================================================
// RENDERED DOCUMENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub name: String,
    pub pages: Vec<String>,
}

impl RenderedDocument {
    pub fn from_pages(name: &str, pages: Vec<String>) -> Self {
        RenderedDocument {
            name: name.to_string(),
            pages,
        }
    }

    pub fn from_text(name: &str, content: &str) -> Self {
        RenderedDocument::from_pages(name, split_pages(content))
    }

    /// Load with the source matching the file extension
    pub fn load(name: &str, path: &Path) -> Result<Self> {
        let source = detect_source(path);
        let pages = source.page_texts(path)?;
        debug!("Loaded {} ({} pages) with {} source", name, pages.len(), source.name());
        Ok(RenderedDocument::from_pages(name, pages))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_lines(&self, page: usize) -> Vec<&str> {
        self.pages
            .get(page)
            .map(|p| p.lines().collect())
            .unwrap_or_default()
    }

    /// All pages joined, for whole-document scans
    pub fn full_text(&self) -> String {
        self.pages.join("\n")
    }
}
