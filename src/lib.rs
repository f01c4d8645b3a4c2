// Fiscal Reconciliation - Core Library
// SPED Fiscal ledger x rendered Livro de Apuração: extraction + reconciliation
// Exposes all modules for use in the CLI and tests

pub mod numeric;        // Locale money text <-> Decimal
pub mod ledger;         // Pipe-delimited SPED reader (Windows-1252)
pub mod locator;        // Anchor search + page classification
pub mod layout;         // Versioned layout table
pub mod document;       // Page text sources (PDF / form-feed text)
pub mod extractor;      // Section state machine
pub mod aggregator;     // Adjustment code sums
pub mod presence;       // Missing code detection
pub mod reconciliation; // Tolerance comparison engine
pub mod plan;           // Which values are compared
pub mod config;         // Run configuration
pub mod report;         // Report object + JSON/CSV/text
pub mod pipeline;       // One full run

// Re-export commonly used types
pub use numeric::{
    normalize, denormalize, extract_first_money_token, find_money_tokens, NO_TOKEN,
};
pub use ledger::{
    LedgerFile, LedgerRecord, LedgerTables, LedgerPeriod, RecordSchema, SchemaRegistry,
    read_records, read_target_fields, extract_bloc,
};
pub use locator::{Anchor, MatchMode, find_anchor, classify_page};
pub use layout::{
    LayoutTable, LayoutMode, SectionLayout, OffsetField, DuplicatePolicy, PageScan,
};
pub use document::{RenderedDocument, PageTextSource, PdfPageSource, PlainTextPageSource, detect_source};
pub use extractor::{Extraction, LayoutExtractor, ScanState, extract_section};
pub use aggregator::aggregate_by_code;
pub use presence::{contains_amount, find_missing};
pub use reconciliation::{
    ReconciliationEngine, ReconciliationRecord, FieldStatus, CompareMode,
};
pub use plan::{ComparisonPlan, Comparison, FieldBinding, ValueSource};
pub use config::RunConfig;
pub use report::{ComparisonReport, SectionReport, Diagnostic, DiagnosticKind};
pub use pipeline::{ReconciliationPipeline, run};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
