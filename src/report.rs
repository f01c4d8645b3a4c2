// 📋 Comparison Report
// Output object of one reconciliation run + JSON/CSV/text rendering

use crate::aggregator::grand_total;
use crate::ledger::LedgerPeriod;
use crate::numeric::denormalize;
use crate::reconciliation::{FieldStatus, ReconciliationRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::warn;

// ============================================================================
// DIAGNOSTICS
// ============================================================================

/// Non-fatal problems met while reading the inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// File missing or unreadable; that document contributes nothing
    Io,
    PageNotFound,
    AnchorNotFound,
    ValueNotFound,
    OffsetOutOfRange,
    /// Row anchor matched but carried too few values
    RowRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub source: String,
    pub message: String,
}

impl Diagnostic {
    /// Build and log in one step
    pub fn emit(kind: DiagnosticKind, source: &str, message: String) -> Self {
        warn!(source = source, kind = ?kind, "{}", message);
        Diagnostic {
            kind,
            source: source.to_string(),
            message,
        }
    }
}

// ============================================================================
// REPORT SECTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionReport {
    pub id: String,
    pub title: String,
    pub status: FieldStatus,
    pub records: Vec<ReconciliationRecord>,
}

impl SectionReport {
    pub fn new(id: &str, title: &str, records: Vec<ReconciliationRecord>) -> Self {
        SectionReport {
            id: id.to_string(),
            title: title.to_string(),
            status: FieldStatus::aggregate(records.iter().map(|r| r.status)),
            records,
        }
    }

    pub fn divergent_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == FieldStatus::Divergent)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMeta {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub engine_version: String,
    pub layout_version: String,
    pub tolerance: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<LedgerPeriod>,
}

// ============================================================================
// COMPARISON REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub meta: ReportMeta,
    pub status: FieldStatus,
    pub sections: Vec<SectionReport>,

    /// Adjustment code -> summed value found in the rendered report
    pub code_sums: BTreeMap<String, String>,

    /// Sum of every code value above
    pub code_total: String,

    /// E111 codes the rendered report never prints
    pub missing_codes: Vec<String>,

    /// Raw values captured by free-capture sections, keyed by section id
    pub captured: BTreeMap<String, Vec<String>>,

    /// Bloc E lines, verbatim, for manual audit
    pub ledger_bloc: Vec<String>,

    /// Parsed ledger records other than E110, record type -> rows
    pub ledger_tables: BTreeMap<String, Vec<BTreeMap<String, String>>>,

    pub diagnostics: Vec<Diagnostic>,
}

impl ComparisonReport {
    pub fn new(meta: ReportMeta, sections: Vec<SectionReport>) -> Self {
        let status = FieldStatus::aggregate(sections.iter().map(|s| s.status));
        ComparisonReport {
            meta,
            status,
            sections,
            code_sums: BTreeMap::new(),
            code_total: denormalize(Decimal::ZERO),
            missing_codes: Vec::new(),
            captured: BTreeMap::new(),
            ledger_bloc: Vec::new(),
            ledger_tables: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn with_code_sums(mut self, sums: &BTreeMap<String, Decimal>) -> Self {
        self.code_sums = sums
            .iter()
            .map(|(code, value)| (code.clone(), denormalize(*value)))
            .collect();
        self.code_total = denormalize(grand_total(sums));
        self
    }

    pub fn is_consistent(&self) -> bool {
        self.status == FieldStatus::Ok
    }

    pub fn section(&self, id: &str) -> Option<&SectionReport> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn records(&self) -> impl Iterator<Item = (&SectionReport, &ReconciliationRecord)> {
        self.sections
            .iter()
            .flat_map(|s| s.records.iter().map(move |r| (s, r)))
    }

    pub fn summary(&self) -> String {
        let total = self.records().count();
        let divergent = self
            .records()
            .filter(|(_, r)| r.status == FieldStatus::Divergent)
            .count();

        format!(
            "Reconciliation {}: {} fields compared across {} sections, {} divergent, {} missing codes, {} diagnostics",
            self.status.label(),
            total,
            self.sections.len(),
            divergent,
            self.missing_codes.len(),
            self.diagnostics.len()
        )
    }

    // ------------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------------

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize report")
    }

    /// One CSV row per reconciled field
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(["section", "field", "display_name", "value_a", "value_b", "difference", "status"])?;

        for (section, record) in self.records() {
            csv.write_record([
                section.id.as_str(),
                record.field.as_str(),
                record.display_name.as_str(),
                record.value_a.as_str(),
                record.value_b.as_str(),
                record.difference.as_str(),
                record.status.label(),
            ])?;
        }

        csv.flush().context("Failed to flush CSV report")?;
        Ok(())
    }

    /// Human-readable rendering for terminals
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Run {} ({})\n", self.meta.run_id, self.meta.generated_at.to_rfc3339()));
        if let Some(period) = &self.meta.period {
            out.push_str(&format!("Period {} - {}\n", period.start, period.end));
        }
        out.push_str(&format!("Layout {}\n\n", self.meta.layout_version));

        for section in &self.sections {
            out.push_str(&format!("== {} [{}]\n", section.title, section.status.label()));
            for record in &section.records {
                out.push_str(&format!(
                    "  {:<45} {:>18} {:>18}  {}\n",
                    record.display_name,
                    record.value_a,
                    record.value_b,
                    record.status.label()
                ));
            }
            out.push('\n');
        }

        if !self.code_sums.is_empty() {
            out.push_str("== Códigos de ajuste no livro\n");
            for (code, value) in &self.code_sums {
                out.push_str(&format!("  {:<14} {:>18}\n", code, value));
            }
            out.push_str(&format!("  {:<14} {:>18}\n", "Total", self.code_total));
            out.push('\n');
        }

        if !self.missing_codes.is_empty() {
            out.push_str("== Códigos E111 ausentes no livro\n");
            for code in &self.missing_codes {
                out.push_str(&format!("  {}\n", code));
            }
            out.push('\n');
        }

        if !self.ledger_tables.is_empty() {
            out.push_str("== Registros do SPED\n");
            for (record_type, rows) in &self.ledger_tables {
                out.push_str(&format!("  {:<6} {} registro(s)\n", record_type, rows.len()));
            }
            out.push('\n');
        }

        for diagnostic in &self.diagnostics {
            out.push_str(&format!("! [{}] {}\n", diagnostic.source, diagnostic.message));
        }

        out.push_str(&self.summary());
        out.push('\n');
        out
    }
}
