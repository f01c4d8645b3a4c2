// 🗺️ Layout Table
// Versioned description of where values live in each rendered document
//
// section id -> document -> page anchors -> section/stop anchors -> mode -> fields
// A new template version is a new table (JSON file), not a code change.

use crate::locator::Anchor;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const BUILTIN_LAYOUT_VERSION: &str = "lra-pva-2025.08";

/// Document roles a section can point at
pub mod documents {
    /// Livro Registro de Apuração (the rendered report under audit)
    pub const BOOK: &str = "livro";
    /// PVA "Relatório das Entradas"
    pub const ENTRIES_REPORT: &str = "sped_entradas";
    /// PVA "Relatório das Saídas"
    pub const EXITS_REPORT: &str = "sped_saidas";
    /// PVA "Apuração do ICMS"
    pub const ASSESSMENT_REPORT: &str = "sped_apuracao";
}

/// Section ids of the built-in table
pub mod sections {
    pub const BOOK_ENTRIES_TOTALS: &str = "livro_entradas_totais";
    pub const BOOK_EXITS_TOTALS: &str = "livro_saidas_totais";
    pub const BOOK_E110: &str = "livro_apuracao_e110";
    pub const BOOK_BALANCE_CODES: &str = "livro_apuracao_saldos";
    pub const BOOK_COMPLEMENTARY: &str = "livro_informacoes_complementares";
    pub const PVA_ENTRIES_TOTALS: &str = "sped_entradas_totais";
    pub const PVA_EXITS_TOTALS: &str = "sped_saidas_totais";
    pub const PVA_TAX_DUE: &str = "sped_apuracao_recolher";
    pub const PVA_CREDIT_BALANCE: &str = "sped_apuracao_saldo_credor";
    pub const PVA_EXTRA_ASSESSMENT: &str = "sped_apuracao_extra";
}

/// Field names shared by the Entradas/Saídas totals
pub mod totals {
    pub const OPERATION_TOTAL: &str = "total_operacao";
    pub const ICMS_BASE: &str = "base_de_calculo_icms";
    pub const ICMS_TOTAL: &str = "total_icms";
}

// ============================================================================
// LAYOUT TYPES
// ============================================================================

/// Value read from a line at a fixed distance from its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetField {
    pub field: String,
    pub label: Anchor,
    pub offset: isize,
}

impl OffsetField {
    pub fn new(field: &str, label: Anchor, offset: isize) -> Self {
        OffsetField {
            field: field.to_string(),
            label,
            offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutMode {
    /// Each field sits at `label line + offset`
    VerticalOffset { fields: Vec<OffsetField> },

    /// All fields share one row, read left to right
    HorizontalRow {
        row_anchor: Anchor,
        fields: Vec<String>,
        min_tokens: usize,
        #[serde(default)]
        lookahead: usize,
    },

    /// Lines whose leading token is a known code carry that code's value
    CodeRow { codes: Vec<String> },

    /// Every money-shaped value between the section anchor and the stop marker
    FreeCapture,
}

impl LayoutMode {
    pub fn name(&self) -> &str {
        match self {
            LayoutMode::VerticalOffset { .. } => "vertical_offset",
            LayoutMode::HorizontalRow { .. } => "horizontal_row",
            LayoutMode::CodeRow { .. } => "code_row",
            LayoutMode::FreeCapture => "free_capture",
        }
    }
}

/// What happens when a field matches more than once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    LastWins,
    FirstNonZero,
}

/// Which classified pages are scanned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageScan {
    #[default]
    FirstMatch,
    /// Every matching page, ascending; later pages overwrite earlier ones
    AllMatching,
    /// Matching pages in order until one yields a value
    FirstFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionLayout {
    pub id: String,
    pub document: String,

    /// All must appear in a page's text for the page to be scanned
    #[serde(default)]
    pub page_anchors: Vec<String>,

    /// None = the section starts at the top of the page
    #[serde(default)]
    pub section_anchor: Option<Anchor>,

    #[serde(default)]
    pub stop_marker: Option<Anchor>,

    pub mode: LayoutMode,

    #[serde(default)]
    pub duplicates: DuplicatePolicy,

    #[serde(default)]
    pub page_scan: PageScan,

    /// Free capture ends at the first blank or very short line once
    /// something was captured
    #[serde(default)]
    pub stop_on_blank_after_capture: bool,
}

impl SectionLayout {
    pub fn new(id: &str, document: &str, page_anchors: &[&str], mode: LayoutMode) -> Self {
        SectionLayout {
            id: id.to_string(),
            document: document.to_string(),
            page_anchors: page_anchors.iter().map(|a| a.to_string()).collect(),
            section_anchor: None,
            stop_marker: None,
            mode,
            duplicates: DuplicatePolicy::default(),
            page_scan: PageScan::default(),
            stop_on_blank_after_capture: false,
        }
    }

    pub fn with_section_anchor(mut self, anchor: Anchor) -> Self {
        self.section_anchor = Some(anchor);
        self
    }

    pub fn with_stop_marker(mut self, anchor: Anchor) -> Self {
        self.stop_marker = Some(anchor);
        self
    }

    pub fn with_duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    pub fn with_page_scan(mut self, scan: PageScan) -> Self {
        self.page_scan = scan;
        self
    }

    pub fn stopping_on_blank(mut self) -> Self {
        self.stop_on_blank_after_capture = true;
        self
    }
}

// ============================================================================
// LAYOUT TABLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutTable {
    pub version: String,
    pub sections: Vec<SectionLayout>,
}

impl LayoutTable {
    /// Load a table from JSON
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read layout file: {:?}", path.as_ref()))?;

        let table: LayoutTable =
            serde_json::from_str(&content).context("Failed to parse layout JSON")?;

        table.validate()?;
        Ok(table)
    }

    pub fn section(&self, id: &str) -> Option<&SectionLayout> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn sections_for<'a>(&'a self, document: &'a str) -> impl Iterator<Item = &'a SectionLayout> {
        self.sections.iter().filter(move |s| s.document == document)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for section in &self.sections {
            if !seen.insert(section.id.as_str()) {
                return Err(anyhow!("Duplicate layout section id: {}", section.id));
            }

            match &section.mode {
                LayoutMode::VerticalOffset { fields } if fields.is_empty() => {
                    return Err(anyhow!("Section {} has no vertical fields", section.id));
                }
                LayoutMode::HorizontalRow { fields, .. } if fields.is_empty() => {
                    return Err(anyhow!("Section {} has no row fields", section.id));
                }
                LayoutMode::CodeRow { codes } if codes.is_empty() => {
                    return Err(anyhow!("Section {} has no codes", section.id));
                }
                LayoutMode::FreeCapture if section.section_anchor.is_none() => {
                    return Err(anyhow!("Free-capture section {} needs a section anchor", section.id));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Livro P9 / PVA report layout observed in the 2025 templates
    pub fn builtin() -> Self {
        use documents::*;
        use sections::*;
        use totals::*;

        let pva_stop = Anchor::contains("INFORMAÇÃO DO ARQUIVO");
        let totals_fields = vec![
            OPERATION_TOTAL.to_string(),
            ICMS_BASE.to_string(),
            ICMS_TOTAL.to_string(),
        ];

        LayoutTable {
            version: BUILTIN_LAYOUT_VERSION.to_string(),
            sections: vec![
                // --- Livro: horizontal "Totais" rows ---
                SectionLayout::new(
                    BOOK_ENTRIES_TOTALS,
                    BOOK,
                    &["ENTRADA"],
                    LayoutMode::HorizontalRow {
                        row_anchor: Anchor::starts_with("Totais"),
                        fields: totals_fields.clone(),
                        min_tokens: 3,
                        lookahead: 0,
                    },
                )
                .with_duplicates(DuplicatePolicy::FirstNonZero),
                SectionLayout::new(
                    BOOK_EXITS_TOTALS,
                    BOOK,
                    &["SAÍDAS"],
                    LayoutMode::HorizontalRow {
                        row_anchor: Anchor::starts_with("Totais"),
                        fields: totals_fields.clone(),
                        min_tokens: 3,
                        lookahead: 0,
                    },
                )
                .with_duplicates(DuplicatePolicy::FirstNonZero),
                // --- Livro: own-operations assessment (E110 counterpart) ---
                SectionLayout::new(
                    BOOK_E110,
                    BOOK,
                    &[
                        "001 - POR SAÍDAS / PRESTAÇÕES COM DÉBITO DO IMPOSTO",
                        "005 - POR ENTRADAS / AQUISIÇÕES COM CRÉDITO DO IMPOSTO",
                    ],
                    LayoutMode::VerticalOffset {
                        fields: vec![
                            OffsetField::new("VL_TOT_DEBITOS", Anchor::starts_with("004 - SUBTOTAL"), 1),
                            OffsetField::new("VL_TOT_CREDITOS", Anchor::starts_with("010 - TOTAL"), 1),
                            OffsetField::new(
                                "VL_SLD_CREDOR_ANT",
                                Anchor::starts_with("009 - SALDO CREDOR DO PERÍODO ANTERIOR - ICMS"),
                                1,
                            ),
                            OffsetField::new("VL_ICMS_RECOLHER", Anchor::starts_with("013 - IMPOSTO A RECOLHER"), 1),
                        ],
                    },
                )
                .with_duplicates(DuplicatePolicy::FirstNonZero),
                SectionLayout::new(
                    BOOK_BALANCE_CODES,
                    BOOK,
                    &["APURAÇÃO DOS SALDOS"],
                    LayoutMode::CodeRow {
                        codes: vec!["013".to_string(), "014".to_string()],
                    },
                )
                .with_section_anchor(Anchor::contains("APURAÇÃO DOS SALDOS")),
                SectionLayout::new(
                    BOOK_COMPLEMENTARY,
                    BOOK,
                    &["INFORMAÇÕES COMPLEMENTARES"],
                    LayoutMode::FreeCapture,
                )
                .with_section_anchor(Anchor::contains("INFORMAÇÕES COMPLEMENTARES"))
                .with_stop_marker(Anchor::starts_with("Observações"))
                .stopping_on_blank(),
                // --- PVA reports: vertical cells below "TOTAL" ---
                // Saídas renders one extra cell between the operation total and
                // the ICMS base, so its offsets differ from Entradas.
                SectionLayout::new(
                    PVA_ENTRIES_TOTALS,
                    ENTRIES_REPORT,
                    &[],
                    LayoutMode::VerticalOffset {
                        fields: vec![
                            OffsetField::new(OPERATION_TOTAL, Anchor::equals("TOTAL"), 1),
                            OffsetField::new(ICMS_BASE, Anchor::equals("TOTAL"), 2),
                            OffsetField::new(ICMS_TOTAL, Anchor::equals("TOTAL"), 3),
                        ],
                    },
                )
                .with_stop_marker(pva_stop.clone())
                .with_page_scan(PageScan::FirstFound),
                SectionLayout::new(
                    PVA_EXITS_TOTALS,
                    EXITS_REPORT,
                    &[],
                    LayoutMode::VerticalOffset {
                        fields: vec![
                            OffsetField::new(OPERATION_TOTAL, Anchor::equals("TOTAL"), 1),
                            OffsetField::new(ICMS_BASE, Anchor::equals("TOTAL"), 3),
                            OffsetField::new(ICMS_TOTAL, Anchor::equals("TOTAL"), 4),
                        ],
                    },
                )
                .with_stop_marker(pva_stop.clone())
                .with_page_scan(PageScan::FirstFound),
                SectionLayout::new(
                    PVA_TAX_DUE,
                    ASSESSMENT_REPORT,
                    &[],
                    LayoutMode::VerticalOffset {
                        fields: vec![OffsetField::new(
                            "VL_ICMS_RECOLHER",
                            Anchor::equals("VALOR TOTAL DO ICMS A RECOLHER"),
                            1,
                        )],
                    },
                )
                .with_stop_marker(pva_stop.clone())
                .with_page_scan(PageScan::FirstFound),
                SectionLayout::new(
                    PVA_CREDIT_BALANCE,
                    ASSESSMENT_REPORT,
                    &[],
                    LayoutMode::VerticalOffset {
                        fields: vec![OffsetField::new(
                            "VL_SLD_CREDOR_TRANSP",
                            Anchor::equals("VALOR TOTAL DO SALDO CREDOR A TRANSPORTAR PARA O PERÍODO SEGUINTE"),
                            1,
                        )],
                    },
                )
                .with_stop_marker(pva_stop.clone())
                .with_page_scan(PageScan::FirstFound),
                SectionLayout::new(
                    PVA_EXTRA_ASSESSMENT,
                    ASSESSMENT_REPORT,
                    &["VALORES RECOLHIDOS OU A RECOLHER, EXTRA-APURAÇÃO"],
                    LayoutMode::FreeCapture,
                )
                .with_section_anchor(Anchor::contains(
                    "VALORES RECOLHIDOS OU A RECOLHER, EXTRA-APURAÇÃO",
                ))
                .with_stop_marker(pva_stop),
            ],
        }
    }
}

impl Default for LayoutTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_table_is_valid() {
        let table = LayoutTable::builtin();
        assert!(table.validate().is_ok());
        assert_eq!(table.version, BUILTIN_LAYOUT_VERSION);
        assert_eq!(table.sections_for(documents::BOOK).count(), 5);
        assert!(table.section(sections::PVA_TAX_DUE).is_some());
    }

    #[test]
    fn test_pva_sections_scan_until_found() {
        let table = LayoutTable::builtin();

        for id in [
            sections::PVA_ENTRIES_TOTALS,
            sections::PVA_EXITS_TOTALS,
            sections::PVA_TAX_DUE,
            sections::PVA_CREDIT_BALANCE,
        ] {
            assert_eq!(table.section(id).unwrap().page_scan, PageScan::FirstFound, "{}", id);
        }
        assert!(table.section(sections::BOOK_COMPLEMENTARY).unwrap().stop_on_blank_after_capture);
    }

    #[test]
    fn test_entries_and_exits_offsets_differ() {
        let table = LayoutTable::builtin();
        let offsets = |id: &str| match &table.section(id).unwrap().mode {
            LayoutMode::VerticalOffset { fields } => fields.iter().map(|f| f.offset).collect::<Vec<_>>(),
            other => panic!("unexpected mode {}", other.name()),
        };

        assert_ne!(offsets(sections::PVA_ENTRIES_TOTALS), offsets(sections::PVA_EXITS_TOTALS));
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let table = LayoutTable::builtin();
        let json = serde_json::to_string_pretty(&table).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let loaded = LayoutTable::from_file(file.path()).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "version": "custom-1",
            "sections": [{
                "id": "totais",
                "document": "livro",
                "mode": { "kind": "horizontal_row",
                          "row_anchor": { "text": "Totais" },
                          "fields": ["a", "b"], "min_tokens": 2 }
            }]
        }"#;

        let table: LayoutTable = serde_json::from_str(json).unwrap();
        let section = table.section("totais").unwrap();

        assert_eq!(section.duplicates, DuplicatePolicy::LastWins);
        assert_eq!(section.page_scan, PageScan::FirstMatch);
        assert!(section.page_anchors.is_empty());
        assert!(matches!(section.mode, LayoutMode::HorizontalRow { lookahead: 0, .. }));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut table = LayoutTable::builtin();
        let copy = table.sections[0].clone();
        table.sections.push(copy);

        assert!(table.validate().is_err());
    }

    #[test]
    fn test_free_capture_without_anchor_rejected() {
        let table = LayoutTable {
            version: "x".to_string(),
            sections: vec![SectionLayout::new("s", documents::BOOK, &[], LayoutMode::FreeCapture)],
        };
        assert!(table.validate().is_err());
    }
}
