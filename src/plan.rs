// 📐 Comparison Plan
// Which values are compared against which, and under what names.
//
// A comparison pairs two value sources (ledger records, extracted layout
// sections, captured totals, whole documents) and binds field keys on each
// side to one display name. Like the layout table, the plan is data: the
// built-in plan can be replaced by a JSON file.

use crate::layout::{sections, LayoutTable};
use crate::reconciliation::CompareMode;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const BUILTIN_PLAN_VERSION: &str = "lra-sped-2025.08";

/// Key under which a captured-sum source exposes its total
pub const CAPTURED_TOTAL: &str = "total";

// ============================================================================
// FIELD BINDINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBinding {
    pub field: String,
    pub display_name: String,

    /// Key on side A; defaults to `field`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,

    /// Key on side B; defaults to `field`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
}

impl FieldBinding {
    /// Same key on both sides
    pub fn same(field: &str, display_name: &str) -> Self {
        FieldBinding {
            field: field.to_string(),
            display_name: display_name.to_string(),
            left: None,
            right: None,
        }
    }

    pub fn mapped(field: &str, display_name: &str, left: &str, right: &str) -> Self {
        FieldBinding {
            field: field.to_string(),
            display_name: display_name.to_string(),
            left: Some(left.to_string()),
            right: Some(right.to_string()),
        }
    }

    pub fn left_key(&self) -> &str {
        self.left.as_deref().unwrap_or(&self.field)
    }

    pub fn right_key(&self) -> &str {
        self.right.as_deref().unwrap_or(&self.field)
    }
}

// ============================================================================
// VALUE SOURCES
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAggregate {
    /// First record of the type
    #[default]
    First,
    /// Column-wise sum over every record of the type
    Sum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueSource {
    /// Columns of a ledger record type
    Ledger {
        record: String,
        #[serde(default)]
        aggregate: LedgerAggregate,
    },

    /// Field values of an extracted layout section
    Section { section: String },

    /// Sum of a free-capture section, under the key `total`
    CapturedSum { section: String },

    /// Full text of a document (presence comparisons)
    Document { document: String },
}

impl ValueSource {
    pub fn ledger(record: &str, aggregate: LedgerAggregate) -> Self {
        ValueSource::Ledger {
            record: record.to_string(),
            aggregate,
        }
    }

    pub fn section(section: &str) -> Self {
        ValueSource::Section {
            section: section.to_string(),
        }
    }

    pub fn captured_sum(section: &str) -> Self {
        ValueSource::CapturedSum {
            section: section.to_string(),
        }
    }

    /// Layout section this source reads, if any
    pub fn section_id(&self) -> Option<&str> {
        match self {
            ValueSource::Section { section } | ValueSource::CapturedSum { section } => Some(section.as_str()),
            _ => None,
        }
    }
}

// ============================================================================
// COMPARISONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub id: String,
    pub title: String,
    pub left: ValueSource,
    pub right: ValueSource,
    pub fields: Vec<FieldBinding>,
    #[serde(default)]
    pub mode: CompareMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonPlan {
    pub version: String,
    pub comparisons: Vec<Comparison>,
}

impl ComparisonPlan {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read plan file: {:?}", path.as_ref()))?;

        let plan: ComparisonPlan = serde_json::from_str(&content).context("Failed to parse plan JSON")?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn comparison(&self, id: &str) -> Option<&Comparison> {
        self.comparisons.iter().find(|c| c.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for comparison in &self.comparisons {
            if !seen.insert(comparison.id.as_str()) {
                return Err(anyhow!("Duplicate comparison id: {}", comparison.id));
            }
            if comparison.fields.is_empty() {
                return Err(anyhow!("Comparison {} binds no fields", comparison.id));
            }
            if comparison.mode == CompareMode::Presence
                && !matches!(comparison.right, ValueSource::Document { .. })
            {
                return Err(anyhow!(
                    "Presence comparison {} must read a document on the right side",
                    comparison.id
                ));
            }
        }

        Ok(())
    }

    /// Every section a comparison reads must exist in the layout table
    pub fn check_against(&self, layout: &LayoutTable) -> Result<()> {
        for comparison in &self.comparisons {
            for source in [&comparison.left, &comparison.right] {
                if let Some(id) = source.section_id() {
                    if layout.section(id).is_none() {
                        return Err(anyhow!(
                            "Comparison {} reads unknown layout section {} (layout {})",
                            comparison.id,
                            id,
                            layout.version
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn builtin() -> Self {
        use crate::layout::totals::*;
        use sections::*;

        let totals = |kind: &str| {
            vec![
                FieldBinding::same(OPERATION_TOTAL, &format!("{} - Valor Contábil", kind)),
                FieldBinding::same(ICMS_BASE, &format!("{} - Base de Cálculo ICMS", kind)),
                FieldBinding::same(ICMS_TOTAL, &format!("{} - ICMS", kind)),
            ]
        };

        ComparisonPlan {
            version: BUILTIN_PLAN_VERSION.to_string(),
            comparisons: vec![
                Comparison {
                    id: "e110".to_string(),
                    title: "Apuração do ICMS (E110) x Livro".to_string(),
                    left: ValueSource::ledger("E110", LedgerAggregate::First),
                    right: ValueSource::section(BOOK_E110),
                    fields: vec![
                        FieldBinding::same("VL_TOT_DEBITOS", "Total de Débitos (Subtotal 004)"),
                        FieldBinding::same("VL_TOT_CREDITOS", "Total de Créditos (Total 010)"),
                        FieldBinding::same("VL_SLD_CREDOR_ANT", "Saldo Credor Anterior (009)"),
                        FieldBinding::same("VL_ICMS_RECOLHER", "Imposto a Recolher (013)"),
                    ],
                    mode: CompareMode::Numeric,
                },
                Comparison {
                    id: "apuracao_saldos".to_string(),
                    title: "Apuração dos Saldos (013/014) x E110".to_string(),
                    left: ValueSource::ledger("E110", LedgerAggregate::First),
                    right: ValueSource::section(BOOK_BALANCE_CODES),
                    fields: vec![
                        FieldBinding::mapped("VL_ICMS_RECOLHER", "013 - Imposto a Recolher", "VL_ICMS_RECOLHER", "013"),
                        FieldBinding::mapped(
                            "VL_SLD_CREDOR_TRANSP",
                            "014 - Saldo Credor a Transportar",
                            "VL_SLD_CREDOR_TRANSP",
                            "014",
                        ),
                    ],
                    mode: CompareMode::Numeric,
                },
                Comparison {
                    id: "entradas".to_string(),
                    title: "Relatório das Entradas (PVA) x Livro".to_string(),
                    left: ValueSource::section(PVA_ENTRIES_TOTALS),
                    right: ValueSource::section(BOOK_ENTRIES_TOTALS),
                    fields: totals("Entradas"),
                    mode: CompareMode::Numeric,
                },
                Comparison {
                    id: "saidas".to_string(),
                    title: "Relatório das Saídas (PVA) x Livro".to_string(),
                    left: ValueSource::section(PVA_EXITS_TOTALS),
                    right: ValueSource::section(BOOK_EXITS_TOTALS),
                    fields: totals("Saídas"),
                    mode: CompareMode::Numeric,
                },
                Comparison {
                    id: "e116".to_string(),
                    title: "Obrigações a Recolher (E116) x Informações Complementares".to_string(),
                    left: ValueSource::ledger("E116", LedgerAggregate::Sum),
                    right: ValueSource::captured_sum(BOOK_COMPLEMENTARY),
                    fields: vec![FieldBinding::mapped(
                        "VL_OR",
                        "Soma E116 (VL_OR) x Soma Inf. Complementares",
                        "VL_OR",
                        CAPTURED_TOTAL,
                    )],
                    mode: CompareMode::Numeric,
                },
                Comparison {
                    id: "icms_recolher".to_string(),
                    title: "Apuração do ICMS (PVA) x Livro".to_string(),
                    left: ValueSource::section(PVA_TAX_DUE),
                    right: ValueSource::section(BOOK_BALANCE_CODES),
                    fields: vec![FieldBinding::mapped(
                        "VL_ICMS_RECOLHER",
                        "Valor Total do ICMS a Recolher x 013",
                        "VL_ICMS_RECOLHER",
                        "013",
                    )],
                    mode: CompareMode::Numeric,
                },
                Comparison {
                    id: "saldo_credor".to_string(),
                    title: "Saldo Credor a Transportar (PVA) x Livro".to_string(),
                    left: ValueSource::section(PVA_CREDIT_BALANCE),
                    right: ValueSource::section(BOOK_BALANCE_CODES),
                    fields: vec![FieldBinding::mapped(
                        "VL_SLD_CREDOR_TRANSP",
                        "Saldo Credor a Transportar x 014",
                        "VL_SLD_CREDOR_TRANSP",
                        "014",
                    )],
                    mode: CompareMode::Numeric,
                },
                Comparison {
                    id: "extra_apuracao".to_string(),
                    title: "Valores Extra-Apuração (PVA) x Livro".to_string(),
                    left: ValueSource::captured_sum(PVA_EXTRA_ASSESSMENT),
                    right: ValueSource::captured_sum(BOOK_COMPLEMENTARY),
                    fields: vec![FieldBinding::same(CAPTURED_TOTAL, "Soma Extra-Apuração x Soma Inf. Complementares")],
                    mode: CompareMode::Numeric,
                },
            ],
        }
    }
}

impl Default for ComparisonPlan {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_plan_matches_builtin_layout() {
        let plan = ComparisonPlan::builtin();

        assert!(plan.validate().is_ok());
        assert!(plan.check_against(&LayoutTable::builtin()).is_ok());
        assert_eq!(plan.comparison("e110").unwrap().fields.len(), 4);
    }

    #[test]
    fn test_pva_credit_balance_reads_code_014() {
        let plan = ComparisonPlan::builtin();
        let comparison = plan.comparison("saldo_credor").unwrap();

        assert_eq!(comparison.left, ValueSource::section(sections::PVA_CREDIT_BALANCE));
        assert_eq!(comparison.right, ValueSource::section(sections::BOOK_BALANCE_CODES));
        assert_eq!(comparison.fields[0].right_key(), "014");
    }

    #[test]
    fn test_unknown_section_rejected() {
        let mut plan = ComparisonPlan::builtin();
        plan.comparisons[0].right = ValueSource::section("nao_existe");

        let err = plan.check_against(&LayoutTable::builtin()).unwrap_err();
        assert!(err.to_string().contains("nao_existe"));
    }

    #[test]
    fn test_presence_needs_document() {
        let mut plan = ComparisonPlan::builtin();
        plan.comparisons[0].mode = CompareMode::Presence;
        assert!(plan.validate().is_err());

        plan.comparisons[0].right = ValueSource::Document {
            document: "livro".to_string(),
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_binding_keys_default_to_field() {
        let same = FieldBinding::same("VL_OR", "E116");
        assert_eq!(same.left_key(), "VL_OR");
        assert_eq!(same.right_key(), "VL_OR");

        let mapped = FieldBinding::mapped("saldo", "Saldo", "VL_SLD_CREDOR_TRANSP", "014");
        assert_eq!(mapped.left_key(), "VL_SLD_CREDOR_TRANSP");
        assert_eq!(mapped.right_key(), "014");
    }

    #[test]
    fn test_plan_from_json_file() {
        let json = r#"{
            "version": "custom",
            "comparisons": [{
                "id": "debitos",
                "title": "Débitos",
                "left": { "kind": "ledger", "record": "E110" },
                "right": { "kind": "document", "document": "livro" },
                "fields": [{ "field": "VL_TOT_DEBITOS", "display_name": "Débitos" }],
                "mode": "presence"
            }]
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let plan = ComparisonPlan::from_file(file.path()).unwrap();
        let comparison = plan.comparison("debitos").unwrap();

        assert_eq!(comparison.mode, CompareMode::Presence);
        assert_eq!(comparison.left, ValueSource::ledger("E110", LedgerAggregate::First));
    }
}
