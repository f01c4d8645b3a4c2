// ⚖️ Reconciliation Engine - Compare ledger values against the rendered report
//
// For every field:
//   diff = value_a - value_b
//   OK        if |diff| < tolerance
//   DIVERGENT otherwise
//
// Missing fields count as zero on either side. Both mappings must already be
// canonical Decimals; no unit conversion happens here.

use crate::numeric::{denormalize, NO_TOKEN};
use crate::plan::FieldBinding;
use crate::presence::contains_amount;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Absolute tolerance used when none is configured (one cent)
pub const DEFAULT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

// ============================================================================
// FIELD STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldStatus {
    Ok,
    Divergent,
}

impl FieldStatus {
    pub fn label(&self) -> &'static str {
        match self {
            FieldStatus::Ok => "OK",
            FieldStatus::Divergent => "DIVERGENT",
        }
    }

    /// DIVERGENT if any member is; an empty set is OK
    pub fn aggregate<I: IntoIterator<Item = FieldStatus>>(statuses: I) -> FieldStatus {
        if statuses.into_iter().any(|s| s == FieldStatus::Divergent) {
            FieldStatus::Divergent
        } else {
            FieldStatus::Ok
        }
    }
}

/// How a record was compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
    #[default]
    Numeric,
    /// "Was this figure printed anywhere" instead of positional equality
    Presence,
}

// ============================================================================
// RECONCILIATION RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub field: String,
    pub display_name: String,
    pub value_a: String,
    pub value_b: String,
    pub difference: String,
    pub status: FieldStatus,
    #[serde(default)]
    pub mode: CompareMode,
}

impl ReconciliationRecord {
    pub fn is_ok(&self) -> bool {
        self.status == FieldStatus::Ok
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    /// Strict upper bound for |a - b| (default: 0,01)
    pub tolerance: Decimal,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn with_tolerance(tolerance: Decimal) -> Self {
        ReconciliationEngine {
            tolerance: tolerance.abs(),
        }
    }

    /// Quick check without building a record
    pub fn is_within_tolerance(&self, a: Decimal, b: Decimal) -> bool {
        (a - b).abs() < self.tolerance
    }

    /// Numeric comparison of every bound field.
    ///
    /// ```
    /// use fiscal_reconciliation::{FieldBinding, FieldStatus, ReconciliationEngine};
    /// use rust_decimal::Decimal;
    /// use std::collections::BTreeMap;
    /// use std::str::FromStr;
    ///
    /// let engine = ReconciliationEngine::new();
    /// let fields = vec![FieldBinding::same("VL_TOT_DEBITOS", "Total de Débitos")];
    /// let a = BTreeMap::from([("VL_TOT_DEBITOS".to_string(), Decimal::from_str("100.00").unwrap())]);
    /// let b = BTreeMap::from([("VL_TOT_DEBITOS".to_string(), Decimal::from_str("100.005").unwrap())]);
    ///
    /// let records = engine.reconcile(&fields, &a, &b);
    /// assert_eq!(records[0].status, FieldStatus::Ok);
    /// ```
    pub fn reconcile(
        &self,
        fields: &[FieldBinding],
        values_a: &BTreeMap<String, Decimal>,
        values_b: &BTreeMap<String, Decimal>,
    ) -> Vec<ReconciliationRecord> {
        fields
            .iter()
            .map(|binding| {
                let a = lookup(values_a, binding.left_key());
                let b = lookup(values_b, binding.right_key());
                self.compare(binding, a, b)
            })
            .collect()
    }

    /// Compare one pair of values under a binding's names
    pub fn compare(&self, binding: &FieldBinding, a: Decimal, b: Decimal) -> ReconciliationRecord {
        let difference = a - b;
        let status = if difference.abs() < self.tolerance {
            FieldStatus::Ok
        } else {
            FieldStatus::Divergent
        };

        debug!(field = %binding.field, %a, %b, status = status.label(), "Compared");

        ReconciliationRecord {
            field: binding.field.clone(),
            display_name: binding.display_name.clone(),
            value_a: denormalize(a),
            value_b: denormalize(b),
            difference: denormalize(difference),
            status,
            mode: CompareMode::Numeric,
        }
    }

    /// Presence comparison: OK when the formatted A value is printed as a
    /// whole number in `haystack`. Zero or missing A values cannot be confirmed.
    pub fn reconcile_presence(
        &self,
        fields: &[FieldBinding],
        values_a: &BTreeMap<String, Decimal>,
        haystack: &str,
    ) -> Vec<ReconciliationRecord> {
        fields
            .iter()
            .map(|binding| {
                let a = lookup(values_a, binding.left_key());
                let literal = denormalize(a);
                let found = !a.is_zero() && contains_amount(haystack, &literal);

                ReconciliationRecord {
                    field: binding.field.clone(),
                    display_name: binding.display_name.clone(),
                    value_a: literal.clone(),
                    value_b: if found { literal } else { NO_TOKEN.to_string() },
                    difference: String::new(),
                    status: if found { FieldStatus::Ok } else { FieldStatus::Divergent },
                    mode: CompareMode::Presence,
                }
            })
            .collect()
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(values: &BTreeMap<String, Decimal>, key: &str) -> Decimal {
    values.get(key).copied().unwrap_or(Decimal::ZERO)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn one(field: &str, value: Decimal) -> BTreeMap<String, Decimal> {
        BTreeMap::from([(field.to_string(), value)])
    }

    #[test]
    fn test_default_tolerance_is_one_cent() {
        assert_eq!(ReconciliationEngine::default().tolerance, dec!(0.01));
    }

    #[test]
    fn test_tolerance_boundary() {
        let engine = ReconciliationEngine::new();
        let fields = vec![FieldBinding::same("x", "X")];

        let ok = engine.reconcile(&fields, &one("x", dec!(100.00)), &one("x", dec!(100.005)));
        assert_eq!(ok[0].status, FieldStatus::Ok);

        let divergent = engine.reconcile(&fields, &one("x", dec!(100.00)), &one("x", dec!(100.02)));
        assert_eq!(divergent[0].status, FieldStatus::Divergent);
        assert_eq!(divergent[0].difference, "-0,02");

        // Exactly the tolerance is not strictly below it
        assert!(!engine.is_within_tolerance(dec!(100.00), dec!(100.01)));
        assert!(engine.is_within_tolerance(dec!(100.00), dec!(100.009)));
    }

    #[test]
    fn test_missing_field_counts_as_zero() {
        let engine = ReconciliationEngine::new();
        let fields = vec![FieldBinding::same("a", "A"), FieldBinding::same("b", "B")];

        let records = engine.reconcile(&fields, &one("a", dec!(5)), &BTreeMap::new());

        assert_eq!(records[0].value_b, "0,00");
        assert_eq!(records[0].status, FieldStatus::Divergent);
        // Absent on both sides compares 0 vs 0
        assert_eq!(records[1].status, FieldStatus::Ok);
    }

    #[test]
    fn test_bindings_map_different_keys() {
        let engine = ReconciliationEngine::new();
        let fields = vec![FieldBinding::mapped("saldo", "Imposto a Recolher (013)", "VL_ICMS_RECOLHER", "013")];

        let records = engine.reconcile(
            &fields,
            &one("VL_ICMS_RECOLHER", dec!(1550)),
            &one("013", dec!(1550.00)),
        );

        assert!(records[0].is_ok());
        assert_eq!(records[0].value_a, "1.550,00");
        assert_eq!(records[0].display_name, "Imposto a Recolher (013)");
    }

    #[test]
    fn test_custom_tolerance() {
        let engine = ReconciliationEngine::with_tolerance(dec!(-1.00));
        assert_eq!(engine.tolerance, dec!(1.00));
        assert!(engine.is_within_tolerance(dec!(10.00), dec!(10.99)));
    }

    #[test]
    fn test_presence_mode() {
        let engine = ReconciliationEngine::new();
        let fields = vec![
            FieldBinding::same("debitos", "Débitos"),
            FieldBinding::same("creditos", "Créditos"),
            FieldBinding::same("zero", "Zero"),
        ];
        let values = BTreeMap::from([
            ("debitos".to_string(), dec!(226690.63)),
            ("creditos".to_string(), dec!(10)),
            ("zero".to_string(), Decimal::ZERO),
        ]);
        let haystack = "004 - SUBTOTAL\n226.690,63\n0,00";

        let records = engine.reconcile_presence(&fields, &values, haystack);

        assert_eq!(records[0].status, FieldStatus::Ok);
        assert_eq!(records[0].value_b, "226.690,63");
        assert_eq!(records[1].status, FieldStatus::Divergent);
        assert_eq!(records[1].value_b, NO_TOKEN);
        assert_eq!(records[2].status, FieldStatus::Divergent);
        assert!(records.iter().all(|r| r.mode == CompareMode::Presence));
    }

    #[test]
    fn test_presence_ignores_amount_inside_larger_number() {
        let engine = ReconciliationEngine::new();
        let fields = vec![FieldBinding::same("recolher", "Imposto a Recolher")];
        let values = BTreeMap::from([("recolher".to_string(), dec!(550))]);

        let records = engine.reconcile_presence(&fields, &values, "Totais 1.550,00 2.550,00");
        assert_eq!(records[0].status, FieldStatus::Divergent);

        let records = engine.reconcile_presence(&fields, &values, "Totais 1.550,00\n013 550,00");
        assert_eq!(records[0].status, FieldStatus::Ok);
    }

    #[test]
    fn test_status_aggregation() {
        assert_eq!(FieldStatus::aggregate(vec![]), FieldStatus::Ok);
        assert_eq!(
            FieldStatus::aggregate(vec![FieldStatus::Ok, FieldStatus::Divergent]),
            FieldStatus::Divergent
        );
        assert_eq!(serde_json::to_string(&FieldStatus::Divergent).unwrap(), "\"DIVERGENT\"");
        assert_eq!(serde_json::to_string(&FieldStatus::Ok).unwrap(), "\"OK\"");
    }
}
