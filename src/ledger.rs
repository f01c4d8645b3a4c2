// 📒 Source Ledger Reader
// Pipe-delimited SPED Fiscal records -> per-record-type tables
//
// Every line looks like |E110|1000,00|0,00|...| - leading and trailing
// delimiters, first field is the record type. The file is Windows-1252,
// decoding it as UTF-8 corrupts accented descriptions.

use crate::numeric::{denormalize, normalize};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const DELIMITER: char = '|';

/// Default Bloc E boundaries for the audit capture
pub const BLOC_E_START: &str = "E001";
pub const BLOC_E_STOP: &str = "E990";

// ============================================================================
// SCHEMAS
// ============================================================================

/// Column layout of one record type. Position 0 is always REG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub code: String,
    pub columns: Vec<String>,
}

impl RecordSchema {
    pub fn new(code: &str, columns: &[&str]) -> Self {
        RecordSchema {
            code: code.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Immutable set of record schemas keyed by record type
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, RecordSchema>,
}

impl SchemaRegistry {
    pub fn new(schemas: Vec<RecordSchema>) -> Self {
        SchemaRegistry {
            schemas: schemas.into_iter().map(|s| (s.code.clone(), s)).collect(),
        }
    }

    /// Record types the reconciliation reads from a SPED Fiscal file
    pub fn sped_fiscal() -> Self {
        SchemaRegistry::new(vec![
            RecordSchema::new(
                "G110",
                &["REG", "DT_INI", "DT_FIN", "SALDO_IN_ICMS", "SOM_PARC", "VL_TRIB_EXP", "VL_TOTAL", "IND_PER_SAI", "ICMS_APROP", "SOM_ICMS_OC"],
            ),
            RecordSchema::new(
                "G125",
                &["REG", "COD_IND_BEM", "DT_MOV", "TIPO_MOV", "VL_IMOB_ICMS_OP", "VL_IMOB_ICMS_ST", "VL_IMOB_ICMS_FRT", "VL_IMOB_ICMS_DIF", "NUM_PARC", "VL_PARC_PASS"],
            ),
            RecordSchema::new("E100", &["REG", "DT_INI", "DT_FIN"]),
            RecordSchema::new(
                "E110",
                &[
                    "REG",
                    "VL_TOT_DEBITOS",
                    "VL_AJ_DEBITOS",
                    "VL_TOT_AJ_DEBITOS",
                    "VL_ESTORNOS_CRED",
                    "VL_TOT_CREDITOS",
                    "VL_AJ_CREDITOS",
                    "VL_TOT_AJ_CREDITOS",
                    "VL_ESTORNOS_DEB",
                    "VL_SLD_CREDOR_ANT",
                    "VL_SLD_APURADO",
                    "VL_TOT_DED",
                    "VL_ICMS_RECOLHER",
                    "VL_SLD_CREDOR_TRANSP",
                    "DEB_ESP",
                ],
            ),
            RecordSchema::new("E111", &["REG", "COD_AJ_APUR", "DESCR_COMPL_AJ", "VL_AJ_APUR"]),
            RecordSchema::new(
                "E116",
                &["REG", "COD_OR", "VL_OR", "DT_VCTO", "COD_REC", "NUM_PROC", "IND_PROC", "PROC", "TXT_COMPL", "MES_REF"],
            ),
            RecordSchema::new("E200", &["REG", "UF", "DT_INI", "DT_FIN"]),
            RecordSchema::new("E300", &["REG", "UF", "DT_INI", "DT_FIN"]),
            RecordSchema::new("E500", &["REG", "IND_APUR", "DT_INI", "DT_FIN"]),
            RecordSchema::new(
                "1900",
                &["REG", "IND_APUR_ICMS", "DESCR_COMPL_OUT_APUR", "VL_TOT_CRED_ICMS_ANT_OA", "VL_TOT_DEB_ICMS_OA", "VL_SLD_CRED_ICMS_TRANSP_OA", "VL_SLD_DEV_ICMS_ANT_OA"],
            ),
        ])
    }

    /// Subset of the registry restricted to the given record types
    pub fn only(&self, codes: &[&str]) -> Self {
        SchemaRegistry {
            schemas: self
                .schemas
                .iter()
                .filter(|(code, _)| codes.contains(&code.as_str()))
                .map(|(code, schema)| (code.clone(), schema.clone()))
                .collect(),
        }
    }

    pub fn get(&self, code: &str) -> Option<&RecordSchema> {
        self.schemas.get(code)
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(|k| k.as_str())
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One decoded ledger line. Only the columns present on the line are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub record_type: String,
    pub line_number: usize,
    pub fields: BTreeMap<String, String>,
}

impl LedgerRecord {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(|s| s.as_str())
    }

    /// Column as a Decimal; absent or non-numeric columns are zero
    pub fn amount(&self, column: &str) -> Decimal {
        self.get(column).map(normalize).unwrap_or(Decimal::ZERO)
    }

    /// Every column normalized, keyed by column name
    pub fn amounts(&self) -> BTreeMap<String, Decimal> {
        self.fields
            .iter()
            .map(|(column, raw)| (column.clone(), normalize(raw)))
            .collect()
    }
}

/// Ordered records per record type, in file order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerTables {
    tables: BTreeMap<String, Vec<LedgerRecord>>,
}

impl LedgerTables {
    /// Records of one type; empty when the file had none
    pub fn records(&self, code: &str) -> &[LedgerRecord] {
        self.tables.get(code).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn first(&self, code: &str) -> Option<&LedgerRecord> {
        self.records(code).first()
    }

    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }

    pub fn total_records(&self) -> usize {
        self.tables.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }

    /// Raw rows of every record type not in `skip`, for display
    pub fn rows_except(&self, skip: &[&str]) -> BTreeMap<String, Vec<BTreeMap<String, String>>> {
        self.tables
            .iter()
            .filter(|(code, _)| !skip.contains(&code.as_str()))
            .map(|(code, records)| (code.clone(), records.iter().map(|r| r.fields.clone()).collect()))
            .collect()
    }

    fn push(&mut self, record: LedgerRecord) {
        self.tables
            .entry(record.record_type.clone())
            .or_default()
            .push(record);
    }
}

/// Fiscal period declared by E100
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

// ============================================================================
// LEDGER FILE
// ============================================================================

/// Decoded ledger contents plus a fingerprint of the raw bytes
#[derive(Debug, Clone)]
pub struct LedgerFile {
    pub text: String,
    pub sha256: String,
}

impl LedgerFile {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to open ledger: {}", path.display()))?;
        Ok(LedgerFile::from_bytes(&bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);

        LedgerFile {
            text: decode_ledger(bytes),
            sha256: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn records(&self, schemas: &SchemaRegistry) -> LedgerTables {
        parse_records(&self.text, schemas)
    }

    pub fn bloc(&self, start: &str, stop: &str) -> Vec<String> {
        extract_bloc_from_text(&self.text, start, stop)
    }
}

/// Decode Windows-1252 bytes. No BOM sniffing: the code page is fixed.
pub fn decode_ledger(bytes: &[u8]) -> String {
    let (decoded, _had_errors) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
    decoded.into_owned()
}

// ============================================================================
// READERS
// ============================================================================

/// Read every record whose type is known to `schemas`.
///
/// Unknown record types, blank lines and lines not starting with the
/// delimiter are skipped. A line shorter than its schema leaves the trailing
/// columns unset.
pub fn read_records(path: &Path, schemas: &SchemaRegistry) -> Result<LedgerTables> {
    let ledger = LedgerFile::open(path)?;
    Ok(ledger.records(schemas))
}

pub fn parse_records(text: &str, schemas: &SchemaRegistry) -> LedgerTables {
    let mut reader = ReaderBuilder::new()
        .delimiter(DELIMITER as u8)
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(text.as_bytes());

    let mut tables = LedgerTables::default();

    for (idx, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                debug!("Skipping unreadable ledger line {}: {}", idx + 1, e);
                continue;
            }
        };

        let line_number = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 1);

        let values: Vec<&str> = record.iter().collect();
        let fields = match strip_artifacts(&values) {
            Some(f) => f,
            None => continue,
        };

        let schema = match fields.first().and_then(|code| schemas.get(code)) {
            Some(s) => s,
            None => continue,
        };

        let named = schema
            .columns
            .iter()
            .zip(fields.iter())
            .map(|(column, value)| (column.clone(), value.to_string()))
            .collect();

        tables.push(LedgerRecord {
            record_type: schema.code.clone(),
            line_number,
            fields: named,
        });
    }

    info!(
        "Ledger parsed: {} records across {} record types",
        tables.total_records(),
        tables.tables.len()
    );

    tables
}

/// Drop the empty fields produced by the leading/trailing delimiter.
/// Returns None for lines that do not start with the delimiter.
fn strip_artifacts<'a>(values: &[&'a str]) -> Option<Vec<&'a str>> {
    let (first, rest) = values.split_first()?;
    if !first.trim().is_empty() || rest.is_empty() {
        return None;
    }

    let mut fields: Vec<&str> = rest.to_vec();
    if fields.last().map(|f| f.trim().is_empty()).unwrap_or(false) {
        fields.pop();
    }

    if fields.first().map(|f| f.trim().is_empty()).unwrap_or(true) {
        return None;
    }

    Some(fields)
}

/// Record type of a raw ledger line, if it is delimiter-shaped
pub fn record_type_of(line: &str) -> Option<&str> {
    let body = line.trim().strip_prefix(DELIMITER)?;
    let code = body.split(DELIMITER).next()?;
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

// ============================================================================
// TARGET FIELDS (search literals)
// ============================================================================

/// Fields turned into search literals, with a human description
const TARGET_FIELDS: &[(&str, &str, &str)] = &[
    ("E110", "VL_TOT_DEBITOS", "E110 - Total de Débitos"),
    ("E110", "VL_TOT_CREDITOS", "E110 - Total de Créditos"),
    ("E110", "VL_SLD_CREDOR_ANT", "E110 - Saldo Credor Anterior"),
    ("E110", "VL_ICMS_RECOLHER", "E110 - ICMS a Recolher"),
    ("E110", "VL_SLD_CREDOR_TRANSP", "E110 - Saldo Credor a Transportar"),
    ("E116", "VL_OR", "E116 - Obrigação a Recolher"),
];

/// Map of display-formatted value -> description for the target fields.
///
/// Only the first E110 is read (one assessment per file); every E116
/// contributes. Zero values are skipped: "0,00" matches anywhere.
pub fn read_target_fields(path: &Path) -> Result<BTreeMap<String, String>> {
    let ledger = LedgerFile::open(path)?;
    Ok(target_fields(&ledger.records(&SchemaRegistry::sped_fiscal())))
}

pub fn target_fields(tables: &LedgerTables) -> BTreeMap<String, String> {
    let mut literals: BTreeMap<String, String> = BTreeMap::new();

    for (record_type, column, description) in TARGET_FIELDS {
        let records = tables.records(record_type);
        let records = if *record_type == "E110" {
            &records[..records.len().min(1)]
        } else {
            records
        };

        for record in records {
            let value = record.amount(column);
            if value.is_zero() {
                continue;
            }

            literals
                .entry(denormalize(value))
                .and_modify(|d| {
                    d.push_str("; ");
                    d.push_str(description);
                })
                .or_insert_with(|| description.to_string());
        }
    }

    literals
}

// ============================================================================
// BLOC CAPTURE
// ============================================================================

/// Raw lines from the `start` record through the `stop` record, verbatim.
pub fn extract_bloc(path: &Path, start: &str, stop: &str) -> Result<Vec<String>> {
    let ledger = LedgerFile::open(path)?;
    Ok(ledger.bloc(start, stop))
}

pub fn extract_bloc_from_text(text: &str, start: &str, stop: &str) -> Vec<String> {
    let mut captured = Vec::new();
    let mut inside = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let code = record_type_of(trimmed);
        if !inside && code == Some(start) {
            inside = true;
        }

        if inside {
            captured.push(trimmed.to_string());
            if code == Some(stop) {
                break;
            }
        }
    }

    captured
}

// ============================================================================
// DERIVED VALUES
// ============================================================================

/// Unique E111 adjustment codes, first-seen order
pub fn collect_adjustment_codes(tables: &LedgerTables) -> Vec<String> {
    let mut seen = HashSet::new();
    tables
        .records("E111")
        .iter()
        .filter_map(|r| r.get("COD_AJ_APUR"))
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(c.to_string()))
        .map(|c| c.to_string())
        .collect()
}

/// Sum of one column over every record of a type
pub fn sum_column(tables: &LedgerTables, record_type: &str, column: &str) -> Decimal {
    tables
        .records(record_type)
        .iter()
        .map(|r| r.amount(column))
        .sum()
}

/// Period from the first E100, when its dates parse as ddmmyyyy
pub fn ledger_period(tables: &LedgerTables) -> Option<LedgerPeriod> {
    let e100 = tables.first("E100")?;
    let start = NaiveDate::parse_from_str(e100.get("DT_INI")?, "%d%m%Y").ok()?;
    let end = NaiveDate::parse_from_str(e100.get("DT_FIN")?, "%d%m%Y").ok()?;
    Some(LedgerPeriod { start, end })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const SAMPLE: &str = "|0000|017|0|01082025|31082025|EMPRESA|\n\
|E001|0|\n\
|E100|01082025|31082025|\n\
|E110|1000,00|0,00|0,00|0,00|400,00|0,00|0,00|0,00|50,00|550,00|0,00|550,00|0,00|0,00|\n\
|E111|PA10000025|Ajuste de crédito|120,00|\n\
|E111|PA10000099|Outro ajuste|30,00|\n\
|E111|PA10000025|Repetido|10,00|\n\
|E116|000|300,00|10092025|1234|||||082025|\n\
|E116|000|250,00|10092025|1234|||||082025|\n\
|E990|9|\n\
|9999|20|\n";

    #[test]
    fn test_e110_columns_follow_schema_order() {
        let tables = parse_records(SAMPLE, &SchemaRegistry::sped_fiscal());
        let e110 = tables.first("E110").expect("E110 present");

        assert_eq!(e110.amount("VL_TOT_DEBITOS"), dec!(1000.00));
        assert_eq!(e110.amount("VL_TOT_CREDITOS"), dec!(400.00));
        assert_eq!(e110.amount("VL_SLD_CREDOR_ANT"), dec!(50.00));
        assert_eq!(e110.amount("VL_ICMS_RECOLHER"), dec!(550.00));
        assert_eq!(e110.get("REG"), Some("E110"));
        assert_eq!(e110.line_number, 4);
    }

    #[test]
    fn test_unknown_and_malformed_lines_are_skipped() {
        let text = "lixo sem delimitador\n\n|ZZZZ|1|\n||\n|E100|01082025|31082025|\n";
        let tables = parse_records(text, &SchemaRegistry::sped_fiscal());

        assert_eq!(tables.total_records(), 1);
        assert_eq!(tables.records("E100").len(), 1);
        assert!(tables.records("ZZZZ").is_empty());
        assert!(tables.records("E110").is_empty());
    }

    #[test]
    fn test_short_line_leaves_columns_unset() {
        let tables = parse_records("|E110|1000,00|5,00|\n", &SchemaRegistry::sped_fiscal());
        let e110 = tables.first("E110").expect("E110 present");

        assert_eq!(e110.fields.len(), 3);
        assert_eq!(e110.get("VL_AJ_DEBITOS"), Some("5,00"));
        assert_eq!(e110.get("VL_ICMS_RECOLHER"), None);
        assert_eq!(e110.amount("VL_ICMS_RECOLHER"), Decimal::ZERO);
    }

    #[test]
    fn test_registry_subset_filters_types() {
        let registry = SchemaRegistry::sped_fiscal().only(&["E116"]);
        let tables = parse_records(SAMPLE, &registry);

        assert_eq!(tables.records("E116").len(), 2);
        assert!(tables.records("E110").is_empty());
        assert_eq!(registry.codes().collect::<Vec<_>>(), vec!["E116"]);
    }

    #[test]
    fn test_windows_1252_decoding() {
        // "Crédito" with é encoded as 0xE9
        let bytes = b"|E111|PA10000025|Cr\xe9dito|1,00|\n";
        let ledger = LedgerFile::from_bytes(bytes);
        let tables = ledger.records(&SchemaRegistry::sped_fiscal());

        assert_eq!(tables.first("E111").and_then(|r| r.get("DESCR_COMPL_AJ")), Some("Crédito"));
        assert_eq!(ledger.sha256.len(), 64);
    }

    #[test]
    fn test_read_records_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let tables = read_records(file.path(), &SchemaRegistry::sped_fiscal()).unwrap();
        assert_eq!(tables.records("E111").len(), 3);
        assert_eq!(sum_column(&tables, "E116", "VL_OR"), dec!(550.00));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = read_records(Path::new("/nonexistent/sped.txt"), &SchemaRegistry::sped_fiscal());
        assert!(result.is_err());
    }

    #[test]
    fn test_target_fields_build_search_literals() {
        let tables = parse_records(SAMPLE, &SchemaRegistry::sped_fiscal());
        let literals = target_fields(&tables);

        assert_eq!(literals.get("1.000,00").map(|s| s.as_str()), Some("E110 - Total de Débitos"));
        assert_eq!(literals.get("300,00").map(|s| s.as_str()), Some("E116 - Obrigação a Recolher"));
        assert_eq!(
            literals.get("550,00").map(|s| s.as_str()),
            Some("E110 - ICMS a Recolher")
        );
        // Zero-valued fields never become literals
        assert!(!literals.contains_key("0,00"));
    }

    #[test]
    fn test_extract_bloc_captures_inclusive_range() {
        let bloc = extract_bloc_from_text(SAMPLE, BLOC_E_START, BLOC_E_STOP);

        assert_eq!(bloc.first().map(|s| s.as_str()), Some("|E001|0|"));
        assert_eq!(bloc.last().map(|s| s.as_str()), Some("|E990|9|"));
        assert_eq!(bloc.len(), 9);
        assert!(!bloc.iter().any(|l| l.starts_with("|9999|")));
    }

    #[test]
    fn test_extract_bloc_without_start_is_empty() {
        assert!(extract_bloc_from_text("|0000|x|\n|9999|1|\n", "E001", "E990").is_empty());
    }

    #[test]
    fn test_adjustment_codes_unique_in_order() {
        let tables = parse_records(SAMPLE, &SchemaRegistry::sped_fiscal());
        assert_eq!(collect_adjustment_codes(&tables), vec!["PA10000025", "PA10000099"]);
    }

    #[test]
    fn test_rows_except_keeps_raw_columns() {
        let text = format!("{}|G110|01082025|31082025|1.000,00|10,00|||||\n", SAMPLE);
        let tables = parse_records(&text, &SchemaRegistry::sped_fiscal());

        let rows = tables.rows_except(&["E110"]);

        assert!(!rows.contains_key("E110"));
        assert_eq!(rows["E116"].len(), 2);
        assert_eq!(rows["E116"][1]["VL_OR"], "250,00");
        assert_eq!(rows["G110"][0]["SALDO_IN_ICMS"], "1.000,00");
    }

    #[test]
    fn test_ledger_period() {
        let tables = parse_records(SAMPLE, &SchemaRegistry::sped_fiscal());
        let period = ledger_period(&tables).expect("period");

        assert_eq!(period.start, NaiveDate::from_ymd_opt(2025, 8, 1).unwrap());
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2025, 8, 31).unwrap());
    }
}
