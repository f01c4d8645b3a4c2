// 🔄 Reconciliation Pipeline
// ledger + rendered book (+ optional PVA reports) -> ComparisonReport
//
// 1. Load inputs; unreadable files become Io diagnostics
// 2. Parse ledger tables, extract every layout section
// 3. Resolve each comparison's two sides and reconcile
// 4. Auxiliary sections: printed literals, code sums, missing codes, Bloc E

use crate::aggregator::aggregate_by_code;
use crate::config::RunConfig;
use crate::document::RenderedDocument;
use crate::extractor::{extract_all, Extraction};
use crate::layout::{documents, LayoutTable};
use crate::ledger::{
    collect_adjustment_codes, ledger_period, sum_column, target_fields, LedgerFile, LedgerTables, SchemaRegistry,
};
use crate::numeric::normalize;
use crate::plan::{Comparison, ComparisonPlan, FieldBinding, LedgerAggregate, ValueSource, CAPTURED_TOTAL};
use crate::presence::find_missing;
use crate::reconciliation::{CompareMode, ReconciliationEngine};
use crate::report::{ComparisonReport, Diagnostic, DiagnosticKind, ReportMeta, SectionReport};
use anyhow::{bail, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

/// Id of the presence section built from the ledger's target fields
pub const PRINTED_VALUES_SECTION: &str = "valores_impressos";

/// Everything extracted from the inputs, before any comparison
pub struct RunContext {
    pub tables: LedgerTables,
    pub documents: BTreeMap<String, RenderedDocument>,
    pub extractions: BTreeMap<String, Extraction>,

    /// Roles whose file was supplied, readable or not
    pub provided: BTreeSet<String>,
}

impl RunContext {
    /// Field -> value map for one side of a comparison
    pub fn resolve(&self, source: &ValueSource) -> BTreeMap<String, Decimal> {
        match source {
            ValueSource::Ledger { record, aggregate } => match aggregate {
                LedgerAggregate::First => self
                    .tables
                    .first(record)
                    .map(|r| r.amounts())
                    .unwrap_or_default(),
                LedgerAggregate::Sum => {
                    let columns: BTreeSet<&String> = self
                        .tables
                        .records(record)
                        .iter()
                        .flat_map(|r| r.fields.keys())
                        .collect();
                    columns
                        .into_iter()
                        .map(|column| (column.clone(), sum_column(&self.tables, record, column)))
                        .collect()
                }
            },
            ValueSource::Section { section } => self
                .extractions
                .get(section)
                .map(|e| e.values.clone())
                .unwrap_or_default(),
            ValueSource::CapturedSum { section } => {
                let total = self
                    .extractions
                    .get(section)
                    .map(|e| e.captured_total())
                    .unwrap_or(Decimal::ZERO);
                BTreeMap::from([(CAPTURED_TOTAL.to_string(), total)])
            }
            ValueSource::Document { .. } => BTreeMap::new(),
        }
    }

    pub fn full_text(&self, document: &str) -> String {
        self.documents
            .get(document)
            .map(|d| d.full_text())
            .unwrap_or_default()
    }

    /// Role of the document a source depends on; the ledger is always supplied
    fn source_document<'a>(&self, source: &'a ValueSource, layout: &'a LayoutTable) -> Option<&'a str> {
        match source {
            ValueSource::Ledger { .. } => None,
            ValueSource::Document { document } => Some(document.as_str()),
            ValueSource::Section { section } | ValueSource::CapturedSum { section } => {
                layout.section(section).map(|s| s.document.as_str())
            }
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct ReconciliationPipeline {
    pub config: RunConfig,
    pub layout: LayoutTable,
    pub plan: ComparisonPlan,
    pub engine: ReconciliationEngine,
}

impl ReconciliationPipeline {
    /// Load layout and plan named by the config (built-ins otherwise)
    pub fn new(config: RunConfig) -> Result<Self> {
        let layout = config.layout()?;
        let plan = config.plan()?;
        Self::with_parts(config, layout, plan)
    }

    pub fn with_parts(config: RunConfig, layout: LayoutTable, plan: ComparisonPlan) -> Result<Self> {
        layout.validate()?;
        plan.validate()?;
        plan.check_against(&layout)?;

        Ok(ReconciliationPipeline {
            engine: config.engine(),
            config,
            layout,
            plan,
        })
    }

    /// One full run. Fails only when neither primary input can be read.
    pub fn run(&self, ledger_path: &Path, book_path: &Path) -> Result<ComparisonReport> {
        let mut diagnostics = Vec::new();

        let ledger = match LedgerFile::open(ledger_path) {
            Ok(l) => Some(l),
            Err(e) => {
                diagnostics.push(Diagnostic::emit(DiagnosticKind::Io, "sped", format!("{:#}", e)));
                None
            }
        };

        let mut docs = BTreeMap::new();
        let mut provided = BTreeSet::from([documents::BOOK.to_string()]);

        match RenderedDocument::load(documents::BOOK, book_path) {
            Ok(doc) => {
                docs.insert(documents::BOOK.to_string(), doc);
            }
            Err(e) => {
                diagnostics.push(Diagnostic::emit(DiagnosticKind::Io, documents::BOOK, format!("{:#}", e)));
            }
        }

        if ledger.is_none() && docs.is_empty() {
            bail!(
                "Neither the ledger ({}) nor the rendered book ({}) could be read",
                ledger_path.display(),
                book_path.display()
            );
        }

        self.load_reports(&mut docs, &mut provided, &mut diagnostics);

        let tables = ledger
            .as_ref()
            .map(|l| l.records(&SchemaRegistry::sped_fiscal()))
            .unwrap_or_default();

        let extractions = extract_all(&self.layout, &docs);
        for extraction in extractions.values() {
            diagnostics.extend(extraction.diagnostics.iter().cloned());
        }

        let ctx = RunContext {
            tables,
            documents: docs,
            extractions,
            provided,
        };

        let mut sections: Vec<SectionReport> = self
            .plan
            .comparisons
            .iter()
            .filter(|c| self.is_runnable(c, &ctx))
            .map(|c| self.run_comparison(c, &ctx))
            .collect();

        let book_text = ctx.full_text(documents::BOOK);
        sections.push(self.printed_values(&ctx.tables, &book_text));

        let meta = ReportMeta {
            run_id: uuid::Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            engine_version: crate::VERSION.to_string(),
            layout_version: self.layout.version.clone(),
            tolerance: self.engine.tolerance,
            ledger_sha256: ledger.as_ref().map(|l| l.sha256.clone()),
            period: ledger_period(&ctx.tables),
        };

        let mut report = ComparisonReport::new(meta, sections).with_code_sums(&aggregate_by_code(&book_text));
        report.missing_codes = find_missing(&book_text, &collect_adjustment_codes(&ctx.tables));
        report.captured = ctx
            .extractions
            .iter()
            .filter(|(_, e)| !e.captured.is_empty())
            .map(|(id, e)| (id.clone(), e.captured.clone()))
            .collect();
        report.ledger_bloc = ledger
            .as_ref()
            .map(|l| l.bloc(&self.config.bloc_start, &self.config.bloc_stop))
            .unwrap_or_default();
        report.ledger_tables = ctx.tables.rows_except(&["E110"]);
        report.diagnostics = diagnostics;

        info!("{}", report.summary());
        Ok(report)
    }

    fn load_reports(
        &self,
        docs: &mut BTreeMap<String, RenderedDocument>,
        provided: &mut BTreeSet<String>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        for role in self.config.report_files.keys() {
            let Some(path) = self.config.report_path(role) else {
                continue;
            };
            if !path.exists() {
                debug!("No {} report at {}", role, path.display());
                continue;
            }

            provided.insert(role.clone());
            match RenderedDocument::load(role, &path) {
                Ok(doc) => {
                    docs.insert(role.clone(), doc);
                }
                Err(e) => diagnostics.push(Diagnostic::emit(DiagnosticKind::Io, role, format!("{:#}", e))),
            }
        }
    }

    /// A comparison runs when every document it reads was supplied
    fn is_runnable(&self, comparison: &Comparison, ctx: &RunContext) -> bool {
        for source in [&comparison.left, &comparison.right] {
            if let Some(role) = ctx.source_document(source, &self.layout) {
                if !ctx.provided.contains(role) {
                    debug!("Skipping {}: no {} document supplied", comparison.id, role);
                    return false;
                }
            }
        }
        true
    }

    pub fn run_comparison(&self, comparison: &Comparison, ctx: &RunContext) -> SectionReport {
        let left = ctx.resolve(&comparison.left);

        let records = match (comparison.mode, &comparison.right) {
            (CompareMode::Presence, ValueSource::Document { document }) => {
                self.engine
                    .reconcile_presence(&comparison.fields, &left, &ctx.full_text(document))
            }
            _ => {
                let right = ctx.resolve(&comparison.right);
                self.engine.reconcile(&comparison.fields, &left, &right)
            }
        };

        SectionReport::new(&comparison.id, &comparison.title, records)
    }

    /// Ledger figures that must be printed somewhere in the book
    fn printed_values(&self, tables: &LedgerTables, book_text: &str) -> SectionReport {
        let literals = target_fields(tables);

        let fields: Vec<FieldBinding> = literals
            .iter()
            .map(|(literal, description)| FieldBinding::same(literal, description))
            .collect();
        let values: BTreeMap<String, Decimal> = literals
            .keys()
            .map(|literal| (literal.clone(), normalize(literal)))
            .collect();

        let records = self.engine.reconcile_presence(&fields, &values, book_text);
        SectionReport::new(PRINTED_VALUES_SECTION, "Valores do SPED impressos no Livro", records)
    }
}

/// Run with defaults for everything but the inputs
pub fn run(ledger_path: &Path, book_path: &Path, config: RunConfig) -> Result<ComparisonReport> {
    ReconciliationPipeline::new(config)?.run(ledger_path, book_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciliation::FieldStatus;
    use std::fs;
    use tempfile::TempDir;

    const LEDGER: &str = "\
|0000|017|0|01082025|31082025|EMPRESA TESTE LTDA|
|E001|0|
|E100|01082025|31082025|
|E110|1000,00|0,00|0,00|0,00|400,00|0,00|0,00|0,00|50,00|550,00|0,00|550,00|0,00|0,00|
|E111|PA10000025|Estorno|100,00|
|E111|PA10000099|Outro|10,00|
|E116|000|300,00|10092025|1234|
|E116|000|250,00|10092025|1234|
|E990|8|
|9999|10|
";

    fn book_pages() -> String {
        [
            "LIVRO REGISTRO DE ENTRADAS\nTotais 2.000,00 1.500,00 180,00",
            "LIVRO REGISTRO DE SAÍDAS\nTotais 5.000,00 4.000,00 480,00",
            "001 - POR SAÍDAS / PRESTAÇÕES COM DÉBITO DO IMPOSTO\n\
004 - SUBTOTAL\n1.000,00\n\
005 - POR ENTRADAS / AQUISIÇÕES COM CRÉDITO DO IMPOSTO\n\
009 - SALDO CREDOR DO PERÍODO ANTERIOR - ICMS\n50,00\n\
010 - TOTAL\n400,00\n\
013 - IMPOSTO A RECOLHER\n550,00",
            "APURAÇÃO DOS SALDOS\n013 - IMPOSTO A RECOLHER 550,00\n014 - SALDO CREDOR A TRANSPORTAR 0,00",
            "INFORMAÇÕES COMPLEMENTARES\nOBRIGAÇÃO 000 1.300,00 venc 10/09/2025 PA10000025 100,00\nOBRIGAÇÃO 000 1.250,00\nObservações",
            "DEMONSTRATIVO DAS OBRIGAÇÕES\nE116 300,00\nE116 250,00",
        ]
        .join("\x0c")
    }

    fn write_inputs(dir: &TempDir, book: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let ledger = dir.path().join("sped.txt");
        let book_path = dir.path().join("livro.txt");
        fs::write(&ledger, LEDGER).unwrap();
        fs::write(&book_path, book).unwrap();
        (ledger, book_path)
    }

    #[test]
    fn test_end_to_end_without_pva_reports() {
        let dir = TempDir::new().unwrap();
        let (ledger, book) = write_inputs(&dir, &book_pages());

        let report = run(&ledger, &book, RunConfig::default()).unwrap();

        // PVA comparisons are skipped when no reports dir is configured
        assert!(report.section("entradas").is_none());

        let e110 = report.section("e110").unwrap();
        assert_eq!(e110.status, FieldStatus::Ok, "{:?}", e110.records);

        let saldos = report.section("apuracao_saldos").unwrap();
        assert_eq!(saldos.status, FieldStatus::Ok);

        // E116 sums 550,00; the book captures 1.300,00 + 100,00 + 1.250,00
        let e116 = report.section("e116").unwrap();
        assert_eq!(e116.status, FieldStatus::Divergent);
        assert_eq!(e116.records[0].value_a, "550,00");

        assert_eq!(report.missing_codes, vec!["PA10000099"]);
        assert_eq!(report.code_sums["PA10000025"], "100,00");
        assert_eq!(report.ledger_bloc.first().map(|s| s.as_str()), Some("|E001|0|"));
        assert_eq!(report.ledger_bloc.last().map(|s| s.as_str()), Some("|E990|8|"));
        assert!(report.meta.ledger_sha256.is_some());
        assert_eq!(report.meta.period.as_ref().unwrap().start.to_string(), "2025-08-01");
        assert!(!report.is_consistent());

        assert!(!report.ledger_tables.contains_key("E110"));
        assert_eq!(report.ledger_tables["E111"].len(), 2);
        assert_eq!(report.ledger_tables["E116"][0]["VL_OR"], "300,00");
    }

    #[test]
    fn test_printed_values_section() {
        let dir = TempDir::new().unwrap();
        let (ledger, book) = write_inputs(&dir, &book_pages());

        let report = run(&ledger, &book, RunConfig::default()).unwrap();
        let printed = report.section(PRINTED_VALUES_SECTION).unwrap();

        let by_name: BTreeMap<&str, FieldStatus> = printed
            .records
            .iter()
            .map(|r| (r.display_name.as_str(), r.status))
            .collect();

        assert_eq!(by_name["E110 - Total de Débitos"], FieldStatus::Ok);
        assert_eq!(by_name["E116 - Obrigação a Recolher"], FieldStatus::Ok);
    }

    #[test]
    fn test_with_pva_reports() {
        let dir = TempDir::new().unwrap();
        let (ledger, book) = write_inputs(&dir, &book_pages());

        fs::write(
            dir.path().join("entradas.txt"),
            "RELATÓRIO DAS ENTRADAS\nTOTAL\n2.000,00\n1.500,00\n180,00\nINFORMAÇÃO DO ARQUIVO",
        )
        .unwrap();
        fs::write(
            dir.path().join("saidas.txt"),
            "RELATÓRIO DAS SAÍDAS\nTOTAL\n5.000,00\n0,00\n4.000,00\n481,00\nINFORMAÇÃO DO ARQUIVO",
        )
        .unwrap();

        let config = RunConfig {
            reports_dir: Some(dir.path().to_path_buf()),
            report_files: BTreeMap::from([
                (documents::ENTRIES_REPORT.to_string(), "entradas.txt".to_string()),
                (documents::EXITS_REPORT.to_string(), "saidas.txt".to_string()),
                (documents::ASSESSMENT_REPORT.to_string(), "apuracao.txt".to_string()),
            ]),
            ..Default::default()
        };

        let report = run(&ledger, &book, config).unwrap();

        assert_eq!(report.section("entradas").unwrap().status, FieldStatus::Ok);

        let saidas = report.section("saidas").unwrap();
        assert_eq!(saidas.divergent_count(), 1);
        assert_eq!(saidas.records[2].value_a, "481,00");

        // apuracao.txt does not exist, so its comparisons never run
        assert!(report.section("icms_recolher").is_none());
        assert!(report.section("saldo_credor").is_none());
    }

    #[test]
    fn test_assessment_report_values_on_second_page() {
        let dir = TempDir::new().unwrap();
        let (ledger, book) = write_inputs(&dir, &book_pages());

        fs::write(
            dir.path().join("apuracao.txt"),
            "APURAÇÃO DO ICMS - OPERAÇÕES PRÓPRIAS\n\
VALOR TOTAL DOS DÉBITOS\n1.000,00\x0c\
VALOR TOTAL DO ICMS A RECOLHER\n550,00\n\
VALOR TOTAL DO SALDO CREDOR A TRANSPORTAR PARA O PERÍODO SEGUINTE\n0,00\n\
INFORMAÇÃO DO ARQUIVO",
        )
        .unwrap();

        let config = RunConfig {
            reports_dir: Some(dir.path().to_path_buf()),
            report_files: BTreeMap::from([(documents::ASSESSMENT_REPORT.to_string(), "apuracao.txt".to_string())]),
            ..Default::default()
        };

        let report = run(&ledger, &book, config).unwrap();

        let recolher = report.section("icms_recolher").unwrap();
        assert_eq!(recolher.status, FieldStatus::Ok, "{:?}", recolher.records);
        assert_eq!(recolher.records[0].value_a, "550,00");

        let saldo = report.section("saldo_credor").unwrap();
        assert_eq!(saldo.status, FieldStatus::Ok, "{:?}", saldo.records);
        assert_eq!(saldo.records[0].field, "VL_SLD_CREDOR_TRANSP");
    }

    #[test]
    fn test_unreadable_book_degrades_to_diagnostics() {
        let dir = TempDir::new().unwrap();
        let (ledger, _) = write_inputs(&dir, "");

        let report = run(&ledger, &dir.path().join("nao_existe.txt"), RunConfig::default()).unwrap();

        assert!(report.diagnostics.iter().any(|d| d.kind == DiagnosticKind::Io));
        assert_eq!(report.section("e110").unwrap().status, FieldStatus::Divergent);
        assert_eq!(report.missing_codes.len(), 2);
    }

    #[test]
    fn test_both_inputs_unreadable_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = run(
            &dir.path().join("sped.txt"),
            &dir.path().join("livro.txt"),
            RunConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ledger_sum_source() {
        let ctx = RunContext {
            tables: crate::ledger::parse_records(LEDGER, &SchemaRegistry::sped_fiscal()),
            documents: BTreeMap::new(),
            extractions: BTreeMap::new(),
            provided: BTreeSet::new(),
        };

        let sums = ctx.resolve(&ValueSource::ledger("E116", LedgerAggregate::Sum));
        assert_eq!(sums["VL_OR"], Decimal::new(55000, 2));

        let first = ctx.resolve(&ValueSource::ledger("E116", LedgerAggregate::First));
        assert_eq!(first["VL_OR"], Decimal::new(30000, 2));

        let captured = ctx.resolve(&ValueSource::captured_sum("nada"));
        assert_eq!(captured[CAPTURED_TOTAL], Decimal::ZERO);
    }
}
