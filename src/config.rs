// ⚙️ Run Configuration
// Everything a run needs besides the two input files, threaded explicitly
// through the pipeline. Loaded from JSON, then overridden by CLI flags.

use crate::layout::{documents, LayoutTable};
use crate::ledger::{BLOC_E_START, BLOC_E_STOP};
use crate::plan::ComparisonPlan;
use crate::reconciliation::{ReconciliationEngine, DEFAULT_TOLERANCE};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Absolute tolerance, as a decimal string ("0.01")
    pub tolerance: Decimal,

    /// Layout table JSON; built-in table when unset
    pub layout_path: Option<PathBuf>,

    /// Comparison plan JSON; built-in plan when unset
    pub plan_path: Option<PathBuf>,

    /// Directory holding the PVA-generated reports
    pub reports_dir: Option<PathBuf>,

    /// Document role -> file name inside `reports_dir`
    pub report_files: BTreeMap<String, String>,

    pub bloc_start: String,
    pub bloc_stop: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            tolerance: DEFAULT_TOLERANCE,
            layout_path: None,
            plan_path: None,
            reports_dir: None,
            report_files: default_report_files(),
            bloc_start: BLOC_E_START.to_string(),
            bloc_stop: BLOC_E_STOP.to_string(),
        }
    }
}

/// File names the PVA uses when exporting its reports
pub fn default_report_files() -> BTreeMap<String, String> {
    BTreeMap::from([
        (documents::ENTRIES_REPORT.to_string(), "relatorio_das_entradas.pdf".to_string()),
        (documents::EXITS_REPORT.to_string(), "relatorio_das_saidas.pdf".to_string()),
        (documents::ASSESSMENT_REPORT.to_string(), "apuracao_do_icms.pdf".to_string()),
    ])
}

impl RunConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: RunConfig = serde_json::from_str(&content).context("Failed to parse config JSON")?;
        info!("Loaded run config from {:?}", path.as_ref());
        Ok(config)
    }

    /// Config file when given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::with_tolerance(self.tolerance)
    }

    pub fn layout(&self) -> Result<LayoutTable> {
        match &self.layout_path {
            Some(path) => LayoutTable::from_file(path),
            None => Ok(LayoutTable::builtin()),
        }
    }

    pub fn plan(&self) -> Result<ComparisonPlan> {
        match &self.plan_path {
            Some(path) => ComparisonPlan::from_file(path),
            None => Ok(ComparisonPlan::builtin()),
        }
    }

    /// Where a report with this role would live, when a reports dir is set
    pub fn report_path(&self, role: &str) -> Option<PathBuf> {
        let dir = self.reports_dir.as_ref()?;
        let file = self.report_files.get(role)?;
        Some(dir.join(file))
    }
}
