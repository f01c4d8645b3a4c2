use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fiscal_reconciliation::{
    extract_bloc, Anchor, ComparisonReport, LayoutTable, MatchMode, ReconciliationPipeline, RenderedDocument,
    RunConfig,
};
use fiscal_reconciliation::extractor::first_matching_page;
use fiscal_reconciliation::ledger::{BLOC_E_START, BLOC_E_STOP};

#[derive(Parser)]
#[command(name = "fiscal-reconciliation", version, about = "SPED Fiscal x Livro de Apuração reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare a SPED ledger with its rendered Livro (and PVA reports)
    Reconcile {
        #[arg(long)]
        ledger: PathBuf,

        #[arg(long)]
        book: PathBuf,

        /// Directory with the PVA-exported reports
        #[arg(long)]
        reports_dir: Option<PathBuf>,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        layout: Option<PathBuf>,

        #[arg(long)]
        plan: Option<PathBuf>,

        /// Absolute tolerance, e.g. 0.01
        #[arg(long)]
        tolerance: Option<Decimal>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Write the report here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Print the first page of a document containing every anchor
    Inspect {
        #[arg(long)]
        book: PathBuf,

        #[arg(long = "anchor", required = true)]
        anchors: Vec<String>,
    },

    /// Print the raw Bloc E lines of a ledger
    Bloc {
        #[arg(long)]
        ledger: PathBuf,

        #[arg(long, default_value = BLOC_E_START)]
        start: String,

        #[arg(long, default_value = BLOC_E_STOP)]
        stop: String,
    },

    /// Dump the built-in layout table as JSON
    Layout,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
    Text,
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Reconcile {
            ledger,
            book,
            reports_dir,
            config,
            layout,
            plan,
            tolerance,
            format,
            output,
        } => {
            let mut run_config = RunConfig::load(config.as_deref())?;
            if let Some(dir) = reports_dir {
                run_config.reports_dir = Some(dir);
            }
            if let Some(path) = layout {
                run_config.layout_path = Some(path);
            }
            if let Some(path) = plan {
                run_config.plan_path = Some(path);
            }
            if let Some(t) = tolerance {
                run_config.tolerance = t;
            }

            let pipeline = ReconciliationPipeline::new(run_config)?;
            let report = pipeline.run(&ledger, &book)?;
            write_report(&report, format, output)?;

            if !report.is_consistent() {
                std::process::exit(2);
            }
        }

        Command::Inspect { book, anchors } => run_inspect(book, &anchors)?,

        Command::Bloc { ledger, start, stop } => {
            let lines = extract_bloc(&ledger, &start, &stop)?;
            info!("{} lines between {} and {}", lines.len(), start, stop);
            for line in lines {
                println!("{}", line);
            }
        }

        Command::Layout => {
            let json = serde_json::to_string_pretty(&LayoutTable::builtin())?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn write_report(report: &ComparisonReport, format: OutputFormat, output: Option<PathBuf>) -> Result<()> {
    let mut sink: Box<dyn Write> = match &output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create report file: {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    match format {
        OutputFormat::Json => writeln!(sink, "{}", report.to_json()?)?,
        OutputFormat::Csv => report.write_csv(&mut sink)?,
        OutputFormat::Text => write!(sink, "{}", report.to_text())?,
    }

    if let Some(path) = output {
        eprintln!("✅ Report written to {}", path.display());
    }
    Ok(())
}

/// Detective mode: show where the anchors land so a layout can be tuned
fn run_inspect(book: PathBuf, anchors: &[String]) -> Result<()> {
    let doc = RenderedDocument::load("livro", &book)?;
    let anchors: Vec<Anchor> = anchors
        .iter()
        .map(|a| Anchor::new(a, MatchMode::Contains))
        .collect();

    match first_matching_page(&doc, &anchors) {
        Some((page, lines)) => {
            println!("🔎 Page {} of {}", page + 1, doc.page_count());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            for (idx, line) in lines.iter().enumerate() {
                println!("{:>4} | {}", idx, line);
            }
        }
        None => {
            eprintln!("❌ No page of {} contains all anchors", book.display());
            std::process::exit(1);
        }
    }

    Ok(())
}
