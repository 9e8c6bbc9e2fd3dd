#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use assay_core::{AnalysisConfig, Classifier};
use assay_ir::Program;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, WrapErr};

mod config;
mod golden;
mod logging;
mod report;

use config::OutputFormat;
use logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "assay", version, about = "Classify assert statements by what they contribute")]
struct Cli {
    /// Log verbosity on stderr. `ASSAY_LOG` filter directives take precedence.
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Config file. Defaults to the nearest `assay.toml` above the program.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

/// Overrides for `[analysis]` in `assay.toml`.
#[derive(clap::Args, Debug, Default)]
struct AnalysisArgs {
    #[arg(long)]
    unroll_depth: Option<usize>,

    #[arg(long)]
    inline_depth: Option<usize>,

    #[arg(long)]
    branch_budget: Option<usize>,

    /// Run on the current thread only.
    #[arg(long, default_value_t = false)]
    sequential: bool,
}

impl AnalysisArgs {
    fn apply(&self, mut cfg: AnalysisConfig) -> AnalysisConfig {
        if let Some(v) = self.unroll_depth {
            cfg.unroll_depth = v;
        }
        if let Some(v) = self.inline_depth {
            cfg.inline_depth = v;
        }
        if let Some(v) = self.branch_budget {
            cfg.branch_budget = v;
        }
        if self.sequential {
            cfg.parallel = false;
        }
        cfg
    }
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Label every assert in a JSON program
    Classify {
        /// Program in JSON form
        program: PathBuf,

        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        #[command(flatten)]
        analysis: AnalysisArgs,
    },

    /// Compare labels against a golden TOML table
    Score {
        program: PathBuf,

        #[arg(long)]
        golden: PathBuf,

        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        #[command(flatten)]
        analysis: AnalysisArgs,
    },

    /// List operations that may fail, with the assert that would guard them
    Suggest {
        program: PathBuf,

        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        #[command(flatten)]
        analysis: AnalysisArgs,
    },
}

impl Cmd {
    fn name(&self) -> &'static str {
        match self {
            Cmd::Classify { .. } => "classify",
            Cmd::Score { .. } => "score",
            Cmd::Suggest { .. } => "suggest",
        }
    }

    fn program(&self) -> &Path {
        match self {
            Cmd::Classify { program, .. }
            | Cmd::Score { program, .. }
            | Cmd::Suggest { program, .. } => program,
        }
    }
}

fn load_program(path: &Path) -> miette::Result<Program> {
    let raw = fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to parse {}", path.display()))
}

fn emit(text: &str) {
    print!("{text}");
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level);

    let started = Instant::now();
    let command = cli.cmd.name();
    let resolved = config::load_config(cli.config.as_deref(), cli.cmd.program())?;
    tracing::info!(
        target: "pipeline",
        stage = "cli.run.start",
        command,
        config = ?resolved.config_path,
        input = %cli.cmd.program().display(),
    );

    match &cli.cmd {
        Cmd::Classify {
            program,
            format,
            analysis,
        } => {
            let classifier = Classifier::new(analysis.apply(resolved.analysis.clone()));
            let result = classifier.classify(&load_program(program)?)?;
            match format.unwrap_or(resolved.format) {
                OutputFormat::Json => {
                    let json = report::classify_json(&program.display().to_string(), &result)
                        .into_diagnostic()?;
                    println!("{json}");
                }
                OutputFormat::Text => emit(&report::classify_text(&result)),
            }
        }
        Cmd::Score {
            program,
            golden: table_path,
            format,
            analysis,
        } => {
            let raw = fs::read_to_string(table_path)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to read {}", table_path.display()))?;
            let table = golden::GoldenTable::parse(&raw)?;
            let classifier = Classifier::new(analysis.apply(resolved.analysis.clone()));
            let result = classifier.classify(&load_program(program)?)?;
            let score = golden::score(&result, &table);
            match format.unwrap_or(resolved.format) {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&score).into_diagnostic()?);
                }
                OutputFormat::Text => emit(&report::score_text(&score)),
            }
        }
        Cmd::Suggest {
            program,
            format,
            analysis,
        } => {
            let classifier = Classifier::new(analysis.apply(resolved.analysis.clone()));
            let suggestions = classifier.suggest(&load_program(program)?)?;
            match format.unwrap_or(resolved.format) {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&suggestions).into_diagnostic()?);
                }
                OutputFormat::Text => emit(&report::suggestions_text(&suggestions)),
            }
        }
    }

    tracing::info!(
        target: "pipeline",
        stage = "cli.run.complete",
        command,
        elapsed_ms = started.elapsed().as_millis() as u64,
    );
    Ok(())
}
