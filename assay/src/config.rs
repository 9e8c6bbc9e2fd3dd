#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assay_core::AnalysisConfig;
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE: &str = "assay.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error: {message}")]
#[diagnostic(code(assay::config))]
pub struct ConfigError {
    pub message: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Output {
    pub format: OutputFormat,
}

/// Contents of `assay.toml`. Every table is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub analysis: AnalysisConfig,
    pub output: Output,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub analysis: AnalysisConfig,
    pub format: OutputFormat,
}

/// Nearest `assay.toml` in the directory of `start` or any ancestor.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut cur = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };
    loop {
        let candidate = cur.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        cur = cur.parent()?.to_path_buf();
    }
}

pub fn parse_config(raw: &str, origin: &Path) -> Result<FileConfig, ConfigError> {
    toml::from_str(raw).map_err(|e| ConfigError {
        message: format!("failed to parse {}: {e}", origin.display()),
    })
}

/// Explicit `--config` first, else the nearest `assay.toml` above `program`, else defaults.
pub fn load_config(explicit: Option<&Path>, program: &Path) -> Result<ResolvedConfig, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => find_config(&absolute(program)),
    };
    let Some(path) = path else {
        return Ok(ResolvedConfig::default());
    };
    let raw = fs::read_to_string(&path).map_err(|e| ConfigError {
        message: format!("failed to read {}: {e}", path.display()),
    })?;
    let parsed = parse_config(&raw, &path)?;
    tracing::debug!(target: "config", path = %path.display(), "loaded");
    Ok(ResolvedConfig {
        config_path: Some(path),
        analysis: parsed.analysis,
        format: parsed.output.format,
    })
}

fn absolute(p: &Path) -> PathBuf {
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(p),
        Err(_) => p.to_path_buf(),
    }
}
