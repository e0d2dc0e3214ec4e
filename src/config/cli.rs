use crate::utils::error::{HarvestError, Result};
use crate::utils::validation::{validate_cell_ids, Validate};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "hexsweep")]
#[command(about = "Harvest points of interest by sweeping H3 cells with a radius-search API")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "hexsweep.toml")]
    pub config: String,

    /// Top-level H3 cell ids, comma separated
    #[arg(long, value_delimiter = ',')]
    pub cells: Vec<String>,

    /// File with one cell id per line (`#` starts a comment)
    #[arg(long)]
    pub cells_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Override monitoring setting from config
    #[arg(long)]
    pub monitor: Option<bool>,

    /// Dry run - print the quota estimate without calling the API
    #[arg(long)]
    pub dry_run: bool,

    /// After the run, retry failed cells up to N attempts each
    #[arg(long, value_name = "N")]
    pub retry_failed: Option<u32>,
}

impl CliArgs {
    /// 合併 `--cells` 與 `--cells-file` 的內容，保留第一次出現的順序
    pub fn collect_cells(&self) -> Result<Vec<String>> {
        let mut cells: Vec<String> = self
            .cells
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        if let Some(path) = &self.cells_file {
            let content = std::fs::read_to_string(path).map_err(|e| {
                HarvestError::InvalidConfigValueError {
                    field: "cells_file".to_string(),
                    value: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            cells.extend(parse_cell_list(&content));
        }

        let mut seen = std::collections::HashSet::new();
        cells.retain(|c| seen.insert(c.clone()));
        Ok(cells)
    }
}

/// 每行一個格子 id；空行與 `#` 之後的內容忽略
pub fn parse_cell_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl Validate for CliArgs {
    fn validate(&self) -> Result<()> {
        if let Some(attempts) = self.retry_failed {
            crate::utils::validation::validate_range("retry_failed", attempts, 1, 10)?;
        }
        let cells = self.collect_cells()?;
        validate_cell_ids("cells", &cells)
    }
}
