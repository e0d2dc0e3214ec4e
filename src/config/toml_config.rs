use crate::core::export::OutputFormat;
use crate::core::pipeline::PipelineSettings;
use crate::core::quota::QuotaLimits;
use crate::core::retry::RetryPolicy;
use crate::utils::error::{HarvestError, Result};
use crate::utils::validation::{
    validate_path, validate_positive_number, validate_range, validate_url, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// API 可接受的最大 offset (不含)
    #[serde(default = "default_max_offset")]
    pub max_offset: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// 每次搜尋都附帶的查詢參數，例如 categories
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default = "default_per_second_limit")]
    pub per_second_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_dense_threshold")]
    pub dense_threshold: usize,
    #[serde(default = "default_max_resolution")]
    pub max_resolution: u8,
    #[serde(default = "default_true")]
    pub recursive_split: bool,
    #[serde(default = "default_avg_probes")]
    pub avg_probes_per_cell: f64,
    #[serde(default = "default_avg_pages")]
    pub avg_pages_per_probe: f64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub output_path: String,
    #[serde(default = "default_output_formats")]
    pub output_formats: Vec<OutputFormat>,
    #[serde(default = "default_true")]
    pub compress: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_page_size() -> u32 {
    50
}
fn default_max_offset() -> u32 {
    1000
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_daily_limit() -> u64 {
    QuotaLimits::default().daily_limit
}
fn default_per_second_limit() -> u32 {
    QuotaLimits::default().per_second_limit
}
fn default_concurrency() -> usize {
    PipelineSettings::default().concurrency
}
fn default_dense_threshold() -> usize {
    PipelineSettings::default().dense_threshold
}
fn default_max_resolution() -> u8 {
    PipelineSettings::default().max_resolution
}
fn default_avg_probes() -> f64 {
    PipelineSettings::default().avg_probes_per_cell
}
fn default_avg_pages() -> f64 {
    PipelineSettings::default().avg_pages_per_probe
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_output_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Json, OutputFormat::Csv]
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            per_second_limit: default_per_second_limit(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            dense_threshold: default_dense_threshold(),
            max_resolution: default_max_resolution(),
            recursive_split: true,
            avg_probes_per_cell: default_avg_probes(),
            avg_pages_per_probe: default_avg_pages(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
    })
}

impl HarvestConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(HarvestError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| HarvestError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換 `${VAR_NAME}`；未設定的變數保留原樣，交給驗證階段回報
    fn substitute_env_vars(content: &str) -> String {
        env_pattern()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .into_owned()
    }

    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            daily_limit: self.quota.daily_limit,
            per_second_limit: self.quota.per_second_limit,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            concurrency: p.concurrency,
            dense_threshold: p.dense_threshold,
            max_resolution: p.max_resolution,
            recursive_split: p.recursive_split,
            avg_probes_per_cell: p.avg_probes_per_cell,
            avg_pages_per_probe: p.avg_pages_per_probe,
            retry: RetryPolicy::new(
                p.retry_attempts,
                Duration::from_millis(p.retry_base_delay_ms),
            ),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_seconds)
    }

    pub fn output_path(&self) -> &str {
        &self.output.output_path
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.enabled
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validate_url("api.endpoint", &self.api.endpoint)?;
        if let Some(key) = &self.api.api_key {
            if env_pattern().is_match(key) {
                return Err(HarvestError::MissingConfigError {
                    field: format!("api.api_key (environment variable in {})", key),
                });
            }
        }
        validate_range("api.page_size", self.api.page_size, 1, 1000)?;
        if self.api.max_offset < self.api.page_size {
            return Err(HarvestError::InvalidConfigValueError {
                field: "api.max_offset".to_string(),
                value: self.api.max_offset.to_string(),
                reason: format!("must be at least api.page_size ({})", self.api.page_size),
            });
        }
        validate_positive_number("api.timeout_seconds", self.api.timeout_seconds, 1)?;

        validate_positive_number("quota.daily_limit", self.quota.daily_limit, 1)?;
        validate_positive_number(
            "quota.per_second_limit",
            u64::from(self.quota.per_second_limit),
            1,
        )?;

        validate_range("pipeline.concurrency", self.pipeline.concurrency, 1, 64)?;
        validate_positive_number(
            "pipeline.dense_threshold",
            self.pipeline.dense_threshold as u64,
            1,
        )?;
        validate_range("pipeline.max_resolution", self.pipeline.max_resolution, 0, 15)?;
        validate_range(
            "pipeline.avg_probes_per_cell",
            self.pipeline.avg_probes_per_cell,
            0.1,
            100.0,
        )?;
        validate_range(
            "pipeline.avg_pages_per_probe",
            self.pipeline.avg_pages_per_probe,
            0.1,
            100.0,
        )?;
        validate_range("pipeline.retry_attempts", self.pipeline.retry_attempts, 1, 10)?;

        validate_path("output.output_path", &self.output.output_path)?;
        if self.output.output_formats.is_empty() {
            return Err(HarvestError::InvalidConfigValueError {
                field: "output.output_formats".to_string(),
                value: "[]".to_string(),
                reason: "At least one format is required. Valid formats: json, csv".to_string(),
            });
        }

        Ok(())
    }
}

impl Validate for HarvestConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
