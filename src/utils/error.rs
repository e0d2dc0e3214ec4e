use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Coverage generation failed for cell {cell_id}: {reason}")]
    CoverageGeneration { cell_id: String, reason: String },

    #[error(
        "Quota exceeded: {message} (estimated calls: {estimated_calls}, daily remaining: {daily_remaining})"
    )]
    QuotaExceeded {
        estimated_calls: u64,
        daily_remaining: u64,
        message: String,
    },

    #[error("Transient API failure (status: {status:?}): {message}")]
    TransientApi {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Boundary validation unavailable for item {item_id}: {reason}")]
    BoundaryValidation { item_id: String, reason: String },

    #[error("Invalid split for cell {cell_id} ({current} -> {target}): {reason}")]
    SplitConfiguration {
        cell_id: String,
        current: u8,
        target: u8,
        reason: String,
    },

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Grid lookup failed: {message}")]
    Grid { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error in {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Quota,
    Coverage,
    Data,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl HarvestError {
    pub fn grid(message: impl Into<String>) -> Self {
        HarvestError::Grid {
            message: message.into(),
        }
    }

    /// 是否值得在本地以退避重試 (429、5xx、逾時、連線失敗)
    pub fn is_retryable(&self) -> bool {
        match self {
            HarvestError::TransientApi { .. } => true,
            HarvestError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// 伺服器要求的等待時間 (Retry-After)
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HarvestError::TransientApi { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HarvestError::ConfigValidationError { .. }
            | HarvestError::InvalidConfigValueError { .. }
            | HarvestError::MissingConfigError { .. }
            | HarvestError::SplitConfiguration { .. } => ErrorCategory::Configuration,
            HarvestError::TransientApi { .. } | HarvestError::Api { .. } | HarvestError::Http(_) => {
                ErrorCategory::Network
            }
            HarvestError::QuotaExceeded { .. } => ErrorCategory::Quota,
            HarvestError::CoverageGeneration { .. }
            | HarvestError::BoundaryValidation { .. }
            | HarvestError::Grid { .. } => ErrorCategory::Coverage,
            HarvestError::CsvError(_)
            | HarvestError::SerializationError(_)
            | HarvestError::ProcessingError { .. } => ErrorCategory::Data,
            HarvestError::Cancelled | HarvestError::ZipError(_) | HarvestError::IoError(_) => {
                ErrorCategory::System
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HarvestError::BoundaryValidation { .. } | HarvestError::Cancelled => ErrorSeverity::Low,
            HarvestError::TransientApi { .. } | HarvestError::Http(_) => ErrorSeverity::Medium,
            HarvestError::CoverageGeneration { .. }
            | HarvestError::SplitConfiguration { .. }
            | HarvestError::Api { .. }
            | HarvestError::Grid { .. }
            | HarvestError::CsvError(_)
            | HarvestError::SerializationError(_)
            | HarvestError::ProcessingError { .. } => ErrorSeverity::High,
            HarvestError::QuotaExceeded { .. }
            | HarvestError::ConfigValidationError { .. }
            | HarvestError::InvalidConfigValueError { .. }
            | HarvestError::MissingConfigError { .. }
            | HarvestError::ZipError(_)
            | HarvestError::IoError(_) => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            HarvestError::QuotaExceeded {
                estimated_calls,
                daily_remaining,
                ..
            } => format!(
                "Wait for the daily quota reset or reduce the batch ({} calls needed, {} remaining)",
                estimated_calls, daily_remaining
            ),
            HarvestError::TransientApi { .. } | HarvestError::Http(_) => {
                "Retry later, or run again with --retry-failed".to_string()
            }
            HarvestError::Api { status, .. } if *status == 401 || *status == 403 => {
                "Check api.api_key in the configuration".to_string()
            }
            HarvestError::Api { .. } => "Check api.endpoint and api.parameters".to_string(),
            HarvestError::CoverageGeneration { .. } | HarvestError::Grid { .. } => {
                "Check that the input cell ids are valid H3 indexes".to_string()
            }
            HarvestError::SplitConfiguration { .. } => {
                "Lower pipeline.max_resolution jumps or disable recursive_split".to_string()
            }
            HarvestError::ConfigValidationError { .. }
            | HarvestError::InvalidConfigValueError { .. }
            | HarvestError::MissingConfigError { .. } => {
                "Fix the configuration file and try again".to_string()
            }
            HarvestError::IoError(_) | HarvestError::ZipError(_) => {
                "Check that output.output_path is writable".to_string()
            }
            _ => "See the log output for details".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Network => format!("Search API problem: {}", self),
            ErrorCategory::Quota => format!("API quota problem: {}", self),
            ErrorCategory::Coverage => format!("Grid coverage problem: {}", self),
            ErrorCategory::Data => format!("Data problem: {}", self),
            ErrorCategory::System => format!("System problem: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = HarvestError::TransientApi {
            status: Some(429),
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_quota_errors_are_not_retryable() {
        let err = HarvestError::QuotaExceeded {
            estimated_calls: 10,
            daily_remaining: 5,
            message: "daily limit reached".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(err.recovery_suggestion().contains("10 calls needed"));
    }
}
