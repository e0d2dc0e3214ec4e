pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::{H3Grid, HttpSearchApi, LocalStorage};
#[cfg(feature = "cli")]
pub use config::CliArgs;
pub use config::HarvestConfig;

pub use core::coverage::{CoveragePlan, CoveragePlanner};
pub use core::export::{OutputFormat, ReportExporter};
pub use core::pipeline::{HarvestedItem, PipelineOrchestrator, PipelineSettings};
pub use core::quota::{QuotaBudget, QuotaLimits};
pub use core::rate_gate::RateGate;
pub use core::retry::{with_retry, RetryPolicy};
pub use core::search::SearchClient;
pub use core::subdivision::SubdivisionManager;
pub use utils::error::{HarvestError, Result};
