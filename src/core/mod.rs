pub mod coverage;
pub mod export;
pub mod pipeline;
pub mod quota;
pub mod rate_gate;
pub mod retry;
pub mod search;
pub mod subdivision;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::domain::model::{Cell, CellId, CellResult, PipelineReport};
pub use crate::domain::ports::{GridIndex, SearchApi, Storage};
pub use crate::utils::error::Result;
