use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtspmError {
    /// Timestamps (or other typed columns) that could not be coerced.
    #[error("{source_name}: {rows} row(s) have unparseable timestamps (first: {sample:?})")]
    DataFormat {
        source_name: String,
        sample: String,
        rows: u64,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("detector_health grouping by {levels:?} requested but no device group table was loaded")]
    MissingGroupTable { levels: Vec<String> },
    #[error("processor is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("aggregation {step} failed: {reason}")]
    StepFailed { step: String, reason: String },
    #[error("aggregation {step} skipped: dependency {dependency} did not produce output")]
    DependencyFailed { step: String, dependency: String },
    #[error("duckdb: {0}")]
    Engine(#[from] duckdb::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl AtspmError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn step(step: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StepFailed {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    /// Configuration and format problems are the caller's to fix; everything else is runtime.
    pub fn is_fatal_input(&self) -> bool {
        matches!(
            self,
            Self::DataFormat { .. } | Self::Config(_) | Self::MissingGroupTable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AtspmError>;
