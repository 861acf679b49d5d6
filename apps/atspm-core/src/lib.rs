pub mod cli;
pub mod config;
pub mod error;
pub mod services;
pub mod time;

#[cfg(test)]
pub mod test_support;

pub use config::{AggregationName, AggregationRequest, ProcessorConfig, RunConfig};
pub use error::{AtspmError, Result};
pub use services::aggregation::{RunReport, SignalDataProcessor, StepStatus};
pub use services::loader::{EventSource, LoadRequest, TableSource};
pub use services::sink::{FileSink, MemorySink, TableSink};
