pub mod arrivals;
pub mod counts;
pub mod cycles;
pub mod mapper;
pub mod occupancy;
pub mod runner;
pub mod stages;
pub mod timeline;
pub mod types;

pub use runner::{ProcessorState, RunReport, SignalDataProcessor, StepReport, StepStatus};
