pub mod anomaly;
pub mod decompose;
pub mod robust;
pub mod rolling;

pub use rolling::undo_rolling_sum;
