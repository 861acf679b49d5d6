pub mod aggregation;
pub mod health;
pub mod loader;
pub mod session;
pub mod sink;
