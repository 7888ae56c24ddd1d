pub mod metrics;
pub mod retry;
pub mod store;
