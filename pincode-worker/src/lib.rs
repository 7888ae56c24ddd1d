pub mod aggregate;
pub mod config;
pub mod error;
pub mod gate;
pub mod input;
pub mod lookup;
pub mod orchestrator;
pub mod queue;
pub mod worker;
