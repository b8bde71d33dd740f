pub mod agent;
pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod lease;
pub mod log;
pub mod metrics;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transition;
pub mod types;
