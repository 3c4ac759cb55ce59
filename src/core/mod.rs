//! Core business logic module
//!
//! This module contains the domain models, the history store, the process
//! runner and the queue manager with its runtime router.

pub mod config;
pub mod manager;
pub mod models;
pub mod prober;
pub mod runner;
pub mod runtime;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod config_test;


// Re-export commonly used types
pub use config::AppConfig;
pub use manager::{DownloadEvent, QueueManager};
pub use runtime::DownloadRuntimeHandle;
