pub mod artifact;
pub mod auth;
pub mod config;
pub mod driver;
pub mod error;
pub mod orchestrator;
pub mod poll;
pub mod report;
pub mod shutdown;

pub use error::{BenchError, Result};
