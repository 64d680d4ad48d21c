//! Disaster-recovery backup pipeline.
//!
//! Produces encrypted, checksummed artifacts of tenant databases, the shared
//! filestore and configuration files into a per-run session directory, ships
//! them to destination sinks, validates them and retires old sessions.

pub mod config;
pub mod crypto;
pub mod fs;
pub mod notify;
pub mod orchestrator;
pub mod producers;
pub mod retention;
pub mod session;
pub mod shutdown;
pub mod sinks;
pub mod tools;
pub mod utils;
pub mod validator;

// Re-export commonly used types
pub use config::DrConfig;
pub use utils::errors::{DrError, Result};
