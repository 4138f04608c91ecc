//! paperhound-common: Shared error type, configuration and the allowlisted
//! HTTP client used by every paperhound crate.

pub mod config;
pub mod error;
pub mod sandbox;

pub use config::PipelineConfig;
pub use error::{PaperhoundError, Result};
pub use sandbox::SandboxClient;
