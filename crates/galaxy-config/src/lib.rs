//! Desired-state view of applications, decoded from convergent versioned maps.

pub mod app;
pub mod error;
pub mod snapshot;

pub use app::{AppConfig, ServiceConfig};
pub use error::ConfigError;
pub use snapshot::ConfigSnapshot;
