//! service-core: Shared infrastructure for micros microservices.
pub mod config;
pub mod error;
pub mod observability;
pub mod rate_limit;

pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
