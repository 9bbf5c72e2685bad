//! Bissy Common Library
//!
//! Shared code for the Bissy query result cache including:
//! - Domain models and the lifetime duration type
//! - Tenant-scoped stores (in-memory and SeaORM)
//! - Query executors and CSV serialization
//! - Result cache backends and the cached execution service
//! - Error types and handling
//! - Configuration management
//! - Authentication utilities
//! - Metrics and observability

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod duration;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod results;
pub mod store;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::Repository;
pub use duration::Lifetime;
pub use errors::{AppError, Result};
pub use results::ResultService;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
