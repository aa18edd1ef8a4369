//! Error types for the core components.

use thiserror::Error;

/// Startup configuration error.
///
/// Every variant is fatal: the process logs it and exits.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The host-match pattern is not a valid regular expression.
    #[error("invalid host pattern {pattern:?}: {source}")]
    InvalidHostPattern {
        /// The pattern as given on the command line.
        pattern: String,
        /// The underlying regex compilation error.
        #[source]
        source: regex::Error,
    },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
