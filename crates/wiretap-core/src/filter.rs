//! CONNECT target filtering.
//!
//! Decides which hosts get their TLS terminated for inspection. Hosts that
//! don't match are tunneled opaquely and never reach the pipeline.

use regex::Regex;

use crate::error::{ConfigError, Result};

/// Pattern that intercepts every host.
pub const MATCH_ALL: &str = ".*";

/// Compiled host-match rule.
///
/// Built once at startup and shared read-only by every connection.
#[derive(Debug, Clone)]
pub struct HostFilter {
    regex: Regex,
}

impl HostFilter {
    /// Compiles `pattern` into a filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use wiretap_core::HostFilter;
    ///
    /// let filter = HostFilter::new(r"^internal\.").unwrap();
    /// assert!(filter.should_intercept("internal.example.com:443"));
    /// assert!(!filter.should_intercept("example.com:443"));
    /// assert!(HostFilter::new("(").is_err());
    /// ```
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidHostPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex })
    }

    /// Filter that intercepts everything.
    pub fn match_all() -> Self {
        Self {
            regex: Regex::new(MATCH_ALL).expect("match-all pattern is valid"),
        }
    }

    /// Returns whether the CONNECT target `host` (usually `host:port`)
    /// should be decrypted.
    #[inline]
    pub fn should_intercept(&self, host: &str) -> bool {
        self.regex.is_match(host)
    }

    /// Returns the source pattern.
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

impl Default for HostFilter {
    fn default() -> Self {
        Self::match_all()
    }
}
