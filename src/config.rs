//! Session configuration.

use crate::buffer::DEFAULT_INCREMENT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of a [`crate::Session`].
///
/// Deserializable so an embedding application can keep it in its own
/// config file; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Initial size and growth step of the scratch buffer, in bytes.
    pub buffer_increment: usize,
    /// How long a process lookup is reused for the same pid.
    pub process_snapshot_ttl: Duration,
    /// Initial capacity of a row cache when the system cannot report how
    /// many interfaces it has.
    pub default_cache_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_increment: DEFAULT_INCREMENT,
            process_snapshot_ttl: Duration::from_secs(2),
            default_cache_capacity: 10,
        }
    }
}

impl SessionConfig {
    pub fn with_buffer_increment(mut self, bytes: usize) -> Self {
        self.buffer_increment = bytes;
        self
    }

    pub fn with_process_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.process_snapshot_ttl = ttl;
        self
    }

    pub fn with_default_cache_capacity(mut self, capacity: usize) -> Self {
        self.default_cache_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.buffer_increment, 8192);
        assert_eq!(config.process_snapshot_ttl, Duration::from_secs(2));
        assert_eq!(config.default_cache_capacity, 10);
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_buffer_increment(512)
            .with_process_snapshot_ttl(Duration::ZERO)
            .with_default_cache_capacity(3);
        assert_eq!(config.buffer_increment, 512);
        assert_eq!(config.process_snapshot_ttl, Duration::ZERO);
        assert_eq!(config.default_cache_capacity, 3);
    }
}
