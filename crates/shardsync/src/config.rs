//! # Shard Configuration
//!
//! One TOML document, every key optional:
//!
//! ```toml
//! tick_rate = 20
//! listen = "0.0.0.0:2593"
//! compression = true
//!
//! [transport]
//! sender_threads = 4
//! buffer_len = 16384
//! max_frame_len = 262144
//!
//! [sync]
//! max_update_range = 18
//! properties = true
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use shardsync_net::TransportConfig;
use shardsync_sync::SyncConfig;

use crate::error::ConfigError;

/// Default ticks per second.
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:2593";

/// Complete shard configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Game ticks per second.
    pub tick_rate: u32,
    /// Address the server role binds.
    pub listen: SocketAddr,
    /// Compress outgoing groups with LZ4.
    pub compression: bool,
    /// Transport engine settings.
    pub transport: TransportConfig,
    /// Sync queue settings.
    pub sync: SyncConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            listen: SocketAddr::from(([0, 0, 0, 0], 2593)),
            compression: true,
            transport: TransportConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ShardConfig {
    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`ShardConfig::from_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = text.parse()?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Rejects values the runtime cannot start with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return invalid("tick_rate", "must be between 1 and 1000");
        }
        if self.transport.sender_threads == 0 {
            return invalid("transport.sender_threads", "must be at least 1");
        }
        if self.transport.io_threads == 0 {
            return invalid("transport.io_threads", "must be at least 1");
        }
        if self.transport.buffer_len < 64 {
            return invalid("transport.buffer_len", "must be at least 64 bytes");
        }
        if self.transport.max_frame_len < self.transport.buffer_len {
            return invalid("transport.max_frame_len", "must be at least transport.buffer_len");
        }
        if self.sync.max_update_range == 0 {
            return invalid("sync.max_update_range", "must be at least 1");
        }
        Ok(())
    }
}

impl FromStr for ShardConfig {
    type Err = ConfigError;

    /// Parses and validates a TOML document.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config: ShardConfig = "".parse().unwrap();
        assert_eq!(config, ShardConfig::default());
        assert_eq!(config.listen, DEFAULT_LISTEN.parse().unwrap());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: ShardConfig = r#"
            tick_rate = 10
            listen = "127.0.0.1:7775"

            [transport]
            sender_threads = 4

            [sync]
            properties = false
        "#
        .parse()
        .unwrap();

        assert_eq!(config.tick_rate, 10);
        assert_eq!(config.listen.port(), 7775);
        assert_eq!(config.transport.sender_threads, 4);
        assert_eq!(config.transport.io_threads, TransportConfig::default().io_threads);
        assert!(!config.sync.properties);
        assert_eq!(config.sync.max_update_range, SyncConfig::default().max_update_range);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = "tick_rate = 0".parse::<ShardConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "tick_rate", .. }));

        let err = "[transport]\nsender_threads = 0".parse::<ShardConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "transport.sender_threads", .. }));

        let err = "[transport]\nbuffer_len = 4096\nmax_frame_len = 1024".parse::<ShardConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "transport.max_frame_len", .. }));

        let err = "tick_rate = \"fast\"".parse::<ShardConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ShardConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
