//! # Runtime Error Types

use std::path::PathBuf;

use shardsync_net::TransportError;
use shardsync_sync::SyncError;
use thiserror::Error;

/// Errors raised while loading a [`crate::ShardConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML did not parse or had the wrong shape.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but cannot be used.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Errors raised by the shard runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Transport engine failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A sync queue flush aborted.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
