//! Uplink Core - Shared types, configuration and policy for the upload gateway
//!
//! This crate holds everything that decides *what* the gateway may do:
//! path containment, storage key derivation, the command set, the error
//! taxonomy and configuration. It has no dependencies on networking or AWS.

pub mod config;
pub mod error;
pub mod key;
pub mod path;
pub mod types;

pub use config::{
    AuthConfig, ConfigError, GatewayConfig, LogConfig, LogFormat, ServerConfig, StorageConfig,
    UploadConfig,
};
pub use error::*;
pub use key::{StorageKey, PLACEHOLDER_FILENAME};
pub use path::PathGuard;
pub use types::*;

/// Maximum virtual path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// SSH identification string sent to clients
pub const SERVER_ID: &str = "SSH-2.0-UPLINK";

/// Authentication attempts allowed per connection
pub const MAX_AUTH_ATTEMPTS: usize = 3;
