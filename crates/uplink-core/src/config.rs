//! Configuration system for uplink
//!
//! Settings come from an optional TOML file, then environment variables on
//! top. The file is looked up in:
//! - macOS: ~/Library/Application Support/uplink/config.toml
//! - Linux: ~/.config/uplink/config.toml
//! - Windows: %APPDATA%/uplink/config.toml
//!
//! unless a path is given explicitly. Everything is validated before the
//! server starts; a required value that is missing is fatal.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::path::clean;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener and connection settings
    pub server: ServerConfig,
    /// Virtual namespace and size limits
    pub upload: UploadConfig,
    /// Object storage destination
    pub storage: StorageConfig,
    /// Identity verification
    pub auth: AuthConfig,
    /// Log output
    pub log: LogConfig,
}

/// Listener and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// SSH listening port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// OpenSSH private key file; an ephemeral key is generated when unset
    pub host_key_path: Option<PathBuf>,
    /// Upper bound on concurrently served connections
    pub max_connections: usize,
    /// Deadline for the handshake, including authentication
    pub connection_timeout_secs: u64,
    /// Idle time allowed between client packets
    pub read_timeout_secs: u64,
    /// How long a single socket write may stay blocked
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 2222,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            host_key_path: None,
            max_connections: 100,
            connection_timeout_secs: 30,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
        }
    }
}

/// Virtual namespace and size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Root of the virtual namespace clients may write into
    pub virtual_dir: String,
    /// Largest file accepted, in bytes
    pub max_file_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            virtual_dir: "/uploads".into(),
            max_file_size: 1024 * 1024, // 1MB
        }
    }
}

/// Object storage destination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Destination bucket (required)
    pub bucket: String,
    /// Optional key prefix ahead of the date partition
    pub bucket_prefix: String,
    /// AWS region; empty means the SDK default chain decides
    pub region: String,
    /// Upper bound on a single object write
    pub handoff_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            bucket_prefix: String::new(),
            region: String::new(),
            handoff_timeout_secs: 300,
        }
    }
}

/// Identity verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Tenant (AWS account) every caller must belong to (required)
    pub required_account_id: String,
    /// Deadline for one identity-service call
    pub verify_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required_account_id: String::new(),
            verify_timeout_secs: 30,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
        }
    }
}

impl ServerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl StorageConfig {
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }

    pub fn prefix(&self) -> Option<&str> {
        Some(self.bucket_prefix.as_str()).filter(|p| !p.is_empty())
    }

    pub fn region(&self) -> Option<&str> {
        Some(self.region.as_str()).filter(|r| !r.is_empty())
    }
}

impl AuthConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

impl GatewayConfig {
    /// Load file, apply the process environment, normalize and validate.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Io(format!("{:?} does not exist", path)));
                }
                Self::load_from(path)?
            }
            None => match Self::default_path() {
                Some(path) => Self::load_from(&path)?,
                None => {
                    debug!("No config directory found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: GatewayConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Overlay environment variables. Empty values count as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = get("SFTP_PORT") {
            self.server.port = parse_env("SFTP_PORT", &v)?;
        }
        if let Some(v) = get("SFTP_BIND") {
            self.server.bind = parse_env("SFTP_BIND", &v)?;
        }
        if let Some(v) = get("SFTP_HOST_KEY") {
            self.server.host_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("VIRTUAL_DIR") {
            self.upload.virtual_dir = v;
        }
        if let Some(v) = get("MAX_FILE_SIZE") {
            self.upload.max_file_size = parse_env("MAX_FILE_SIZE", &v)?;
        }
        if let Some(v) = get("S3_BUCKET") {
            self.storage.bucket = v;
        }
        if let Some(v) = get("S3_BUCKET_PREFIX") {
            self.storage.bucket_prefix = v;
        }
        if let Some(v) = get("AWS_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = get("AWS_ACCOUNT_ID") {
            self.auth.required_account_id = v;
        }
        if let Some(v) = get("CONNECTION_TIMEOUT") {
            self.server.connection_timeout_secs = parse_duration_env("CONNECTION_TIMEOUT", &v)?;
        }
        if let Some(v) = get("READ_TIMEOUT") {
            self.server.read_timeout_secs = parse_duration_env("READ_TIMEOUT", &v)?;
        }
        if let Some(v) = get("WRITE_TIMEOUT") {
            self.server.write_timeout_secs = parse_duration_env("WRITE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_CONNECTIONS") {
            self.server.max_connections = parse_env("MAX_CONNECTIONS", &v)?;
        }

        Ok(())
    }

    /// Clean the virtual root and force it absolute
    pub fn normalize(&mut self) {
        self.upload.virtual_dir = clean(&self.upload.virtual_dir);
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.bucket.is_empty() {
            return Err(ConfigError::Missing("S3_BUCKET"));
        }
        if self.auth.required_account_id.is_empty() {
            return Err(ConfigError::Missing("AWS_ACCOUNT_ID"));
        }
        if self.upload.max_file_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_file_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be greater than zero".into(),
            });
        }

        let timeouts = [
            ("connection_timeout", self.server.connection_timeout_secs),
            ("read_timeout", self.server.read_timeout_secs),
            ("write_timeout", self.server.write_timeout_secs),
            ("handoff_timeout", self.storage.handoff_timeout_secs),
            ("verify_timeout", self.auth.verify_timeout_secs),
        ];
        for (field, secs) in timeouts {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least one second".into(),
                });
            }
        }

        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "uplink", "uplink").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let mut config = Self::default();
        config.storage.bucket = "my-upload-bucket".into();
        config.auth.required_account_id = "123456789012".into();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        reason: e.to_string(),
    })
}

/// Parse a humantime duration that must be a whole number of seconds
fn parse_duration_env(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    let duration = humantime::parse_duration(value).map_err(|e| ConfigError::InvalidEnv {
        var,
        reason: e.to_string(),
    })?;

    if duration.subsec_nanos() != 0 {
        return Err(ConfigError::InvalidEnv {
            var,
            reason: format!("{} is not a whole number of seconds", value),
        });
    }
    Ok(duration.as_secs())
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// A required value is absent
    Missing(&'static str),
    /// An environment variable could not be parsed
    InvalidEnv { var: &'static str, reason: String },
    /// A value is out of range
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Missing(var) => write!(f, "{} environment variable is required", var),
            ConfigError::InvalidEnv { var, reason } => write!(f, "invalid {}: {}", var, reason),
            ConfigError::Invalid { field, reason } => write!(f, "invalid {}: {}", field, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![("S3_BUCKET", "test-bucket"), ("AWS_ACCOUNT_ID", "123456789012")]
    }

    fn build(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let mut config = GatewayConfig::default();
        config.apply_env_from(env(pairs))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_required_fields() {
        let err = build(&[]).unwrap_err();
        assert_eq!(err.to_string(), "S3_BUCKET environment variable is required");

        let err = build(&[("S3_BUCKET", "test-bucket")]).unwrap_err();
        assert_eq!(err.to_string(), "AWS_ACCOUNT_ID environment variable is required");
    }

    #[test]
    fn test_defaults() {
        let config = build(&required()).unwrap();
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.upload.virtual_dir, "/uploads");
        assert_eq!(config.upload.max_file_size, 1024 * 1024);
        assert_eq!(config.storage.bucket, "test-bucket");
        assert_eq!(config.auth.required_account_id, "123456789012");
        assert_eq!(config.server.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.write_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.storage.prefix(), None);
        assert_eq!(config.storage.region(), None);
        assert_eq!(config.storage.handoff_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_custom_values() {
        let mut pairs = required();
        pairs.extend([
            ("SFTP_PORT", "2022"),
            ("VIRTUAL_DIR", "custom/dir/"),
            ("MAX_FILE_SIZE", "2048"),
            ("S3_BUCKET_PREFIX", "sftp"),
            ("AWS_REGION", "eu-west-1"),
            ("CONNECTION_TIMEOUT", "1m"),
            ("READ_TIMEOUT", "45s"),
            ("WRITE_TIMEOUT", "2m 30s"),
            ("MAX_CONNECTIONS", "7"),
        ]);
        let config = build(&pairs).unwrap();
        assert_eq!(config.server.port, 2022);
        assert_eq!(config.upload.virtual_dir, "/custom/dir");
        assert_eq!(config.upload.max_file_size, 2048);
        assert_eq!(config.storage.prefix(), Some("sftp"));
        assert_eq!(config.storage.region(), Some("eu-west-1"));
        assert_eq!(config.server.connection_timeout_secs, 60);
        assert_eq!(config.server.read_timeout_secs, 45);
        assert_eq!(config.server.write_timeout_secs, 150);
        assert_eq!(config.server.max_connections, 7);
    }

    #[test]
    fn test_invalid_values() {
        for var in [
            "SFTP_PORT",
            "MAX_FILE_SIZE",
            "CONNECTION_TIMEOUT",
            "READ_TIMEOUT",
            "WRITE_TIMEOUT",
            "MAX_CONNECTIONS",
        ] {
            let mut pairs = required();
            pairs.push((var, "invalid"));
            let err = build(&pairs).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidEnv { var: v, .. } if v == var),
                "{} should be rejected, got {}",
                var,
                err
            );
        }
    }

    #[test]
    fn test_zero_values_rejected() {
        for (var, value) in [
            ("MAX_FILE_SIZE", "0"),
            ("MAX_CONNECTIONS", "0"),
            ("CONNECTION_TIMEOUT", "0s"),
            ("READ_TIMEOUT", "0ms"),
        ] {
            let mut pairs = required();
            pairs.push((var, value));
            assert!(
                matches!(build(&pairs), Err(ConfigError::Invalid { .. })),
                "{}={} should be rejected",
                var,
                value
            );
        }
    }

    #[test]
    fn test_fractional_durations_rejected() {
        for (var, value) in [
            ("READ_TIMEOUT", "1500ms"),
            ("CONNECTION_TIMEOUT", "500ms"),
            ("WRITE_TIMEOUT", "2m 250ms"),
        ] {
            let mut pairs = required();
            pairs.push((var, value));
            let err = build(&pairs).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidEnv { var: v, .. } if v == var),
                "{}={} should be rejected, got {}",
                var,
                value,
                err
            );
        }

        let mut pairs = required();
        pairs.extend([("READ_TIMEOUT", "2m"), ("WRITE_TIMEOUT", "3000ms")]);
        let config = build(&pairs).unwrap();
        assert_eq!(config.server.read_timeout_secs, 120);
        assert_eq!(config.server.write_timeout_secs, 3);
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let mut pairs = required();
        pairs.extend([
            ("SFTP_PORT", ""),
            ("VIRTUAL_DIR", ""),
            ("S3_BUCKET_PREFIX", ""),
            ("AWS_REGION", ""),
        ]);
        let config = build(&pairs).unwrap();
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.upload.virtual_dir, "/uploads");
    }

    #[test]
    fn test_partial_config_file() {
        let toml_str = r#"
            [server]
            port = 5000

            [storage]
            bucket = "from-file"
        "#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.bucket, "from-file");
        // Other values should be defaults
        assert_eq!(config.upload.max_file_size, 1024 * 1024);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[storage]\nbucket = \"from-file\"\n\n[auth]\nrequired_account_id = \"111111111111\"\n",
        )
        .unwrap();

        let mut config = GatewayConfig::load_from(&path).unwrap();
        config
            .apply_env_from(env(&[("AWS_ACCOUNT_ID", "222222222222")]))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.storage.bucket, "from-file");
        assert_eq!(config.auth.required_account_id, "222222222222");
    }

    #[test]
    fn test_load_from_missing_uses_defaults() {
        let config = GatewayConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, 2222);
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let err = GatewayConfig::load(Some(Path::new("/nonexistent/uplink.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_sample_config() {
        let sample = GatewayConfig::sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[upload]"));
        assert!(sample.contains("[storage]"));
        let parsed: GatewayConfig = toml::from_str(&sample).unwrap();
        parsed.validate().unwrap();
    }
}
