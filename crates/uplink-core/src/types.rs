//! Core type definitions for uplink
//!
//! Sessions, credentials and the closed set of file-transfer commands the
//! gateway knows how to judge.

use std::fmt;
use std::net::SocketAddr;

/// An opaque secret. Never printed, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Only the identity and storage delegates call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// The two opaque values a client presents, forwarded verbatim to the delegate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret: Secret,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret: Secret::new(secret),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_key_id.is_empty() || self.secret.is_empty()
    }
}

/// One authenticated connection. Immutable once created.
#[derive(Clone, Debug)]
pub struct Session {
    pub client_ip: String,
    pub credentials: Credentials,
    pub tenant_id: String,
}

impl Session {
    pub fn access_key_id(&self) -> &str {
        &self.credentials.access_key_id
    }
}

/// Address string used in logs and object metadata: the IP without the port.
pub fn client_ip(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".into(),
    }
}

/// Every file-transfer operation the gateway can be asked to perform
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Open a path for writing
    Write { path: String },
    Remove { path: String },
    Rename { from: String, to: String },
    Rmdir { path: String },
    Mkdir { path: String },
    Setstat { path: String },
    /// Open for reading, or read from a handle
    Read { path: String },
    /// Directory listing
    List { path: String },
    /// Any metadata lookup
    Stat { path: String },
    /// Anything outside the table above (symlinks, extensions, ...)
    Other { name: String, path: String },
}

impl Command {
    /// Name used in log records
    pub fn name(&self) -> &str {
        match self {
            Command::Write { .. } => "Write",
            Command::Remove { .. } => "Remove",
            Command::Rename { .. } => "Rename",
            Command::Rmdir { .. } => "Rmdir",
            Command::Mkdir { .. } => "Mkdir",
            Command::Setstat { .. } => "Setstat",
            Command::Read { .. } => "Read",
            Command::List { .. } => "List",
            Command::Stat { .. } => "Stat",
            Command::Other { name, .. } => name.as_str(),
        }
    }

    /// The virtual path the command targets (the source path for renames)
    pub fn path(&self) -> &str {
        match self {
            Command::Write { path }
            | Command::Remove { path }
            | Command::Rmdir { path }
            | Command::Mkdir { path }
            | Command::Setstat { path }
            | Command::Read { path }
            | Command::List { path }
            | Command::Stat { path }
            | Command::Other { path, .. } => path,
            Command::Rename { from, .. } => from,
        }
    }
}
