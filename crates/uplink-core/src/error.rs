//! Error types for the uplink gateway

use std::fmt;

use thiserror::Error;

/// Why an authentication attempt was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthFailureReason {
    /// Identifier or secret was empty; the identity service was not called
    EmptyCredentials,
    /// The identity service rejected the pair, failed, or returned no tenant
    InvalidCredentials,
    /// The verified tenant is not the one this gateway serves
    UnauthorizedTenant,
}

impl AuthFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthFailureReason::EmptyCredentials => "empty_credentials",
            AuthFailureReason::InvalidCredentials => "invalid_credentials",
            AuthFailureReason::UnauthorizedTenant => "unauthorized_tenant",
        }
    }
}

impl fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication refused. Carries only the reason, never the delegate's detail.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("authentication failed: {reason}")]
pub struct AuthFailure {
    pub reason: AuthFailureReason,
}

impl AuthFailure {
    pub const fn new(reason: AuthFailureReason) -> Self {
        Self { reason }
    }
}

/// Errors from the per-path upload buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("upload already closed")]
    ClosedUpload,

    #[error("upload was discarded before it completed")]
    Discarded,

    #[error("file too large: write would reach {attempted} bytes (max {max})")]
    SizeExceeded { attempted: u64, max: u64 },
}

/// Failure of the final write to the durable store
#[derive(Error, Debug)]
#[error("storage handoff failed for key {key}: {source}")]
pub struct StorageFailure {
    pub key: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl StorageFailure {
    pub fn new(
        key: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
        }
    }
}

/// Per-request failures. None of these end the session.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("permission denied: {0}")]
    PathViolation(String),

    #[error("operation not permitted: {0}")]
    Forbidden(&'static str),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Storage(#[from] StorageFailure),
}

/// Wire status reported back to the client for a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    PermissionDenied,
    Invalid,
    Failure,
}

impl From<&RequestError> for StatusKind {
    fn from(e: &RequestError) -> Self {
        match e {
            RequestError::PathViolation(_) => StatusKind::PermissionDenied,
            RequestError::Forbidden(_) => StatusKind::PermissionDenied,
            RequestError::InvalidOperation(_) => StatusKind::Invalid,
            RequestError::Upload(_) => StatusKind::Failure,
            RequestError::Storage(_) => StatusKind::Failure,
        }
    }
}
