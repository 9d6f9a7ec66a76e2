//! Storage handoff
//!
//! Moves a completed upload's bytes to the durable store in a single call.
//! There is no retry: a failed handoff fails the client's transfer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, info};

use uplink_core::{Credentials, Session, StorageFailure, StorageKey};

/// Opaque error from an object store backend
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Default bound on one handoff call
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Object metadata keys
pub const META_CLIENT_IP: &str = "client-ip";
pub const META_ACCESS_KEY_ID: &str = "access-key-id";
pub const META_UPLOAD_TIME: &str = "upload-time";
pub const META_ORIGINAL_PATH: &str = "original-path";

/// Durable object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key`, acting as the owner of `credentials`
    async fn put_object(
        &self,
        credentials: &Credentials,
        key: &StorageKey,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError>;
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct StorageHandoff {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    timeout: Duration,
    clock: Clock,
}

impl StorageHandoff {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        Self {
            store,
            prefix,
            timeout: DEFAULT_HANDOFF_TIMEOUT,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the wall clock used for key dates and upload timestamps
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn key_for(&self, path: &str) -> StorageKey {
        StorageKey::derive(self.prefix.as_deref(), (self.clock)(), path)
    }

    /// Store `bytes` uploaded to `path` during `session`
    pub async fn finalize(
        &self,
        session: &Session,
        path: &str,
        bytes: Bytes,
    ) -> Result<StorageKey, StorageFailure> {
        let now = (self.clock)();
        let key = StorageKey::derive(self.prefix.as_deref(), now, path);
        let size = bytes.len();

        let metadata = HashMap::from([
            (META_CLIENT_IP.to_string(), session.client_ip.clone()),
            (
                META_ACCESS_KEY_ID.to_string(),
                session.access_key_id().to_string(),
            ),
            (
                META_UPLOAD_TIME.to_string(),
                now.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (META_ORIGINAL_PATH.to_string(), path.to_string()),
        ]);

        let put = self
            .store
            .put_object(&session.credentials, &key, bytes, metadata);

        let result = match tokio::time::timeout(self.timeout, put).await {
            Ok(result) => result,
            Err(_) => Err(format!("storage call timed out after {:?}", self.timeout).into()),
        };

        match result {
            Ok(()) => {
                info!(
                    remote_ip = %session.client_ip,
                    access_key_id = %session.access_key_id(),
                    file_path = path,
                    s3_key = %key,
                    size = size,
                    "upload stored"
                );
                Ok(key)
            }
            Err(e) => {
                error!(
                    remote_ip = %session.client_ip,
                    access_key_id = %session.access_key_id(),
                    file_path = path,
                    s3_key = %key,
                    size = size,
                    error = %e,
                    "storage handoff failed"
                );
                Err(StorageFailure::new(key.into_string(), e))
            }
        }
    }
}
