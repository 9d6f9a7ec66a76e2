//! AWS-backed delegates
//!
//! Both delegates build their SDK configuration from the credential pair the
//! client presented. Nothing here falls back to ambient credentials: the
//! caller's own permissions apply to every call made on their behalf.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;

use uplink_core::{Credentials, StorageKey};

use crate::auth::{CallerIdentity, IdentityError, IdentityVerifier};
use crate::handoff::{ObjectStore, StoreError};

/// Provider name attached to the static credentials
const PROVIDER_NAME: &str = "uplink-session";

async fn session_config(credentials: &Credentials, region: Option<&str>) -> SdkConfig {
    let static_credentials = aws_sdk_sts::config::Credentials::new(
        credentials.access_key_id.clone(),
        credentials.secret.expose().to_string(),
        None,
        None,
        PROVIDER_NAME,
    );

    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).credentials_provider(static_credentials);
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    loader.load().await
}

/// Identity delegate calling STS `GetCallerIdentity`
#[derive(Clone, Debug, Default)]
pub struct StsIdentityVerifier {
    region: Option<String>,
}

impl StsIdentityVerifier {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }
}

#[async_trait]
impl IdentityVerifier for StsIdentityVerifier {
    async fn verify(&self, credentials: &Credentials) -> Result<CallerIdentity, IdentityError> {
        let config = session_config(credentials, self.region.as_deref()).await;
        let client = aws_sdk_sts::Client::new(&config);

        let output = client
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| IdentityError::new(aws_sdk_sts::error::DisplayErrorContext(&e)))?;

        debug!(
            access_key_id = %credentials.access_key_id,
            account_id = output.account().unwrap_or(""),
            "GetCallerIdentity returned"
        );

        Ok(CallerIdentity {
            account: output.account().map(str::to_string),
            user_id: output.user_id().map(str::to_string),
            arn: output.arn().map(str::to_string),
        })
    }
}

/// Object store writing to one S3 bucket
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    bucket: String,
    region: Option<String>,
}

impl S3ObjectStore {
    pub fn new(bucket: impl Into<String>, region: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        credentials: &Credentials,
        key: &StorageKey,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let config = session_config(credentials, self.region.as_deref()).await;
        let client = aws_sdk_s3::Client::new(&config);

        client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(ByteStream::from(body))
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| StoreError::from(aws_sdk_s3::error::DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}
