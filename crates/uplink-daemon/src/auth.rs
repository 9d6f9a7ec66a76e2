//! Session authentication
//!
//! A presented credential pair is checked by an external identity service and
//! the tenant it reports must match the one tenant this gateway serves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use uplink_core::{AuthFailure, AuthFailureReason, Credentials, Session};

/// What the identity service knows about a verified caller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Tenant (account) identifier, if the service returned one
    pub account: Option<String>,
    pub user_id: Option<String>,
    pub arn: Option<String>,
}

/// Failure reported by an identity delegate. The detail is only ever logged.
#[derive(Debug, thiserror::Error)]
#[error("identity verification failed: {0}")]
pub struct IdentityError(pub String);

impl IdentityError {
    pub fn new(detail: impl std::fmt::Display) -> Self {
        Self(detail.to_string())
    }
}

/// External identity-verification delegate.
///
/// Called once per authentication attempt with the pair exactly as presented.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credentials: &Credentials) -> Result<CallerIdentity, IdentityError>;
}

/// Capability the transport calls to turn a credential pair into a session
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        client_ip: &str,
        credentials: Credentials,
    ) -> Result<Session, AuthFailure>;
}

/// Default identity-service deadline
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticator backed by an [`IdentityVerifier`] and a required tenant
pub struct SessionAuthenticator {
    verifier: Arc<dyn IdentityVerifier>,
    required_tenant: String,
    timeout: Duration,
}

impl SessionAuthenticator {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, required_tenant: impl Into<String>) -> Self {
        Self {
            verifier,
            required_tenant: required_tenant.into(),
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn required_tenant(&self) -> &str {
        &self.required_tenant
    }

    /// Log the one record for a failed attempt and build the failure
    fn reject(
        client_ip: &str,
        access_key_id: &str,
        reason: AuthFailureReason,
        error: Option<&str>,
        account_id: Option<&str>,
    ) -> AuthFailure {
        warn!(
            remote_ip = client_ip,
            access_key_id = access_key_id,
            reason = reason.as_str(),
            error,
            account_id,
            "authentication failed"
        );
        AuthFailure::new(reason)
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn authenticate(
        &self,
        client_ip: &str,
        credentials: Credentials,
    ) -> Result<Session, AuthFailure> {
        let access_key_id = credentials.access_key_id.clone();

        if credentials.is_empty() {
            return Err(Self::reject(
                client_ip,
                &access_key_id,
                AuthFailureReason::EmptyCredentials,
                None,
                None,
            ));
        }

        let identity =
            match tokio::time::timeout(self.timeout, self.verifier.verify(&credentials)).await {
                Ok(Ok(identity)) => identity,
                Ok(Err(e)) => {
                    let detail = e.to_string();
                    return Err(Self::reject(
                        client_ip,
                        &access_key_id,
                        AuthFailureReason::InvalidCredentials,
                        Some(&detail),
                        None,
                    ));
                }
                Err(_) => {
                    let detail = format!("identity service timed out after {:?}", self.timeout);
                    return Err(Self::reject(
                        client_ip,
                        &access_key_id,
                        AuthFailureReason::InvalidCredentials,
                        Some(&detail),
                        None,
                    ));
                }
            };

        let tenant = match identity.account {
            Some(account) if !account.is_empty() => account,
            _ => {
                return Err(Self::reject(
                    client_ip,
                    &access_key_id,
                    AuthFailureReason::InvalidCredentials,
                    Some("identity service returned no account"),
                    None,
                ))
            }
        };

        if tenant != self.required_tenant {
            return Err(Self::reject(
                client_ip,
                &access_key_id,
                AuthFailureReason::UnauthorizedTenant,
                None,
                Some(&tenant),
            ));
        }

        info!(
            remote_ip = client_ip,
            access_key_id = %access_key_id,
            account_id = %tenant,
            user_id = identity.user_id.as_deref().unwrap_or(""),
            arn = identity.arn.as_deref().unwrap_or(""),
            "authentication successful"
        );

        Ok(Session {
            client_ip: client_ip.to_string(),
            credentials,
            tenant_id: tenant,
        })
    }
}
