//! SSH connection handler
//!
//! Password authentication only: the user name is the access key id and the
//! password is the secret. Authenticated clients may open session channels
//! and request the `sftp` subsystem; nothing else is served.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Msg, Session as SshTransport};
use russh::{Channel, ChannelId};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use uplink_core::{Credentials, Session};

use crate::auth::Authenticator;
use crate::deadline::DeadlineHandle;
use crate::dispatch::CommandDispatcher;
use crate::sftp::SftpChannel;

/// Name of the only subsystem served
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// Errors that end an SSH connection
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection SSH handler
pub struct SshSession {
    client_ip: String,
    authenticator: Arc<dyn Authenticator>,
    dispatcher: Arc<CommandDispatcher>,
    deadline: DeadlineHandle,
    tracker: TaskTracker,
    session: Option<Arc<Session>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SshSession {
    pub fn new(
        client_ip: String,
        authenticator: Arc<dyn Authenticator>,
        dispatcher: Arc<CommandDispatcher>,
        deadline: DeadlineHandle,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            client_ip,
            authenticator,
            dispatcher,
            deadline,
            tracker,
            session: None,
            channels: HashMap::new(),
        }
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }
}

#[async_trait]
impl russh::server::Handler for SshSession {
    type Error = SessionError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let credentials = Credentials::new(user, password);

        match self.authenticator.authenticate(&self.client_ip, credentials).await {
            Ok(session) => {
                self.deadline.clear();
                self.session = Some(Arc::new(session));
                Ok(Auth::Accept)
            }
            Err(_) => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshTransport,
    ) -> Result<bool, Self::Error> {
        if self.session.is_none() {
            return Ok(false);
        }
        debug!(remote_ip = %self.client_ip, channel = ?channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut SshTransport,
    ) -> Result<(), Self::Error> {
        let Some(auth) = self.session.clone() else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        if name != SFTP_SUBSYSTEM {
            warn!(remote_ip = %self.client_ip, subsystem = name, "unsupported subsystem requested");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        session.channel_success(channel_id);
        info!(
            remote_ip = %self.client_ip,
            access_key_id = %auth.access_key_id(),
            "SFTP subsystem started"
        );

        let handler = SftpChannel::new(auth, self.dispatcher.clone(), self.tracker.token());
        russh_sftp::server::run(channel.into_stream(), handler).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut SshTransport,
    ) -> Result<(), Self::Error> {
        warn!(remote_ip = %self.client_ip, "shell request refused");
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut SshTransport,
    ) -> Result<(), Self::Error> {
        warn!(remote_ip = %self.client_ip, "exec request refused");
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut SshTransport,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::FakeVerifier;
    use crate::auth::SessionAuthenticator;
    use crate::handoff::tests::MemoryStore;
    use crate::handoff::StorageHandoff;
    use crate::upload::UploadRegistry;
    use russh::server::Handler;
    use uplink_core::PathGuard;

    fn handler(account: &str) -> (SshSession, DeadlineHandle) {
        let verifier = Arc::new(FakeVerifier::account(account));
        let authenticator = Arc::new(SessionAuthenticator::new(verifier, "123456789012"));
        let dispatcher = Arc::new(CommandDispatcher::new(
            PathGuard::new("/uploads"),
            Arc::new(UploadRegistry::new(1024)),
            Arc::new(StorageHandoff::new(Arc::new(MemoryStore::default()), None)),
        ));
        let deadline = DeadlineHandle::default();
        let ssh = SshSession::new(
            "10.1.2.3".into(),
            authenticator,
            dispatcher,
            deadline.clone(),
            TaskTracker::new(),
        );
        (ssh, deadline)
    }

    #[tokio::test]
    async fn test_password_auth_accepts_and_clears_deadline() {
        let (mut ssh, deadline) = handler("123456789012");

        let auth = ssh.auth_password("AKIDEXAMPLE", "secret").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert!(deadline.is_cleared());

        let session = ssh.session().unwrap();
        assert_eq!(session.client_ip, "10.1.2.3");
        assert_eq!(session.access_key_id(), "AKIDEXAMPLE");
    }

    #[tokio::test]
    async fn test_password_auth_rejects_other_tenant() {
        let (mut ssh, deadline) = handler("999999999999");

        let auth = ssh.auth_password("AKIDEXAMPLE", "secret").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(!deadline.is_cleared());
        assert!(ssh.session().is_none());
    }

    #[tokio::test]
    async fn test_empty_password_rejected() {
        let (mut ssh, _) = handler("123456789012");
        let auth = ssh.auth_password("AKIDEXAMPLE", "").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
    }
}
