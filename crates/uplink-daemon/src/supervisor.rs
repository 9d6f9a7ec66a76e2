//! Connection supervisor
//!
//! Owns the listening socket. Each accepted connection runs in its own task
//! under a handshake deadline; a semaphore caps how many run at once and
//! connections over the cap are closed straight away rather than queued.
//! On shutdown the accept loop stops and in-flight connections are awaited,
//! together with the SFTP channel tasks they started.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::{MethodSet, SshId};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use uplink_core::{client_ip, ServerConfig, MAX_AUTH_ATTEMPTS, SERVER_ID};

use crate::auth::Authenticator;
use crate::deadline::DeadlineStream;
use crate::dispatch::CommandDispatcher;
use crate::ssh::SshSession;

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("host key: {0}")]
    HostKey(String),
}

/// Load the host key at `path`, or generate an ephemeral Ed25519 key
pub fn load_host_key(path: Option<&Path>) -> Result<KeyPair, SupervisorError> {
    let Some(path) = path else {
        warn!("no host key configured, generating an ephemeral Ed25519 key");
        return KeyPair::generate_ed25519()
            .ok_or_else(|| SupervisorError::HostKey("failed to generate host key".into()));
    };

    let key_data = std::fs::read_to_string(path)
        .map_err(|e| SupervisorError::HostKey(format!("{}: {}", path.display(), e)))?;
    russh_keys::decode_secret_key(&key_data, None)
        .map_err(|e| SupervisorError::HostKey(format!("{}: {}", path.display(), e)))
}

/// SSH transport settings derived from the server configuration
pub fn ssh_config(server: &ServerConfig, key: KeyPair) -> russh::server::Config {
    russh::server::Config {
        server_id: SshId::Standard(SERVER_ID.to_string()),
        methods: MethodSet::PASSWORD,
        max_auth_attempts: MAX_AUTH_ATTEMPTS,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: Some(server.read_timeout()),
        keys: vec![key],
        ..Default::default()
    }
}

pub fn listen_addr(server: &ServerConfig) -> SocketAddr {
    SocketAddr::new(server.bind, server.port)
}

pub struct ConnectionSupervisor {
    ssh_config: Arc<russh::server::Config>,
    authenticator: Arc<dyn Authenticator>,
    dispatcher: Arc<CommandDispatcher>,
    limit: Arc<Semaphore>,
    max_connections: usize,
    connection_timeout: Duration,
    write_timeout: Duration,
    tracker: TaskTracker,
}

impl ConnectionSupervisor {
    pub fn new(
        server: &ServerConfig,
        ssh_config: russh::server::Config,
        authenticator: Arc<dyn Authenticator>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        Self {
            ssh_config: Arc::new(ssh_config),
            authenticator,
            dispatcher,
            limit: Arc::new(Semaphore::new(server.max_connections)),
            max_connections: server.max_connections,
            connection_timeout: server.connection_timeout(),
            write_timeout: server.write_timeout(),
            tracker: TaskTracker::new(),
        }
    }

    /// Connections currently being served
    pub fn live_connections(&self) -> usize {
        self.max_connections - self.limit.available_permits()
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, SupervisorError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| SupervisorError::Bind { addr, source })
    }

    /// Accept connections until `shutdown` fires, then wait for the ones in flight
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), SupervisorError> {
        if let Ok(addr) = listener.local_addr() {
            info!(
                address = %addr,
                max_connections = self.max_connections,
                "SFTP server listening"
            );
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => {
                    // accept errors (EMFILE and friends) are transient
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        drop(listener);
        info!(
            live_connections = self.live_connections(),
            "shutting down, waiting for active connections"
        );
        self.tracker.close();
        self.tracker.wait().await;
        info!("all connections finished");

        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let remote_ip = client_ip(Some(peer));

        let permit = match self.limit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    remote_ip = %remote_ip,
                    max_connections = self.max_connections,
                    "connection limit reached, closing"
                );
                drop(stream);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote_ip = %remote_ip, error = %e, "failed to set TCP_NODELAY");
        }
        let (stream, deadline) =
            DeadlineStream::new(stream, self.connection_timeout, self.write_timeout);
        let handler = SshSession::new(
            remote_ip.clone(),
            self.authenticator.clone(),
            self.dispatcher.clone(),
            deadline,
            self.tracker.clone(),
        );
        let config = self.ssh_config.clone();

        self.tracker.spawn(async move {
            debug!(remote_ip = %remote_ip, "connection accepted");

            let result = match russh::server::run_stream(config, stream, handler).await {
                Ok(running) => running.await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => info!(remote_ip = %remote_ip, "connection closed"),
                Err(e) => error!(remote_ip = %remote_ip, error = %e, "connection ended with error"),
            }

            drop(permit);
        });
    }
}
