//! Command dispatch
//!
//! Every file-transfer request is judged independently against a fixed table:
//! uploads inside the virtual root are accepted, Mkdir and Setstat succeed
//! without effect, everything that would read, list or modify existing data is
//! refused.

use std::sync::Arc;

use tracing::{debug, info, warn};

use uplink_core::path::clean;
use uplink_core::{Command, PathGuard, RequestError, Session, StorageKey, UploadError};

use crate::handoff::StorageHandoff;
use crate::upload::{Closed, UploadRegistry, UploadState};

/// Outcome of an accepted command
#[derive(Debug)]
pub enum Decision {
    /// Write data into this upload
    Upload(Arc<UploadState>),
    /// Accepted with nothing to do
    NoOp,
}

pub struct CommandDispatcher {
    guard: PathGuard,
    registry: Arc<UploadRegistry>,
    handoff: Arc<StorageHandoff>,
}

impl CommandDispatcher {
    pub fn new(guard: PathGuard, registry: Arc<UploadRegistry>, handoff: Arc<StorageHandoff>) -> Self {
        Self {
            guard,
            registry,
            handoff,
        }
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.registry
    }

    /// Judge one command for `session`
    pub fn dispatch(&self, session: &Session, command: Command) -> Result<Decision, RequestError> {
        let result = match &command {
            Command::Write { path } => {
                if self.guard.allowed(path) {
                    Ok(Decision::Upload(self.registry.open(&clean(path))))
                } else {
                    Err(RequestError::PathViolation(path.clone()))
                }
            }
            Command::Mkdir { path } => {
                if self.guard.allowed(path) {
                    Ok(Decision::NoOp)
                } else {
                    Err(RequestError::PathViolation(path.clone()))
                }
            }
            Command::Setstat { .. } => Ok(Decision::NoOp),
            Command::Remove { .. } => Err(RequestError::Forbidden("file deletion")),
            Command::Rename { .. } => Err(RequestError::Forbidden("file rename")),
            Command::Rmdir { .. } => Err(RequestError::Forbidden("directory removal")),
            Command::Read { .. } => Err(RequestError::Forbidden("file download")),
            Command::List { .. } => Err(RequestError::Forbidden("directory listing")),
            Command::Stat { .. } => Err(RequestError::Forbidden("file stat")),
            Command::Other { name, .. } => Err(RequestError::InvalidOperation(name.clone())),
        };

        match &result {
            Ok(_) => info!(
                remote_ip = %session.client_ip,
                access_key_id = %session.access_key_id(),
                file_path = command.path(),
                command = command.name(),
                "request allowed"
            ),
            Err(e) => warn!(
                remote_ip = %session.client_ip,
                access_key_id = %session.access_key_id(),
                file_path = command.path(),
                command = command.name(),
                error = %e,
                "request refused"
            ),
        }

        result
    }

    /// Write `data` at `offset` into an accepted upload
    pub fn write(
        &self,
        session: &Session,
        upload: &UploadState,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, RequestError> {
        match self.registry.write_at(upload, data, offset) {
            Ok(written) => {
                debug!(
                    remote_ip = %session.client_ip,
                    file_path = upload.path(),
                    offset = offset,
                    length = written,
                    "data written"
                );
                Ok(written)
            }
            Err(e) => {
                warn!(
                    remote_ip = %session.client_ip,
                    access_key_id = %session.access_key_id(),
                    file_path = upload.path(),
                    offset = offset,
                    length = data.len(),
                    error = %e,
                    "write refused"
                );
                Err(e.into())
            }
        }
    }

    /// Close an upload and, the first time, hand it off to storage.
    ///
    /// Returns the key written, or `None` when the upload was already closed.
    /// An upload discarded before this close is an error: nothing was stored.
    pub async fn commit(
        &self,
        session: &Session,
        upload: &Arc<UploadState>,
    ) -> Result<Option<StorageKey>, RequestError> {
        let bytes = match self.registry.close(upload) {
            Closed::Completed(bytes) => bytes,
            Closed::AlreadyClosed(_) => return Ok(None),
            Closed::Discarded => {
                warn!(
                    remote_ip = %session.client_ip,
                    access_key_id = %session.access_key_id(),
                    file_path = upload.path(),
                    "close of a discarded upload"
                );
                return Err(UploadError::Discarded.into());
            }
        };

        info!(
            remote_ip = %session.client_ip,
            access_key_id = %session.access_key_id(),
            file_path = upload.path(),
            size = bytes.len(),
            "upload complete, handing off"
        );

        let key = self.handoff.finalize(session, upload.path(), bytes).await?;
        Ok(Some(key))
    }

    /// Drop an unfinished upload without storing it
    pub fn abandon(&self, path: &str) -> bool {
        self.registry.abandon(&clean(path))
    }

    /// Drop `upload` if it is still unfinished and still live
    pub fn release(&self, upload: &Arc<UploadState>) -> bool {
        self.registry.release(upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::tests::{session, MemoryStore};
    use uplink_core::StatusKind;

    fn dispatcher(store: Arc<MemoryStore>) -> CommandDispatcher {
        let registry = Arc::new(UploadRegistry::new(1024));
        let handoff = Arc::new(StorageHandoff::new(store, Some("sftp".into())));
        CommandDispatcher::new(PathGuard::new("/uploads"), registry, handoff)
    }

    fn status(result: Result<Decision, RequestError>) -> StatusKind {
        match result {
            Ok(_) => StatusKind::Ok,
            Err(e) => StatusKind::from(&e),
        }
    }

    #[test]
    fn test_table() {
        let d = dispatcher(Arc::new(MemoryStore::default()));
        let s = session();
        let p = || "/uploads/report.txt".to_string();

        let cases = vec![
            (Command::Write { path: p() }, StatusKind::Ok),
            (Command::Remove { path: p() }, StatusKind::PermissionDenied),
            (
                Command::Rename {
                    from: p(),
                    to: "/uploads/other.txt".into(),
                },
                StatusKind::PermissionDenied,
            ),
            (Command::Rmdir { path: "/uploads/dir".into() }, StatusKind::PermissionDenied),
            (Command::Mkdir { path: "/uploads/new".into() }, StatusKind::Ok),
            (Command::Setstat { path: p() }, StatusKind::Ok),
            (Command::Read { path: p() }, StatusKind::PermissionDenied),
            (Command::List { path: "/uploads".into() }, StatusKind::PermissionDenied),
            (Command::Stat { path: p() }, StatusKind::PermissionDenied),
            (
                Command::Other {
                    name: "Symlink".into(),
                    path: p(),
                },
                StatusKind::Invalid,
            ),
        ];

        for (command, expected) in cases {
            let name = command.name().to_string();
            assert_eq!(status(d.dispatch(&s, command)), expected, "{}", name);
        }
    }

    #[test]
    fn test_write_outside_root_denied() {
        let d = dispatcher(Arc::new(MemoryStore::default()));
        let s = session();

        for path in ["/etc/passwd", "/uploads/../etc/passwd", "/uploads_other/x", "/"] {
            let err = d
                .dispatch(&s, Command::Write { path: path.into() })
                .unwrap_err();
            assert!(matches!(err, RequestError::PathViolation(_)), "{}", path);
        }
        assert!(d.registry().is_empty());
    }

    #[test]
    fn test_mkdir_outside_root_denied() {
        let d = dispatcher(Arc::new(MemoryStore::default()));
        let err = d
            .dispatch(&session(), Command::Mkdir { path: "/tmp/x".into() })
            .unwrap_err();
        assert!(matches!(err, RequestError::PathViolation(_)));
    }

    #[test]
    fn test_write_paths_are_canonical() {
        let d = dispatcher(Arc::new(MemoryStore::default()));
        let s = session();

        let a = match d.dispatch(&s, Command::Write { path: "/uploads/./a.txt".into() }) {
            Ok(Decision::Upload(state)) => state,
            other => panic!("unexpected {:?}", other),
        };
        let b = match d.dispatch(&s, Command::Write { path: "/uploads//a.txt".into() }) {
            Ok(Decision::Upload(state)) => state,
            other => panic!("unexpected {:?}", other),
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.path(), "/uploads/a.txt");
    }

    #[tokio::test]
    async fn test_commit_hands_off_once() {
        let store = Arc::new(MemoryStore::default());
        let d = dispatcher(store.clone());
        let s = session();

        let upload = match d.dispatch(&s, Command::Write { path: "/uploads/report.txt".into() }) {
            Ok(Decision::Upload(state)) => state,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(d.write(&s, &upload, 0, b"hello").unwrap(), 5);

        let key = d.commit(&s, &upload).await.unwrap().unwrap();
        assert!(key.as_str().starts_with("sftp/"));
        assert!(key.as_str().ends_with("/report.txt"));

        assert_eq!(d.commit(&s, &upload).await.unwrap(), None);
        assert_eq!(store.puts().len(), 1);

        let err = d.write(&s, &upload, 5, b"late").unwrap_err();
        assert!(matches!(err, RequestError::Upload(UploadError::ClosedUpload)));
    }

    #[tokio::test]
    async fn test_failed_handoff_discards_upload() {
        let store = Arc::new(MemoryStore {
            fail_with: Some("AccessDenied".into()),
            ..Default::default()
        });
        let d = dispatcher(store);
        let s = session();

        let upload = match d.dispatch(&s, Command::Write { path: "/uploads/x.bin".into() }) {
            Ok(Decision::Upload(state)) => state,
            other => panic!("unexpected {:?}", other),
        };
        d.write(&s, &upload, 0, b"data").unwrap();

        let err = d.commit(&s, &upload).await.unwrap_err();
        assert_eq!(StatusKind::from(&err), StatusKind::Failure);
        assert!(!d.registry().contains("/uploads/x.bin"));
    }

    #[tokio::test]
    async fn test_commit_of_abandoned_upload_fails() {
        let store = Arc::new(MemoryStore::default());
        let d = dispatcher(store.clone());
        let s = session();

        let upload = match d.dispatch(&s, Command::Write { path: "/uploads/q.txt".into() }) {
            Ok(Decision::Upload(state)) => state,
            other => panic!("unexpected {:?}", other),
        };
        d.write(&s, &upload, 0, b"hello").unwrap();
        assert!(d.abandon("/uploads/q.txt"));

        let err = d.commit(&s, &upload).await.unwrap_err();
        assert!(matches!(err, RequestError::Upload(UploadError::Discarded)));
        assert_eq!(StatusKind::from(&err), StatusKind::Failure);
        assert!(store.puts().is_empty());
    }

    #[test]
    fn test_abandon() {
        let d = dispatcher(Arc::new(MemoryStore::default()));
        let s = session();
        d.dispatch(&s, Command::Write { path: "/uploads/p.txt".into() })
            .unwrap();
        assert!(d.abandon("/uploads/./p.txt"));
        assert!(d.registry().is_empty());
    }
}
