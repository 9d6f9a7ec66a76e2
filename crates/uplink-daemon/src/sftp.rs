//! SFTP subsystem adapter
//!
//! Translates SFTP requests into [`Command`]s for the dispatcher and maps the
//! results back onto SFTP status codes. One `SftpChannel` serves one channel;
//! upload handles still open when the channel ends are released.
//!
//! The channel loop runs on its own task, so each channel holds a token of
//! the supervisor's task tracker until it is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Packet, Status, StatusCode,
    Version,
};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, warn};

use uplink_core::path::clean;
use uplink_core::{Command, RequestError, Session, StatusKind};

use crate::dispatch::{CommandDispatcher, Decision};
use crate::upload::UploadState;

/// Open flags that make an `open` request an upload
const WRITE_FLAGS: [OpenFlags; 4] = [
    OpenFlags::WRITE,
    OpenFlags::CREATE,
    OpenFlags::TRUNCATE,
    OpenFlags::APPEND,
];

pub fn status_code(kind: StatusKind) -> StatusCode {
    match kind {
        StatusKind::Ok => StatusCode::Ok,
        StatusKind::PermissionDenied => StatusCode::PermissionDenied,
        StatusKind::Invalid => StatusCode::OpUnsupported,
        StatusKind::Failure => StatusCode::Failure,
    }
}

fn request_status(e: &RequestError) -> StatusCode {
    status_code(StatusKind::from(e))
}

pub struct SftpChannel {
    session: Arc<Session>,
    dispatcher: Arc<CommandDispatcher>,
    handles: HashMap<String, Arc<UploadState>>,
    next_handle: u64,
    version: Option<u32>,
    _task: TaskTrackerToken,
}

impl SftpChannel {
    pub fn new(
        session: Arc<Session>,
        dispatcher: Arc<CommandDispatcher>,
        task: TaskTrackerToken,
    ) -> Self {
        Self {
            session,
            dispatcher,
            handles: HashMap::new(),
            next_handle: 0,
            version: None,
            _task: task,
        }
    }

    /// Number of upload handles currently open on this channel
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Relative paths are taken relative to the virtual root
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.dispatcher.guard().root(), path)
        }
    }

    fn handle_path(&self, handle: &str) -> String {
        self.handles
            .get(handle)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| handle.to_string())
    }

    fn dispatch(&self, command: Command) -> Result<Decision, StatusCode> {
        self.dispatcher
            .dispatch(&self.session, command)
            .map_err(|e| request_status(&e))
    }

    /// Run a command that can only succeed with no effect
    fn judge(&self, id: u32, command: Command) -> Result<Status, StatusCode> {
        self.dispatch(command).map(|_| ok(id))
    }

    /// Run a command that is always refused
    fn refuse<T>(&self, command: Command) -> Result<T, StatusCode> {
        match self.dispatch(command) {
            Err(code) => Err(code),
            // the table never accepts these; report them the same way if it ever does
            Ok(_) => Err(StatusCode::PermissionDenied),
        }
    }
}

impl Drop for SftpChannel {
    fn drop(&mut self) {
        for (_, upload) in self.handles.drain() {
            if self.dispatcher.release(&upload) {
                warn!(
                    remote_ip = %self.session.client_ip,
                    access_key_id = %self.session.access_key_id(),
                    file_path = upload.path(),
                    "channel closed with upload still open, discarding"
                );
            }
        }
    }
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

impl russh_sftp::server::Handler for SftpChannel {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            warn!(remote_ip = %self.session.client_ip, "duplicate SFTP init");
            return Err(StatusCode::ConnectionLost);
        }
        self.version = Some(version);
        debug!(
            remote_ip = %self.session.client_ip,
            version = version,
            extensions = ?extensions,
            "SFTP session initialised"
        );
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.resolve(&filename);

        if !WRITE_FLAGS.iter().any(|flag| pflags.contains(*flag)) {
            return self.refuse(Command::Read { path });
        }

        match self.dispatch(Command::Write { path })? {
            Decision::Upload(upload) => {
                self.next_handle += 1;
                let handle = self.next_handle.to_string();
                self.handles.insert(handle.clone(), upload);
                Ok(Handle { id, handle })
            }
            Decision::NoOp => Err(StatusCode::Failure),
        }
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        let Some(upload) = self.handles.remove(&handle) else {
            return Ok(ok(id));
        };

        match self.dispatcher.commit(&self.session, &upload).await {
            Ok(_) => Ok(ok(id)),
            Err(e) => Err(request_status(&e)),
        }
    }

    async fn read(
        &mut self,
        _id: u32,
        handle: String,
        _offset: u64,
        _len: u32,
    ) -> Result<Data, Self::Error> {
        let path = self.handle_path(&handle);
        self.refuse(Command::Read { path })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(upload) = self.handles.get(&handle) else {
            warn!(remote_ip = %self.session.client_ip, handle = %handle, "write to unknown handle");
            return Err(StatusCode::Failure);
        };

        self.dispatcher
            .write(&self.session, upload, offset, &data)
            .map(|_| ok(id))
            .map_err(|e| request_status(&e))
    }

    async fn lstat(&mut self, _id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path);
        self.refuse(Command::Stat { path })
    }

    async fn fstat(&mut self, _id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let path = self.handle_path(&handle);
        self.refuse(Command::Stat { path })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        self.judge(id, Command::Setstat { path })
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.handle_path(&handle);
        self.judge(id, Command::Setstat { path })
    }

    async fn opendir(&mut self, _id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = self.resolve(&path);
        self.refuse(Command::List { path })
    }

    async fn readdir(&mut self, _id: u32, handle: String) -> Result<Name, Self::Error> {
        self.refuse(Command::List { path: handle })
    }

    async fn remove(&mut self, _id: u32, filename: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&filename);
        self.refuse(Command::Remove { path })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        self.judge(id, Command::Mkdir { path })
    }

    async fn rmdir(&mut self, _id: u32, path: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        self.refuse(Command::Rmdir { path })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = clean(&self.resolve(&path));
        debug!(remote_ip = %self.session.client_ip, path = %path, resolved = %resolved, "realpath");
        Ok(Name {
            id,
            files: vec![File::dummy(&resolved)],
        })
    }

    async fn stat(&mut self, _id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path);
        self.refuse(Command::Stat { path })
    }

    async fn rename(
        &mut self,
        _id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = self.resolve(&oldpath);
        let to = self.resolve(&newpath);
        self.refuse(Command::Rename { from, to })
    }

    async fn readlink(&mut self, _id: u32, path: String) -> Result<Name, Self::Error> {
        let path = self.resolve(&path);
        self.refuse(Command::Other {
            name: "Readlink".into(),
            path,
        })
    }

    async fn symlink(
        &mut self,
        _id: u32,
        linkpath: String,
        _targetpath: String,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&linkpath);
        self.refuse(Command::Other {
            name: "Symlink".into(),
            path,
        })
    }

    async fn extended(
        &mut self,
        _id: u32,
        request: String,
        _data: Vec<u8>,
    ) -> Result<Packet, Self::Error> {
        self.refuse(Command::Other {
            name: request,
            path: String::new(),
        })
    }
}
