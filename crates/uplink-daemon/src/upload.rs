//! In-flight upload tracking
//!
//! Each virtual path being written has one `UploadState`: a bounded,
//! offset-addressed buffer behind its own lock. The registry maps paths to
//! states with a concurrent map so unrelated paths never contend.
//!
//! Writes may arrive at any offset in any order. Overlapping writes resolve by
//! offset alone: whichever write lands last owns the overlapping bytes.
//!
//! Several handles, possibly on different channels, may share one state. An
//! unfinished upload is discarded only when its last handle is released.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use uplink_core::UploadError;

#[derive(Debug, Default)]
struct UploadBuffer {
    data: Vec<u8>,
    /// Set once on close; later closes hand out the same bytes
    finished: Option<Bytes>,
    discarded: bool,
    holders: usize,
}

/// Buffer for one virtual path
#[derive(Debug)]
pub struct UploadState {
    path: String,
    max_size: u64,
    inner: Mutex<UploadBuffer>,
}

/// Result of closing an upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Closed {
    /// This call closed the upload; the bytes must be handed off
    Completed(Bytes),
    /// The upload was already closed; nothing to do
    AlreadyClosed(Bytes),
    /// The upload was thrown away before anyone closed it
    Discarded,
}

impl Closed {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Closed::Completed(b) | Closed::AlreadyClosed(b) => b,
            Closed::Discarded => &[],
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Closed::Completed(_))
    }
}

impl UploadState {
    fn new(path: String, max_size: u64) -> Self {
        Self {
            path,
            max_size,
            inner: Mutex::new(UploadBuffer::default()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current logical length of the buffer
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.finished {
            Some(bytes) => bytes.len(),
            None => inner.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.inner.lock();
        inner.finished.is_some() || inner.discarded
    }

    pub fn is_discarded(&self) -> bool {
        self.inner.lock().discarded
    }

    /// Copy `data` into the buffer at `offset`, zero-filling any gap.
    ///
    /// A write that would end past the size limit leaves the buffer untouched.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, UploadError> {
        let mut inner = self.inner.lock();

        if inner.discarded {
            return Err(UploadError::Discarded);
        }
        if inner.finished.is_some() {
            return Err(UploadError::ClosedUpload);
        }

        let end = offset.checked_add(data.len() as u64).unwrap_or(u64::MAX);
        if end > self.max_size {
            return Err(UploadError::SizeExceeded {
                attempted: end,
                max: self.max_size,
            });
        }

        // end <= max_size, which the buffer already had to fit in memory
        let start = offset as usize;
        let end = end as usize;
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(data);

        Ok(data.len())
    }

    /// Mark the upload closed and return its final contents.
    pub fn close(&self) -> Closed {
        let mut inner = self.inner.lock();

        if inner.discarded {
            return Closed::Discarded;
        }
        if let Some(bytes) = &inner.finished {
            return Closed::AlreadyClosed(bytes.clone());
        }

        let bytes = Bytes::from(std::mem::take(&mut inner.data));
        inner.finished = Some(bytes.clone());
        Closed::Completed(bytes)
    }

    /// Throw the contents away unless the upload already completed
    fn discard(&self) -> bool {
        let mut inner = self.inner.lock();
        Self::discard_locked(&mut inner)
    }

    /// Drop one holder; the last holder of an unfinished upload discards it
    fn detach(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.holders = inner.holders.saturating_sub(1);
        if inner.holders > 0 {
            return false;
        }
        Self::discard_locked(&mut inner)
    }

    fn discard_locked(inner: &mut UploadBuffer) -> bool {
        if inner.finished.is_some() || inner.discarded {
            return false;
        }
        inner.data = Vec::new();
        inner.discarded = true;
        true
    }
}

/// Path → upload map shared by every connection of one server
pub struct UploadRegistry {
    uploads: DashMap<String, Arc<UploadState>>,
    max_file_size: u64,
}

impl UploadRegistry {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            uploads: DashMap::new(),
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Return the live upload for `path`, creating it if absent.
    ///
    /// Every call counts as one more holder until [`release`](Self::release).
    pub fn open(&self, path: &str) -> Arc<UploadState> {
        let state = self.uploads.entry(path.to_string()).or_insert_with(|| {
            debug!(file_path = path, "upload state created");
            Arc::new(UploadState::new(path.to_string(), self.max_file_size))
        });
        state.inner.lock().holders += 1;
        state.value().clone()
    }

    pub fn get(&self, path: &str) -> Option<Arc<UploadState>> {
        self.uploads.get(path).map(|s| s.clone())
    }

    pub fn write_at(
        &self,
        state: &UploadState,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, UploadError> {
        state.write_at(data, offset)
    }

    /// Close `state` and drop it from the map.
    ///
    /// Removal happens before the caller hands the bytes off, so a write to
    /// the same path afterwards starts a fresh upload.
    pub fn close(&self, state: &Arc<UploadState>) -> Closed {
        let closed = state.close();
        if closed.is_completed() {
            self.remove_exact(state);
        }
        closed
    }

    /// Drop whatever upload is live for `path` without handing it off
    pub fn abandon(&self, path: &str) -> bool {
        match self.uploads.remove(path) {
            Some((_, state)) => {
                state.discard();
                debug!(file_path = path, "upload abandoned");
                true
            }
            None => false,
        }
    }

    /// Give up one holder of `state`.
    ///
    /// Returns true when this was the last holder of a live, unfinished
    /// upload, which is then discarded and dropped from the map.
    pub fn release(&self, state: &Arc<UploadState>) -> bool {
        match self.uploads.entry(state.path().to_string()) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), state) => {
                if !state.detach() {
                    return false;
                }
                entry.remove();
            }
            _ => {
                // already closed or abandoned
                state.detach();
                return false;
            }
        }
        debug!(file_path = state.path(), "upload released unfinished");
        true
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.uploads.contains_key(path)
    }

    fn remove_exact(&self, state: &Arc<UploadState>) {
        self.uploads
            .remove_if(state.path(), |_, live| Arc::ptr_eq(live, state));
    }
}
