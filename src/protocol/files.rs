//! File handles transferred to a worker at setup time.
//!
//! The caller hands the launcher a [`FileHandleSet`]. Only the
//! [`FileDescriptor`] view travels over the wire; the launcher keeps the
//! handles themselves until the worker acknowledges setup and then closes
//! them. Every handle in a set is closed exactly once: either explicitly
//! through [`FileHandleSet::close_all`] or when the set is dropped.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::fs::File;
use std::io;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::Pid;

// ============================================================================
// Constants
// ============================================================================

/// Size value meaning "until end of file".
pub const WHOLE_FILE: i64 = -1;

// ============================================================================
// Types
// ============================================================================

/// Platform handle value as sent to the worker.
pub type RawHandle = i64;

// ============================================================================
// FileHandle
// ============================================================================

/// An open OS handle that can be transferred to a worker.
pub trait FileHandle: Send + fmt::Debug {
    /// Returns the raw handle value the worker uses to locate the file.
    fn raw(&self) -> RawHandle;

    /// Closes the launcher's copy of the handle.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported while closing.
    fn close(self: Box<Self>) -> io::Result<()>;
}

#[cfg(unix)]
impl FileHandle for File {
    fn raw(&self) -> RawHandle {
        use std::os::fd::AsRawFd;
        RawHandle::from(self.as_raw_fd())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

// ============================================================================
// FileHandleInfo
// ============================================================================

/// One named handle, optionally restricted to a byte range.
#[derive(Debug)]
pub struct FileHandleInfo {
    /// Caller-chosen id the worker uses to look the file up.
    pub id: u32,
    /// The open handle.
    handle: Box<dyn FileHandle>,
    /// Start of the region, in bytes.
    pub offset: i64,
    /// Length of the region, or [`WHOLE_FILE`].
    pub size: i64,
}

impl FileHandleInfo {
    /// Wraps a handle that exposes the whole file.
    #[must_use]
    pub fn new(id: u32, handle: impl FileHandle + 'static) -> Self {
        Self {
            id,
            handle: Box::new(handle),
            offset: 0,
            size: WHOLE_FILE,
        }
    }

    /// Wraps a handle that exposes `size` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a negative offset or a size
    /// below [`WHOLE_FILE`].
    pub fn with_range(
        id: u32,
        handle: impl FileHandle + 'static,
        offset: i64,
        size: i64,
    ) -> Result<Self> {
        if offset < 0 {
            return Err(Error::invalid_argument(format!(
                "file {id}: negative offset {offset}"
            )));
        }
        if size < WHOLE_FILE {
            return Err(Error::invalid_argument(format!(
                "file {id}: invalid size {size}"
            )));
        }
        Ok(Self {
            id,
            handle: Box::new(handle),
            offset,
            size,
        })
    }

    /// Returns the wire view of this handle.
    #[must_use]
    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            id: self.id,
            raw: self.handle.raw(),
            offset: self.offset,
            size: self.size,
        }
    }
}

// ============================================================================
// FileHandleSet
// ============================================================================

/// Immutable set of handles keyed by id.
#[derive(Debug, Default)]
pub struct FileHandleSet {
    entries: Vec<FileHandleInfo>,
}

impl FileHandleSet {
    /// Creates a set, rejecting duplicate ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if two entries share an id. The
    /// handles are closed in that case.
    pub fn new(entries: Vec<FileHandleInfo>) -> Result<Self> {
        let mut seen = FxHashSet::default();
        let duplicate = entries.iter().find(|e| !seen.insert(e.id)).map(|e| e.id);

        let set = Self { entries };
        match duplicate {
            Some(id) => Err(Error::invalid_argument(format!("duplicate file id {id}"))),
            None => Ok(set),
        }
    }

    /// Creates an empty set.
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of handles still held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no handles are held.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the wire view of every handle.
    #[must_use]
    pub fn descriptors(&self) -> Vec<FileDescriptor> {
        self.entries.iter().map(FileHandleInfo::descriptor).collect()
    }

    /// Closes every held handle and empties the set.
    ///
    /// Close errors are logged, not returned. Returns how many handles
    /// were closed by this call; a second call returns zero.
    pub fn close_all(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);
        let count = entries.len();

        for entry in entries {
            let id = entry.id;
            if let Err(e) = entry.handle.close() {
                warn!(file_id = id, error = %e, "Failed to close transferred file handle");
            }
        }

        if count > 0 {
            trace!(count, "Closed transferred file handles");
        }
        count
    }
}

impl Drop for FileHandleSet {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ============================================================================
// FileDescriptor
// ============================================================================

/// Wire form of a transferred handle.
///
/// # Format
///
/// ```json
/// { "id": 3, "raw": 17, "offset": 0, "size": -1 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Caller-chosen id.
    pub id: u32,
    /// Raw handle value in the launcher process.
    pub raw: RawHandle,
    /// Start of the region, in bytes.
    pub offset: i64,
    /// Length of the region, or [`WHOLE_FILE`].
    pub size: i64,
}

impl FileDescriptor {
    /// Returns `true` if the descriptor covers the whole file.
    #[inline]
    #[must_use]
    pub const fn is_whole_file(&self) -> bool {
        self.offset == 0 && self.size == WHOLE_FILE
    }

    /// Opens the worker's own copy of the launcher's handle.
    ///
    /// Must run before the setup acknowledgement is sent, because the
    /// launcher closes its copy as soon as it sees the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the handle cannot be reopened, or
    /// [`io::ErrorKind::Unsupported`] off Linux.
    pub fn open_from(&self, host: Pid) -> io::Result<File> {
        #[cfg(target_os = "linux")]
        {
            File::open(format!("/proc/{host}/fd/{}", self.raw))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = host;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "handle transfer requires /proc",
            ))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handle that counts closes and panics on a second one.
    #[derive(Debug, Clone)]
    pub(crate) struct CountingHandle {
        pub raw: RawHandle,
        pub closes: Arc<AtomicUsize>,
    }

    impl CountingHandle {
        pub(crate) fn new(raw: RawHandle) -> Self {
            Self {
                raw,
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl FileHandle for CountingHandle {
        fn raw(&self) -> RawHandle {
            self.raw
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            let previous = self.closes.fetch_add(1, Ordering::SeqCst);
            assert_eq!(previous, 0, "handle {} closed twice", self.raw);
            Ok(())
        }
    }

    #[test]
    fn test_descriptor_whole_file() {
        let info = FileHandleInfo::new(3, CountingHandle::new(17));
        let descriptor = info.descriptor();
        assert_eq!(descriptor.id, 3);
        assert_eq!(descriptor.raw, 17);
        assert!(descriptor.is_whole_file());
    }

    #[test]
    fn test_with_range_validates() {
        assert!(FileHandleInfo::with_range(1, CountingHandle::new(1), -1, 10).is_err());
        assert!(FileHandleInfo::with_range(1, CountingHandle::new(1), 0, -2).is_err());

        let info = FileHandleInfo::with_range(1, CountingHandle::new(1), 4096, 512)
            .expect("valid range");
        assert!(!info.descriptor().is_whole_file());
    }

    #[test]
    fn test_duplicate_ids_rejected_and_closed() {
        let a = CountingHandle::new(10);
        let b = CountingHandle::new(11);
        let result = FileHandleSet::new(vec![
            FileHandleInfo::new(1, a.clone()),
            FileHandleInfo::new(1, b.clone()),
        ]);

        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
        assert_eq!(a.close_count(), 1);
        assert_eq!(b.close_count(), 1);
    }

    #[test]
    fn test_close_all_closes_once() {
        let a = CountingHandle::new(10);
        let b = CountingHandle::new(11);
        let mut set = FileHandleSet::new(vec![
            FileHandleInfo::new(1, a.clone()),
            FileHandleInfo::new(2, b.clone()),
        ])
        .expect("unique ids");

        assert_eq!(set.close_all(), 2);
        assert_eq!(set.close_all(), 0);
        assert!(set.is_empty());
        drop(set);

        assert_eq!(a.close_count(), 1);
        assert_eq!(b.close_count(), 1);
    }

    #[test]
    fn test_drop_closes_remaining() {
        let a = CountingHandle::new(10);
        {
            let _set = FileHandleSet::new(vec![FileHandleInfo::new(1, a.clone())])
                .expect("unique ids");
        }
        assert_eq!(a.close_count(), 1);
    }

    #[test]
    fn test_descriptor_json_shape() {
        let descriptor = FileDescriptor {
            id: 3,
            raw: 17,
            offset: 0,
            size: WHOLE_FILE,
        };
        let json = serde_json::to_value(descriptor).expect("serialize");
        assert_eq!(json["id"], 3);
        assert_eq!(json["raw"], 17);
        assert_eq!(json["size"], -1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_from_current_process() {
        use std::io::{Read, Seek, Write};

        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(b"payload").expect("write");
        file.rewind().expect("rewind");

        let info = FileHandleInfo::new(1, file);
        let host = Pid::current().expect("pid");
        let mut reopened = info.descriptor().open_from(host).expect("reopen");

        let mut contents = String::new();
        reopened.read_to_string(&mut contents).expect("read");
        assert_eq!(contents, "payload");
    }
}
