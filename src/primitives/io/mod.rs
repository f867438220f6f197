#![forbid(unsafe_code)]

use std::{
    fs::File,
    io::{self, ErrorKind},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::types::{Result, TreeError};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Creates a new StdFileIo from an existing File handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        trace!(target: "gbptree::io", off, len = dst.len(), "read_at");
        self.read_exact(off, dst).map_err(TreeError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(target: "gbptree::io", off, len = src.len(), "write_at");
        self.write_all(off, src).map_err(TreeError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(TreeError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(TreeError::from)
    }
}

/// [`FileIo`] wrapper that starts failing writes once an armed budget runs out.
///
/// Used to simulate a crash in the middle of a flush: after the failure every
/// later write and sync also fails, as if the process had died.
pub struct FaultyFileIo {
    inner: Arc<dyn FileIo>,
    budget: Mutex<Option<u64>>,
    torn: AtomicBool,
    tripped: AtomicBool,
    writes: AtomicU64,
}

impl FaultyFileIo {
    /// Wraps `inner` with no fault armed.
    pub fn new(inner: Arc<dyn FileIo>) -> Self {
        Self {
            inner,
            budget: Mutex::new(None),
            torn: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Lets `writes` more writes through, then fails.
    pub fn fail_writes_after(&self, writes: u64) {
        *self.budget.lock() = Some(writes);
        self.tripped.store(false, Ordering::Release);
    }

    /// When set, the failing write lands its first half before erroring.
    pub fn set_torn_writes(&self, torn: bool) {
        self.torn.store(torn, Ordering::Release);
    }

    /// Removes any armed fault.
    pub fn disarm(&self) {
        *self.budget.lock() = None;
        self.tripped.store(false, Ordering::Release);
    }

    /// Returns whether an injected failure has fired.
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Number of writes that reached the inner file.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    fn injected() -> TreeError {
        TreeError::Io(io::Error::new(ErrorKind::Other, "injected write failure"))
    }
}

impl FileIo for FaultyFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.tripped() {
            return Err(Self::injected());
        }
        {
            let mut budget = self.budget.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    self.tripped.store(true, Ordering::Release);
                    if self.torn.load(Ordering::Acquire) && src.len() > 1 {
                        self.inner.write_at(off, &src[..src.len() / 2])?;
                    }
                    warn!(target: "gbptree::io", off, "injected write failure");
                    return Err(Self::injected());
                }
                *remaining -= 1;
            }
        }
        self.inner.write_at(off, src)?;
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        if self.tripped() {
            return Err(Self::injected());
        }
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        if self.tripped() {
            return Err(Self::injected());
        }
        self.inner.truncate(len)
    }
}
