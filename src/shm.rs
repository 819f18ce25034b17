//! Named shared-memory segment used to carry the restore blob (C2
//! transport). Grounded on the same dup+unlink discipline the
//! `shm-snapshot`/`shm-restore` reference tools use around their
//! `SHM_SHARED_FD`, generalized from single-fd passing to a POSIX shm name.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, FromRawFd, OwnedFd};

use log::debug;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

/// Builds the shared-memory object name from spec §4.2: `/<prefix>_<pid>`.
pub fn blob_name(prefix: &str, writer_pid: u32) -> String {
    format!("/{prefix}_{writer_pid}")
}

/// The write-only side, created at restore-image-production time.
pub struct ShmWriter {
    file: File,
    name: String,
    written: u64,
}

impl ShmWriter {
    /// Creates the segment `0600`, write-only, failing if it already exists.
    /// Pre-sized to one page so a small blob's writes do not grow the
    /// segment one `write(2)` at a time; [`Drop`] truncates it back down to
    /// the bytes actually written, so the reader's `fstat`-based sizing
    /// (spec §4.2 "Read path") sees the real length rather than page padding.
    pub fn create(name: &str) -> io::Result<Self> {
        let fd: OwnedFd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(io::Error::from)?;
        ftruncate(&fd, page_size::get() as i64).map_err(io::Error::from)?;
        debug!("created restore blob segment {name}");
        Ok(Self {
            file: File::from(fd),
            name: name.to_owned(),
            written: 0,
        })
    }

    /// A single write error aborts the whole blob (spec §4.2 "Write path").
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmWriter {
    fn drop(&mut self) {
        let _ = ftruncate(self.file.as_fd(), self.written as i64);
    }
}

/// The read-only side, opened by the resurrected process.
pub struct ShmReader {
    file: File,
}

impl ShmReader {
    /// Opens the segment read-only and unlinks it immediately (spec §4.2:
    /// "opened read-only by the restored process, which unlinks it
    /// immediately after opening").
    pub fn open_and_unlink(name: &str) -> io::Result<Self> {
        let fd: OwnedFd = shm_open(name, OFlag::O_RDONLY, Mode::empty()).map_err(io::Error::from)?;
        let _ = shm_unlink(name);
        Ok(Self {
            file: File::from(fd),
        })
    }

    /// `fstat` to size the buffer, then read fully (spec §4.2 "Read path").
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let size = self.file.metadata()?.len() as usize;
        let mut buf = Vec::with_capacity(size);
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}
