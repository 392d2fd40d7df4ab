/// The external `MappedRegion` collaborator: owns the backing file and its
/// mmap, and arbitrates the one-time creator-exclusion window that lets
/// exactly one opener run the fresh-region initialization protocol.
///
/// This module does not know about `Header`/`HashSlot`/`Bucket` layout;
/// `super::map` is the only caller that interprets the mapped bytes.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use memmap2::MmapMut;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A contiguous byte region backed by a single memory-mapped file.
pub struct MappedRegion {
    mmap: MmapMut,
    #[allow(dead_code)]
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

impl MappedRegion {
    /// Open or create the backing file at `path`, sized to exactly `size`
    /// bytes on first creation, and map it.
    ///
    /// Acquires the boot-time creator-exclusion lock before touching the
    /// file's length, polling for up to `wait` before giving up with an
    /// `ErrorKind::TimedOut` I/O error. Returns the region plus a one-shot
    /// unlock closure; the caller must invoke it exactly once, after
    /// finishing (or validating) initialization.
    pub fn open(path: &Path, size: u64, wait: Duration) -> io::Result<(Self, impl FnOnce() -> io::Result<()>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        Self::acquire_boot_lock(&file, wait)?;

        // `< size` rather than `== 0`: a prior creator may have crashed
        // after sizing the file but before publishing `cap`, or this
        // opener may have been constructed with a larger layout than
        // what's currently on disk. `set_len` to a larger value only
        // zero-extends an existing file; it never truncates or disturbs
        // bytes already written, so re-checking here is safe even when
        // the file already holds a valid, fully initialized region.
        let current_len = file.metadata()?.len();
        if current_len < size {
            file.set_len(size)?;
        }

        // Safety: the file was just opened (or created) by this process and
        // is sized either by us above, or by a prior successful `Create`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let unlock_file = file.try_clone()?;
        let unlock = move || -> io::Result<()> { FileExt::unlock(&unlock_file) };

        Ok((
            MappedRegion {
                mmap,
                path: path.to_path_buf(),
                file,
            },
            unlock,
        ))
    }

    fn acquire_boot_lock(file: &File, wait: Duration) -> io::Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(()),
                Err(_) if Instant::now() < deadline => thread::sleep(LOCK_POLL_INTERVAL),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for map boot lock",
                    ))
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn base_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }
}

// The region is shared across threads (and, via the backing file, across
// processes); all mutation of its contents goes through the atomic /
// chain-lock protocol layered on top by `Map`.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}
