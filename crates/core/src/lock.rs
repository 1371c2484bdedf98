use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use fs2::FileExt;
use tracing::{debug, info, warn};

/// Two-level execution lock: an in-process flag, then an OS file lock that
/// excludes other instances. Never blocks.
pub struct LockManager {
    path: PathBuf,
    held: AtomicBool,
    file: Mutex<Option<File>>,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), held: AtomicBool::new(false), file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `false` right away when either level is already held.
    pub fn try_acquire(&self) -> bool {
        if self.held.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("execution lock held in this process");
            return false;
        }
        match open_exclusive(&self.path) {
            Ok(Some(file)) => {
                *self.file.lock().unwrap() = Some(file);
                debug!(path = %self.path.display(), "execution lock acquired");
                true
            }
            Ok(None) => {
                self.held.store(false, Ordering::Release);
                info!(path = %self.path.display(), "execution lock held by another instance");
                false
            }
            Err(e) => {
                self.held.store(false, Ordering::Release);
                warn!(path = %self.path.display(), error = %e, "cannot open lock file");
                false
            }
        }
    }

    pub fn release(&self) {
        if let Some(file) = self.file.lock().unwrap().take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "unlock failed, closing handle");
            }
            drop(file);
            debug!(path = %self.path.display(), "execution lock released");
        }
        self.held.store(false, Ordering::Release);
    }

    /// Acquire and release on drop, so every exit path of the guarded work
    /// gives the lock back.
    pub fn guard(&self) -> Option<ExecutionGuard<'_>> {
        self.try_acquire().then_some(ExecutionGuard { lock: self })
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct ExecutionGuard<'a> {
    lock: &'a LockManager,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

fn stamp_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

/// Opens the lock file and takes a non-blocking exclusive lock on it.
/// `Ok(None)` when another handle holds it.
fn open_exclusive(path: &Path) -> io::Result<Option<File>> {
    create_parent(path)?;
    let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
    // qualified: newer std has inherent lock methods with another error type
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            stamp_pid(&mut file)?;
            Ok(Some(file))
        }
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
