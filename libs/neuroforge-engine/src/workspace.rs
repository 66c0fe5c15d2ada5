// Host-side workspace allocation. One exclusive directory per execution,
// removed when the lease drops.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Process-wide allocator for per-execution staging directories.
///
/// The active count and the uuid-named directories are the only shared state
/// between concurrent executions; everything else is exclusively owned.
#[derive(Debug, Clone)]
pub struct WorkspaceAllocator {
    root: PathBuf,
    active: Arc<AtomicUsize>,
}

impl WorkspaceAllocator {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Allocate a fresh exclusive directory. Uuid naming makes collisions
    /// between concurrent executions unrepresentable.
    pub fn allocate(&self) -> io::Result<WorkspaceLease> {
        let path = self.root.join(Uuid::new_v4().to_string());
        fs::create_dir(&path)?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(WorkspaceLease {
            path,
            active: Arc::clone(&self.active),
        })
    }

    /// Workspaces currently leased out.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Exclusive ownership of one workspace directory. Dropping the lease removes
/// the directory and releases the allocation count, regardless of how the
/// execution ended.
#[derive(Debug)]
pub struct WorkspaceLease {
    path: PathBuf,
    active: Arc<AtomicUsize>,
}

impl WorkspaceLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Materialize the submitted source under this workspace.
    pub fn write_source(&self, file_name: &str, code: &str) -> io::Result<PathBuf> {
        let target = self.path.join(file_name);
        fs::write(&target, code)?;
        Ok(target)
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
