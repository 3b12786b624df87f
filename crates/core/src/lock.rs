//! Per-working-directory mutual exclusion.
//!
//! A working copy has exactly one checked-out branch, so every operation
//! that checks out or writes tracked files must be serialized against all
//! other operations on the same directory, including ones issued through a
//! different [`Collection`](crate::Collection) handle for the same user.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Mutex as AsyncMutex;

/// Lock shared by all handles on one working directory.
pub type WorkdirLock = Arc<AsyncMutex<()>>;

fn registry() -> &'static Mutex<HashMap<PathBuf, WorkdirLock>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, WorkdirLock>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Normalize a path so `root/./u1` and `root/u1` share one lock.
fn lock_key(dir: &Path) -> PathBuf {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(dir))
            .unwrap_or_else(|_| dir.to_path_buf())
    };
    absolute.components().collect()
}

/// Return the lock for `dir`, creating it on first use.
pub fn workdir_lock(dir: &Path) -> WorkdirLock {
    let key = lock_key(dir);
    let mut locks = registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(key)
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}
