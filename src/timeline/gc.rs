// Snapshot garbage collection
//
// Removes files in the snapshot directory that no event references. A file is
// protected while it is linked by a row, while a create() that names it is in
// flight (the pending set), or while it is younger than the grace period.
// Releasing a pending name waits for any running sweep, so a sweep never sees
// a name leave the pending set before the row that links it is visible.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::error::Result;

use super::schema::basename;

/// Anything that can report the snapshot names its rows reference.
pub trait LinkedSnapshots {
    /// Lowercased basenames of every referenced snapshot.
    fn linked_basenames(&self) -> Result<HashSet<String>>;
}

/// Shared between the store, the collector and any pipeline archiving into
/// the same directory. Holds are counted, so one name can be held twice.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    pending: Mutex<HashMap<String, usize>>,
    sweep_lock: Mutex<()>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key_frame` as in flight until the returned guard drops.
    pub fn hold(self: &Arc<Self>, key_frame: &str) -> PendingSnapshot {
        let name = basename(key_frame);
        if let Some(name) = &name {
            *lock(&self.pending).entry(name.clone()).or_insert(0) += 1;
        }
        PendingSnapshot {
            registry: Arc::clone(self),
            name,
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        lock(&self.pending).contains_key(name)
    }
}

// Both guarded values stay consistent even if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Keeps a snapshot name in the pending set.
#[derive(Debug)]
pub struct PendingSnapshot {
    registry: Arc<SnapshotRegistry>,
    name: Option<String>,
}

impl Drop for PendingSnapshot {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            let _sweep = lock(&self.registry.sweep_lock);
            let mut pending = lock(&self.registry.pending);
            if let Some(count) = pending.get_mut(&name) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(&name);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub protected: usize,
    pub too_recent: usize,
    pub failed: usize,
}

pub struct SnapshotGc {
    dir: PathBuf,
    registry: Arc<SnapshotRegistry>,
    grace: Duration,
}

impl SnapshotGc {
    pub fn new(dir: impl Into<PathBuf>, registry: Arc<SnapshotRegistry>, grace: Duration) -> Self {
        Self {
            dir: dir.into(),
            registry,
            grace,
        }
    }

    /// Delete every unprotected file directly inside the snapshot directory.
    /// A failure on one file is logged and the sweep continues.
    pub fn sweep(&self, linked: &dyn LinkedSnapshots) -> Result<SweepReport> {
        let _sweep = lock(&self.registry.sweep_lock);
        let mut report = SweepReport::default();

        if !self.dir.is_dir() {
            return Ok(report);
        }

        let linked = linked.linked_basenames()?;
        let now = SystemTime::now();

        for entry in walkdir::WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Snapshot sweep: cannot read entry: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            report.scanned += 1;

            let name = entry.file_name().to_string_lossy().to_lowercase();
            if linked.contains(&name) || self.registry.is_pending(&name) {
                report.protected += 1;
                continue;
            }

            if self.is_recent(entry.path(), now) {
                report.too_recent += 1;
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    log::debug!("Removed orphaned snapshot {}", entry.path().display());
                    report.removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Failed to remove {}: {}", entry.path().display(), e);
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            log::info!(
                "Snapshot sweep removed {} of {} files ({} failed)",
                report.removed,
                report.scanned,
                report.failed
            );
        }
        Ok(report)
    }

    fn is_recent(&self, path: &Path, now: SystemTime) -> bool {
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            // Unknown age counts as fresh
            Err(_) => return true,
        };
        match now.duration_since(modified) {
            Ok(age) => age < self.grace,
            // Modified in the future
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    struct Linked(HashSet<String>);

    impl LinkedSnapshots for Linked {
        fn linked_basenames(&self) -> Result<HashSet<String>> {
            Ok(self.0.clone())
        }
    }

    fn linked(names: &[&str]) -> Linked {
        Linked(names.iter().map(|n| n.to_string()).collect())
    }

    fn old_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"jpeg").unwrap();
        let an_hour_ago = FileTime::from_unix_time(FileTime::now().unix_seconds() - 3600, 0);
        filetime::set_file_mtime(&path, an_hour_ago).unwrap();
        path
    }

    fn collector(dir: &Path, registry: &Arc<SnapshotRegistry>) -> SnapshotGc {
        SnapshotGc::new(dir, Arc::clone(registry), Duration::from_secs(10))
    }

    #[test]
    fn test_orphans_removed_linked_kept() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SnapshotRegistry::new());
        let kept = old_file(dir.path(), "Linked-0.JPG");
        let orphan = old_file(dir.path(), "orphan-0.jpg");

        let report = collector(dir.path(), &registry)
            .sweep(&linked(&["linked-0.jpg"]))
            .unwrap();

        assert!(kept.exists());
        assert!(!orphan.exists());
        assert_eq!(report.removed, 1);
        assert_eq!(report.protected, 1);
    }

    #[test]
    fn test_pending_name_is_protected_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SnapshotRegistry::new());
        let file = old_file(dir.path(), "abc-0.jpg");
        let gc = collector(dir.path(), &registry);

        let guard = registry.hold(&file.to_string_lossy());
        gc.sweep(&linked(&[])).unwrap();
        assert!(file.exists());

        drop(guard);
        assert!(!registry.is_pending("abc-0.jpg"));
        gc.sweep(&linked(&[])).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_nested_holds_release_on_last_drop() {
        let registry = Arc::new(SnapshotRegistry::new());
        let archive = registry.hold("/snapshots/Shared-0.jpg");
        let create = registry.hold("shared-0.jpg");

        drop(create);
        assert!(registry.is_pending("shared-0.jpg"));
        drop(archive);
        assert!(!registry.is_pending("shared-0.jpg"));
    }

    #[test]
    fn test_recent_files_survive_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SnapshotRegistry::new());
        let fresh = dir.path().join("fresh-0.jpg");
        std::fs::write(&fresh, b"jpeg").unwrap();

        let report = collector(dir.path(), &registry).sweep(&linked(&[])).unwrap();
        assert!(fresh.exists());
        assert_eq!(report.too_recent, 1);
    }

    #[test]
    fn test_subdirectories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SnapshotRegistry::new());
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        let inner = old_file(&nested, "inner.jpg");

        let report = collector(dir.path(), &registry).sweep(&linked(&[])).unwrap();
        assert!(inner.exists());
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn test_missing_directory_is_empty_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SnapshotRegistry::new());
        let gc = collector(&dir.path().join("absent"), &registry);
        assert_eq!(gc.sweep(&linked(&[])).unwrap(), SweepReport::default());
    }

    #[test]
    fn test_release_waits_for_running_sweep() {
        let registry = Arc::new(SnapshotRegistry::new());
        let guard = registry.hold("/snapshots/slow-0.jpg");

        let sweep_guard = lock(&registry.sweep_lock);
        let releaser = std::thread::spawn(move || drop(guard));
        std::thread::sleep(Duration::from_millis(100));
        assert!(registry.is_pending("slow-0.jpg"));

        drop(sweep_guard);
        releaser.join().unwrap();
        assert!(!registry.is_pending("slow-0.jpg"));
    }
}
