// Snapshot sweeper -- runs the snapshot collector on a fixed interval.
//
// One thread per timeline. Each cycle runs a single sweep; a failed or
// panicking sweep is logged and the loop carries on. Stopping raises the
// cancel flag and joins the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{FramewiseError, Result};
use crate::timeline::Timeline;

use super::pause;

pub struct SweeperHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the loop and wait for the current sweep to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Snapshot sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the sweeper. The first sweep runs after one interval.
pub fn spawn_sweeper(timeline: Arc<Timeline>, interval: Duration) -> Result<SweeperHandle> {
    if interval.is_zero() {
        return Err(FramewiseError::Config("sweep interval must be positive".to_string()));
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let thread = std::thread::Builder::new()
        .name("snapshot-sweeper".into())
        .spawn(move || sweeper_loop(&timeline, interval, &flag))?;

    log::info!("Snapshot sweeper started (every {}s)", interval.as_secs());
    Ok(SweeperHandle {
        cancel,
        thread: Some(thread),
    })
}

fn sweeper_loop(timeline: &Timeline, interval: Duration, cancel: &AtomicBool) {
    while pause(interval, cancel) {
        // Catch panics so the thread never dies
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            timeline.sweep_snapshots()
        }));

        match result {
            Ok(Ok(report)) => {
                log::debug!(
                    "Snapshot sweep: {} scanned, {} removed, {} protected",
                    report.scanned,
                    report.removed,
                    report.protected
                );
            }
            Ok(Err(e)) => log::error!("Snapshot sweep failed: {}", e),
            Err(_) => log::error!("Snapshot sweep panicked (recovered)"),
        }
    }
    log::debug!("Snapshot sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::timeline::lexicon::Lexicon;
    use filetime::FileTime;
    use std::time::Instant;

    fn timeline(root: &std::path::Path) -> Arc<Timeline> {
        let mut settings = Settings::with_data_dir(root);
        settings.gc_grace_secs = 1;
        Arc::new(Timeline::open_with_lexicon(&settings, Lexicon::builtin("en")).unwrap())
    }

    #[test]
    fn test_sweeper_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let timeline = timeline(dir.path());
        let orphan = timeline.snapshot_dir().join("orphan-0.jpg");
        std::fs::write(&orphan, b"jpeg").unwrap();
        let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 3600, 0);
        filetime::set_file_mtime(&orphan, old).unwrap();

        let handle = spawn_sweeper(Arc::clone(&timeline), Duration::from_millis(50)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while orphan.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        handle.stop();

        assert!(!orphan.exists());
    }

    #[test]
    fn test_stop_is_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_sweeper(timeline(dir.path()), Duration::from_secs(3600)).unwrap();
        assert!(handle.is_running());

        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            spawn_sweeper(timeline(dir.path()), Duration::ZERO),
            Err(FramewiseError::Config(_))
        ));
    }
}
