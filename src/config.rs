// Runtime settings
// Loaded from a JSON document. A missing file means defaults; a malformed one
// is reported as a config error and also falls back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::FramewiseError;

pub const CONFIG_ENV: &str = "FRAMEWISE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/snapshots`
    pub snapshot_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/work`
    pub work_dir: Option<PathBuf>,
    pub retention_days: u32,
    pub language: String,
    pub lexicon_dir: Option<PathBuf>,
    pub default_utc_offset_minutes: i32,
    pub legacy_snapshot_dirs: Vec<PathBuf>,
    /// Defaults to `<data_dir>/events.json`
    pub legacy_events_file: Option<PathBuf>,
    pub worker_threads: usize,
    pub decoder_timeout_secs: u64,
    pub max_decoded_frames: usize,
    pub target_width: u32,
    pub max_frames: usize,
    pub gc_grace_secs: u64,
    pub gc_interval_secs: u64,
    pub fetch_attempts: u32,
    pub fetch_retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_dir: None,
            work_dir: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            language: DEFAULT_LANGUAGE.to_string(),
            lexicon_dir: None,
            default_utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            legacy_snapshot_dirs: Vec::new(),
            legacy_events_file: None,
            worker_threads: default_worker_threads(),
            decoder_timeout_secs: DECODER_TIMEOUT_SECS,
            max_decoded_frames: MAX_DECODED_FRAMES,
            target_width: DEFAULT_TARGET_WIDTH,
            max_frames: DEFAULT_MAX_FRAMES,
            gc_grace_secs: GC_GRACE_SECS,
            gc_interval_secs: GC_INTERVAL_SECS,
            fetch_attempts: FETCH_ATTEMPTS,
            fetch_retry_delay_ms: FETCH_RETRY_DELAY_MS,
        }
    }
}

impl Settings {
    /// Settings rooted at an explicit data directory (used by tests and `--data-dir`).
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from `path`, or from `$FRAMEWISE_CONFIG` when no path is given.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        };

        let Some(path) = path else {
            return Self::default();
        };

        match Self::read(&path) {
            Ok(Some(settings)) => settings,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    /// Strict variant of `load`: Ok(None) when the file does not exist.
    pub fn read(path: &Path) -> std::result::Result<Option<Self>, FramewiseError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            FramewiseError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| FramewiseError::Config(format!("malformed {}: {}", path.display(), e)))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILENAME)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(SNAPSHOTS_FOLDER))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(WORK_FOLDER))
    }

    pub fn legacy_events_file(&self) -> PathBuf {
        self.legacy_events_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(LEGACY_EVENTS_FILENAME))
    }

    pub fn decoder_timeout(&self) -> Duration {
        Duration::from_secs(self.decoder_timeout_secs)
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_secs(self.gc_grace_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }
}

/// Platform data directory, or `./framewise-data` when none can be determined.
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "framewise")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(DATA_FOLDER))
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(MAX_WORKER_THREADS)
}
