// Snapshot sources and HTTP fetching with bounded retries

use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::constants::{FETCH_TIMEOUT_SECS, MAX_FETCH_BYTES};
use crate::error::{FramewiseError, Result};

/// A live camera or other producer of single JPEG stills.
pub trait SnapshotSource: Send + Sync {
    /// Display name, used for frame labels.
    fn name(&self) -> &str;

    /// Fetch one encoded still.
    fn fetch(&self) -> Result<Vec<u8>>;

    /// Fetch one still, giving up once `deadline` passes where the source can.
    fn fetch_before(&self, _deadline: Instant) -> Result<Vec<u8>> {
        self.fetch()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::constants::FETCH_ATTEMPTS,
            Duration::from_millis(crate::constants::FETCH_RETRY_DELAY_MS),
        )
    }
}

/// GET `url` with fixed-delay retries. The body must be non-empty.
pub fn fetch_url(url: &str, policy: &RetryPolicy) -> Result<Vec<u8>> {
    fetch_url_before(url, policy, None)
}

/// Like `fetch_url`, but no attempt or retry delay runs past `deadline`.
pub fn fetch_url_before(url: &str, policy: &RetryPolicy, deadline: Option<Instant>) -> Result<Vec<u8>> {
    let attempts = policy.attempts.max(1);
    let full_timeout = Duration::from_secs(FETCH_TIMEOUT_SECS);
    let mut last_error = "deadline passed before the first attempt".to_string();
    let mut tried = 0;

    for attempt in 1..=attempts {
        let timeout = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                remaining.min(full_timeout)
            }
            None => full_timeout,
        };

        tried = attempt;
        match fetch_once(url, timeout) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                log::warn!("Fetch {} failed (attempt {}/{}): {}", url, attempt, attempts, e);
                last_error = e;
            }
        }
        if attempt < attempts {
            let delay = match deadline {
                Some(deadline) => policy.delay.min(deadline.saturating_duration_since(Instant::now())),
                None => policy.delay,
            };
            std::thread::sleep(delay);
        }
    }

    Err(FramewiseError::Fetch(format!(
        "{} after {} attempts: {}",
        url, tried, last_error
    )))
}

fn fetch_once(url: &str, timeout: Duration) -> std::result::Result<Vec<u8>, String> {
    let response = ureq::get(url)
        .timeout(timeout)
        .call()
        .map_err(|e| e.to_string())?;

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_FETCH_BYTES)
        .read_to_end(&mut bytes)
        .map_err(|e| format!("read body: {}", e))?;

    if bytes.is_empty() {
        return Err("empty response body".to_string());
    }
    Ok(bytes)
}

/// Snapshot endpoint reached over HTTP.
pub struct HttpSnapshotSource {
    name: String,
    url: String,
    policy: RetryPolicy,
}

impl HttpSnapshotSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            policy,
        }
    }
}

impl SnapshotSource for HttpSnapshotSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        fetch_url(&self.url, &self.policy)
    }

    fn fetch_before(&self, deadline: Instant) -> Result<Vec<u8>> {
        fetch_url_before(&self.url, &self.policy, Some(deadline))
    }
}

/// Still image on disk that is re-read on every fetch (e.g. a file a camera overwrites).
pub struct FileSnapshotSource {
    name: String,
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            FramewiseError::Fetch(format!("{}: {}", self.path.display(), e))
        })?;
        if bytes.is_empty() {
            return Err(FramewiseError::Fetch(format!("{}: empty file", self.path.display())));
        }
        Ok(bytes)
    }
}
