// Live stream recorder
//
// Polls every snapshot source concurrently for a fixed duration. Each source
// gets its own thread; decoding and scoring of fetched stills run on the shared
// worker pool. Failed fetches are skipped without advancing the frame counter.
// The duration is a wall-clock bound: a fetch still running at the deadline is
// abandoned and its result dropped.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::GrayImage;

use crate::constants::{RECORD_BUFFER_FACTOR, RECORD_INTERVALS};
use crate::error::{FramewiseError, Result};
use crate::jobs::pool::WorkerPool;
use crate::jobs::{is_cancelled, pause, recv_until, Received};

use super::fetch::SnapshotSource;
use super::{similarity, Frame, FrameBatch, ScoredFrame, MUST_KEEP};

/// Poll interval for a recording of `duration`.
pub fn poll_interval(duration: Duration) -> Duration {
    let secs = duration.as_secs();
    let millis = RECORD_INTERVALS
        .iter()
        .find(|(max_secs, _)| secs <= *max_secs)
        .map(|(_, interval)| *interval)
        .unwrap_or(RECORD_INTERVALS[RECORD_INTERVALS.len() - 1].1);
    Duration::from_millis(millis)
}

pub struct StreamRecorder {
    pool: Arc<WorkerPool>,
    cancel: Arc<AtomicBool>,
}

impl StreamRecorder {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop early when `cancel` is raised.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record every source for `duration`. Sources that produced no frames are
    /// left out of the result; the call fails only if none produced any.
    pub fn record(
        &self,
        sources: &[Arc<dyn SnapshotSource>],
        duration: Duration,
        max_frames: usize,
    ) -> Result<BTreeMap<String, FrameBatch>> {
        if sources.is_empty() {
            return Err(FramewiseError::Input("no snapshot sources to record".to_string()));
        }

        let cap = max_frames.max(1) * RECORD_BUFFER_FACTOR;
        let interval = poll_interval(duration);
        let started = Instant::now();
        log::info!(
            "Recording {} sources for {:?} every {:?}",
            sources.len(),
            duration,
            interval
        );

        let batches: Vec<FrameBatch> = std::thread::scope(|scope| {
            let handles: Vec<_> = sources
                .iter()
                .map(|source| {
                    scope.spawn(move || self.record_source(source, started, duration, interval, cap))
                })
                .collect();

            handles
                .into_iter()
                .zip(sources)
                .map(|(handle, source)| {
                    handle.join().unwrap_or_else(|_| {
                        log::error!("Recorder thread for {} panicked", source.name());
                        FrameBatch {
                            source: source.name().to_string(),
                            frames: Vec::new(),
                        }
                    })
                })
                .collect()
        });

        if is_cancelled(&self.cancel) {
            return Err(FramewiseError::Cancelled);
        }

        let mut recorded = BTreeMap::new();
        for batch in batches {
            if batch.is_empty() {
                log::warn!("No frames recorded from {}", batch.source);
                continue;
            }
            recorded.insert(batch.source.clone(), batch);
        }

        if recorded.is_empty() {
            return Err(FramewiseError::Fetch(format!(
                "no frames recorded from {} sources",
                sources.len()
            )));
        }
        Ok(recorded)
    }

    fn record_source(
        &self,
        source: &Arc<dyn SnapshotSource>,
        started: Instant,
        duration: Duration,
        interval: Duration,
        cap: usize,
    ) -> FrameBatch {
        let name = source.name().to_string();
        let deadline = started + duration;
        let mut frames: Vec<ScoredFrame> = Vec::new();
        let mut previous: Option<Arc<GrayImage>> = None;
        let mut iterations = 0u32;

        let fetcher = match Fetcher::spawn(Arc::clone(source)) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                log::error!("{}: cannot start fetcher: {}", name, e);
                return FrameBatch { source: name, frames };
            }
        };

        while Instant::now() < deadline && !is_cancelled(&self.cancel) {
            let iteration_start = Instant::now();

            match fetcher.fetch(deadline, &self.cancel) {
                Received::Item(Ok(bytes)) => {
                    let index = frames.len();
                    let position = started.elapsed().as_millis() as u64;
                    let label = name.clone();
                    let prev = previous.clone();

                    let scored = self
                        .pool
                        .submit(move || -> Result<ScoredFrame> {
                            let frame = Frame::decode(label, index, position, &bytes)?;
                            let dissimilarity = match prev {
                                Some(prev) => 1.0 - similarity::score(&prev, &frame.gray),
                                None => MUST_KEEP,
                            };
                            Ok(ScoredFrame { frame, dissimilarity })
                        })
                        .join()
                        .and_then(|r| r);

                    match scored {
                        Ok(frame) => {
                            previous = Some(Arc::clone(&frame.frame.gray));
                            frames.push(frame);
                            if frames.len() >= cap {
                                log::debug!("{}: buffer full at {} frames", name, cap);
                                break;
                            }
                        }
                        Err(e) => log::warn!("{}: skipping undecodable snapshot: {}", name, e),
                    }
                }
                Received::Item(Err(e)) => log::warn!("{}: snapshot fetch failed: {}", name, e),
                Received::Deadline => {
                    log::debug!("{}: fetch still running at the deadline, dropped", name);
                    break;
                }
                Received::Cancelled => break,
                Received::Closed => {
                    log::error!("{}: fetcher stopped", name);
                    break;
                }
            }

            // After the first pass, subtract time spent fetching from the next wait
            let wait = if iterations == 0 {
                interval
            } else {
                interval.saturating_sub(iteration_start.elapsed())
            };
            iterations += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !pause(wait.min(remaining), &self.cancel) {
                break;
            }
        }

        log::debug!("{}: recorded {} frames", name, frames.len());
        FrameBatch { source: name, frames }
    }
}

/// Runs one source's fetches on a detached thread so the recording can stop
/// waiting at its deadline. Dropping it abandons any fetch in flight.
struct Fetcher {
    requests: Sender<Instant>,
    results: Receiver<Result<Vec<u8>>>,
}

impl Fetcher {
    fn spawn(source: Arc<dyn SnapshotSource>) -> Result<Self> {
        let (requests, request_rx) = mpsc::channel::<Instant>();
        let (result_tx, results) = mpsc::channel();

        std::thread::Builder::new()
            .name("snapshot-fetch".into())
            .spawn(move || {
                for deadline in request_rx {
                    if result_tx.send(source.fetch_before(deadline)).is_err() {
                        return;
                    }
                }
            })?;

        Ok(Self { requests, results })
    }

    fn fetch(&self, deadline: Instant, cancel: &AtomicBool) -> Received<Result<Vec<u8>>> {
        if self.requests.send(deadline).is_err() {
            return Received::Closed;
        }
        recv_until(&self.results, Some(deadline), cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves pre-encoded stills; every `fail_every`-th fetch fails.
    struct ScriptedSource {
        name: String,
        stills: Vec<Vec<u8>>,
        calls: AtomicUsize,
        fail_every: Option<usize>,
    }

    impl SnapshotSource for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch(&self) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(n) = self.fail_every {
                if call % n == 0 {
                    return Err(FramewiseError::Fetch("camera offline".to_string()));
                }
            }
            Ok(self.stills[call % self.stills.len()].clone())
        }
    }

    fn still(shade: u8) -> Vec<u8> {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(32, 24, |x, _| {
            image::Rgb([shade.wrapping_add(x as u8 * 4), shade, 255 - shade])
        }));
        crate::media::encode::resize_and_encode(&image, 64).unwrap()
    }

    fn source(name: &str, fail_every: Option<usize>) -> Arc<dyn SnapshotSource> {
        Arc::new(ScriptedSource {
            name: name.to_string(),
            stills: vec![still(10), still(120), still(240)],
            calls: AtomicUsize::new(0),
            fail_every,
        })
    }

    #[test]
    fn test_poll_interval_table() {
        assert_eq!(poll_interval(Duration::from_secs(3)), Duration::from_millis(500));
        assert_eq!(poll_interval(Duration::from_secs(5)), Duration::from_millis(500));
        assert_eq!(poll_interval(Duration::from_secs(10)), Duration::from_millis(1000));
        assert_eq!(poll_interval(Duration::from_secs(20)), Duration::from_millis(2000));
        assert_eq!(poll_interval(Duration::from_secs(45)), Duration::from_millis(4000));
        assert_eq!(poll_interval(Duration::from_secs(600)), Duration::from_millis(6000));
    }

    #[test]
    fn test_records_each_source() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let recorder = StreamRecorder::new(pool);
        let sources = vec![source("garage", None), source("porch", None)];

        let batches = recorder.record(&sources, Duration::from_secs(2), 3).unwrap();
        assert_eq!(batches.len(), 2);
        for (name, batch) in &batches {
            assert!(!batch.is_empty(), "{} recorded nothing", name);
            assert!(batch.frames[0].is_must_keep());
            assert!(batch.frames.iter().skip(1).all(|f| !f.is_must_keep()));
            let indices: Vec<usize> = batch.frames.iter().map(|f| f.frame.index).collect();
            assert_eq!(indices, (0..batch.len()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_failed_fetches_do_not_advance_counter() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let recorder = StreamRecorder::new(pool);
        let sources = vec![source("flaky", Some(2))];

        let batches = recorder.record(&sources, Duration::from_secs(2), 3).unwrap();
        let batch = &batches["flaky"];
        let indices: Vec<usize> = batch.frames.iter().map(|f| f.frame.index).collect();
        assert_eq!(indices, (0..batch.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_all_sources_failing_is_fetch_error() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let recorder = StreamRecorder::new(pool);
        let sources = vec![source("dead", Some(1))];

        let err = recorder.record(&sources, Duration::from_secs(1), 3).unwrap_err();
        assert!(matches!(err, FramewiseError::Fetch(_)));
    }

    /// Answers only after `delay`, like a camera that hangs mid-request.
    struct StalledSource {
        delay: Duration,
    }

    impl SnapshotSource for StalledSource {
        fn name(&self) -> &str {
            "stalled"
        }

        fn fetch(&self) -> Result<Vec<u8>> {
            std::thread::sleep(self.delay);
            Ok(still(60))
        }
    }

    #[test]
    fn test_slow_fetch_does_not_outlast_duration() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let recorder = StreamRecorder::new(pool);
        let sources: Vec<Arc<dyn SnapshotSource>> = vec![
            source("garage", None),
            Arc::new(StalledSource {
                delay: Duration::from_secs(4),
            }),
        ];

        let started = Instant::now();
        let batches = recorder.record(&sources, Duration::from_secs(1), 3).unwrap();
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert!(batches.contains_key("garage"));
        assert!(!batches.contains_key("stalled"));
    }

    #[test]
    fn test_cancel_stops_recording() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let cancel = Arc::new(AtomicBool::new(true));
        let recorder = StreamRecorder::new(pool).with_cancel(cancel);

        let started = Instant::now();
        let err = recorder
            .record(&[source("cam", None)], Duration::from_secs(30), 3)
            .unwrap_err();
        assert!(matches!(err, FramewiseError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
