// Ingestion pipeline
//
// Processes every input of a request concurrently and concatenates their
// encoded frames in input order. The first failing input cancels the rest and
// its error is reported with the input's name attached.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use crate::config::Settings;
use crate::constants::{IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use crate::error::{FramewiseError, Result};
use crate::jobs::pool::WorkerPool;
use crate::jobs::{is_cancelled, recv_until, Received};
use crate::timeline::gc::{PendingSnapshot, SnapshotRegistry};

use super::decoder::{DecoderOptions, FrameDecoder, VideoSource};
use super::encode::{archive_snapshot, resize_and_encode, snapshot_file_name};
use super::fetch::{fetch_url, RetryPolicy, SnapshotSource};
use super::recorder::StreamRecorder;
use super::{keyframes, EncodedFrame, Frame, FrameBatch, ScoredFrame};

/// One thing to extract frames from.
pub enum MediaInput {
    ImageFile(PathBuf),
    ImageUrl(String),
    /// A single still from a live source
    Snapshot(Arc<dyn SnapshotSource>),
    VideoFile(PathBuf),
    VideoUrl(String),
    VideoBytes { name: String, bytes: Vec<u8> },
    /// Poll live sources for a while and keep the most distinct stills
    Recording {
        sources: Vec<Arc<dyn SnapshotSource>>,
        duration: Duration,
    },
}

impl MediaInput {
    /// Name used in labels and error messages.
    pub fn describe(&self) -> String {
        match self {
            MediaInput::ImageFile(path) | MediaInput::VideoFile(path) => file_name(path),
            MediaInput::ImageUrl(url) | MediaInput::VideoUrl(url) => url.clone(),
            MediaInput::Snapshot(source) => source.name().to_string(),
            MediaInput::VideoBytes { name, .. } => name.clone(),
            MediaInput::Recording { sources, .. } => {
                let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
                format!("recording of {}", names.join(", "))
            }
        }
    }
}

impl MediaInput {
    /// Pick an input kind for a path or URL from its extension.
    pub fn from_location(location: &str) -> Result<Self> {
        let is_url = location.starts_with("http://") || location.starts_with("https://");
        let path = if is_url {
            location.split(['?', '#']).next().unwrap_or(location)
        } else {
            location
        };
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let input = if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            if is_url {
                MediaInput::ImageUrl(location.to_string())
            } else {
                MediaInput::ImageFile(PathBuf::from(location))
            }
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            if is_url {
                MediaInput::VideoUrl(location.to_string())
            } else {
                MediaInput::VideoFile(PathBuf::from(location))
            }
        } else {
            return Err(FramewiseError::Input(format!(
                "cannot tell whether {} is an image or a video",
                location
            )));
        };
        Ok(input)
    }
}

impl std::fmt::Debug for MediaInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MediaInput({})", self.describe())
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Frames kept per video or recording input
    pub max_frames: usize,
    pub target_width: u32,
    /// Put source names in frame labels
    pub include_filename: bool,
    /// Archive the first emitted frame into the snapshot directory
    pub expose_snapshot: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_frames: crate::constants::DEFAULT_MAX_FRAMES,
            target_width: crate::constants::DEFAULT_TARGET_WIDTH,
            include_filename: false,
            expose_snapshot: false,
        }
    }
}

impl IngestOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_frames: settings.max_frames,
            target_width: settings.target_width,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct IngestOutput {
    pub frames: Vec<EncodedFrame>,
    /// Archived copy of the first frame, when requested
    pub key_frame: Option<PathBuf>,
    // Keeps the sweeper off key_frame until this output is dropped
    pending: Option<PendingSnapshot>,
}

impl IngestOutput {
    /// True while the archived key frame is protected from the sweeper.
    pub fn holds_key_frame(&self) -> bool {
        self.pending.is_some()
    }
}

pub struct MediaPipeline {
    pool: Arc<WorkerPool>,
    decoder: FrameDecoder,
    fetch_policy: RetryPolicy,
    work_root: PathBuf,
    snapshot_dir: PathBuf,
    snapshots: Arc<SnapshotRegistry>,
}

impl MediaPipeline {
    pub fn new(settings: &Settings) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(settings.worker_threads)?);
        let decoder = FrameDecoder::new(DecoderOptions {
            program: crate::tools::ffmpeg_path(),
            timeout: settings.decoder_timeout(),
            max_frames: settings.max_decoded_frames,
        });

        Ok(Self {
            pool,
            decoder,
            fetch_policy: RetryPolicy::new(settings.fetch_attempts, settings.fetch_retry_delay()),
            work_root: settings.work_dir(),
            snapshot_dir: settings.snapshot_dir(),
            snapshots: Arc::new(SnapshotRegistry::new()),
        })
    }

    pub fn with_decoder(mut self, decoder: FrameDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Share the pending set of the timeline that will link archived key frames.
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotRegistry>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn fetch_policy(&self) -> RetryPolicy {
        self.fetch_policy
    }

    /// Turn `inputs` into encoded frames, in input order.
    pub fn process(&self, inputs: &[MediaInput], options: &IngestOptions) -> Result<IngestOutput> {
        if inputs.is_empty() {
            return Err(FramewiseError::Input("no media inputs provided".to_string()));
        }
        if options.target_width == 0 {
            return Err(FramewiseError::Input("target width must be positive".to_string()));
        }

        let work = WorkArea::create(&self.work_root)?;
        let cancel = Arc::new(AtomicBool::new(false));

        let results: Vec<Result<Vec<EncodedFrame>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .iter()
                .map(|input| {
                    let work = &work;
                    let cancel = &cancel;
                    scope.spawn(move || {
                        let result = self.process_input(input, options, work, cancel);
                        if result.is_err() {
                            cancel.store(true, Ordering::Relaxed);
                        }
                        result.map_err(|e| e.for_input(input.describe()))
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(FramewiseError::Worker("input thread panicked".to_string()))
                    })
                })
                .collect()
        });

        let mut frames = Vec::new();
        let mut cancelled = None;
        for result in results {
            match result {
                Ok(encoded) => frames.extend(encoded),
                Err(e) if matches!(e.root(), FramewiseError::Cancelled) => {
                    cancelled.get_or_insert(e);
                }
                // The input that actually failed, not one it cancelled
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = cancelled {
            return Err(e);
        }

        let (key_frame, pending) = match frames.first() {
            Some(first) if options.expose_snapshot => {
                let uuid = Uuid::new_v4().simple().to_string();
                let prefix = &uuid[..8];
                // Held before the file exists so a sweep never sees it unprotected
                let pending = self.snapshots.hold(&snapshot_file_name(prefix, 0));
                let path = archive_snapshot(&first.payload, &self.snapshot_dir, prefix, 0)?;
                (Some(path), Some(pending))
            }
            _ => (None, None),
        };

        log::info!("Ingested {} inputs into {} frames", inputs.len(), frames.len());
        Ok(IngestOutput {
            frames,
            key_frame,
            pending,
        })
    }

    fn process_input(
        &self,
        input: &MediaInput,
        options: &IngestOptions,
        work: &WorkArea,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Vec<EncodedFrame>> {
        if is_cancelled(cancel) {
            return Err(FramewiseError::Cancelled);
        }

        match input {
            MediaInput::ImageFile(path) => {
                let bytes = read_input_file(path)?;
                let label = still_label(options, file_stem(path));
                self.encode_still(bytes, label, options)
            }
            MediaInput::ImageUrl(url) => {
                let bytes = self.fetch_url_cancellable(url, cancel)?;
                let label = still_label(options, url_stem(url));
                self.encode_still(bytes, label, options)
            }
            MediaInput::Snapshot(source) => {
                let source = Arc::clone(source);
                let bytes = fetch_cancellable(cancel, move || source.fetch())?;
                let label = still_label(options, input.describe());
                self.encode_still(bytes, label, options)
            }
            MediaInput::VideoFile(path) => {
                if !path.is_file() {
                    return Err(FramewiseError::Input(format!(
                        "file does not exist: {}",
                        path.display()
                    )));
                }
                self.encode_video(VideoSource::Path(path), &file_name(path), options, cancel)
            }
            MediaInput::VideoUrl(url) => {
                let bytes = self.fetch_url_cancellable(url, cancel)?;
                // Containers like mp4 need a seekable input
                let path = work.path().join(format!("{}.video", Uuid::new_v4().simple()));
                std::fs::write(&path, &bytes)?;
                self.encode_video(VideoSource::Path(&path), url, options, cancel)
            }
            MediaInput::VideoBytes { name, bytes } => {
                self.encode_video(VideoSource::Bytes(bytes), name, options, cancel)
            }
            MediaInput::Recording { sources, duration } => {
                let recorder = StreamRecorder::new(Arc::clone(&self.pool)).with_cancel(Arc::clone(cancel));
                let batches = recorder.record(sources, *duration, options.max_frames)?;
                let selected = keyframes::select(batches.into_values().collect(), options.max_frames);
                self.encode_selected(selected, options, cancel, |k, frame| {
                    if options.include_filename {
                        format!("{} (frame {})", frame.source, k)
                    } else {
                        format!("Frame {}", k)
                    }
                })
            }
        }
    }

    fn fetch_url_cancellable(&self, url: &str, cancel: &AtomicBool) -> Result<Vec<u8>> {
        let url = url.to_string();
        let policy = self.fetch_policy;
        fetch_cancellable(cancel, move || fetch_url(&url, &policy))
    }

    fn encode_still(&self, bytes: Vec<u8>, label: String, options: &IngestOptions) -> Result<Vec<EncodedFrame>> {
        let width = options.target_width;
        let payload = self
            .pool
            .submit(move || -> Result<Vec<u8>> {
                let image = image::load_from_memory(&bytes)?;
                resize_and_encode(&image, width)
            })
            .join()
            .and_then(|r| r)?;

        Ok(vec![EncodedFrame {
            label,
            payload,
            target_width: width,
        }])
    }

    fn encode_video(
        &self,
        source: VideoSource<'_>,
        name: &str,
        options: &IngestOptions,
        cancel: &AtomicBool,
    ) -> Result<Vec<EncodedFrame>> {
        let stills = self.decoder.decode_with_cancel(source, cancel)?;
        if is_cancelled(cancel) {
            return Err(FramewiseError::Cancelled);
        }

        let decoded = {
            let name = name.to_string();
            self.pool.map(stills.into_iter().enumerate().collect(), move |(i, bytes): (usize, Vec<u8>)| {
                match Frame::decode(name.clone(), i, i as u64, &bytes) {
                    Ok(frame) => Ok(Some(frame)),
                    Err(e) => {
                        log::warn!("{}: skipping undecodable frame {}: {}", name, i, e);
                        Ok(None)
                    }
                }
            })?
        };

        let frames: Vec<Frame> = decoded
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(index, mut frame)| {
                frame.index = index;
                frame
            })
            .collect();
        if frames.is_empty() {
            return Err(FramewiseError::Decode("no usable frames".to_string()));
        }
        log::debug!("{}: decoded {} key frames", name, frames.len());

        let batch = FrameBatch::score(&self.pool, name, frames)?;
        let selected = keyframes::select(vec![batch], options.max_frames);

        self.encode_selected(selected, options, cancel, |k, frame| {
            if options.include_filename {
                format!("{} (frame {})", frame.source, k)
            } else {
                format!("Video frame {}", k)
            }
        })
    }

    /// Encode selected frames on the pool; `label` gets the 1-based ordinal.
    fn encode_selected(
        &self,
        selected: Vec<ScoredFrame>,
        options: &IngestOptions,
        cancel: &AtomicBool,
        label: impl Fn(usize, &Frame) -> String,
    ) -> Result<Vec<EncodedFrame>> {
        if is_cancelled(cancel) {
            return Err(FramewiseError::Cancelled);
        }

        let labels: Vec<String> = selected
            .iter()
            .enumerate()
            .map(|(i, scored)| label(i + 1, &scored.frame))
            .collect();

        let width = options.target_width;
        let payloads = self.pool.map(selected, move |scored: ScoredFrame| {
            resize_and_encode(&scored.frame.image, width)
        })?;

        Ok(labels
            .into_iter()
            .zip(payloads)
            .map(|(label, payload)| EncodedFrame {
                label,
                payload,
                target_width: width,
            })
            .collect())
    }
}

/// Run a blocking fetch on a detached thread and stop waiting once `cancel`
/// is raised. An abandoned fetch finishes in the background and is dropped.
fn fetch_cancellable(
    cancel: &AtomicBool,
    fetch: impl FnOnce() -> Result<Vec<u8>> + Send + 'static,
) -> Result<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("input-fetch".into())
        .spawn(move || {
            let _ = tx.send(fetch());
        })?;

    match recv_until(&rx, None, cancel) {
        Received::Item(result) => result,
        Received::Cancelled => Err(FramewiseError::Cancelled),
        Received::Deadline | Received::Closed => {
            Err(FramewiseError::Worker("fetch thread ended without a result".to_string()))
        }
    }
}

/// Per-call scratch directory under the work root, removed on drop.
struct WorkArea {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl WorkArea {
    fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("ingest-").tempdir_in(root)?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                log::warn!("Failed to remove work area {}: {}", self.path.display(), e);
            }
        }
    }
}

fn read_input_file(path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(FramewiseError::Input(format!(
            "file does not exist: {}",
            path.display()
        )));
    }
    Ok(std::fs::read(path)?)
}

fn still_label(options: &IngestOptions, name: String) -> String {
    if options.include_filename {
        name
    } else {
        String::new()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn url_stem(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    file_stem(Path::new(last))
}
