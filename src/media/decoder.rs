// Video frame decoder
//
// Runs ffmpeg as a subprocess that emits key frames as a concatenated MJPEG
// stream on stdout. Frames are split on JPEG SOI/EOI markers as they arrive.
// Decoding stops at a wall-clock deadline, a frame cap or a raised cancel
// flag; the child is killed in each case. Pipe threads are detached, so a
// process still holding a pipe cannot stall the call.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::constants::{DECODER_READ_CHUNK, DECODER_TIMEOUT_SECS, MAX_DECODED_FRAMES, MAX_JPEG_BYTES};
use crate::error::{FramewiseError, Result};
use crate::jobs::{is_cancelled, recv_until, Received};

// How long to wait for the decoder's stderr once it has exited
const STDERR_GRACE: Duration = Duration::from_secs(1);

/// Where the decoder reads video from.
#[derive(Debug, Clone, Copy)]
pub enum VideoSource<'a> {
    Path(&'a Path),
    /// Fed to the decoder's stdin
    Bytes(&'a [u8]),
}

#[derive(Debug, Clone)]
pub struct DecoderOptions {
    pub program: PathBuf,
    pub timeout: Duration,
    pub max_frames: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            program: crate::tools::ffmpeg_path(),
            timeout: Duration::from_secs(DECODER_TIMEOUT_SECS),
            max_frames: MAX_DECODED_FRAMES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Deadline,
    FrameCap,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    options: DecoderOptions,
}

impl FrameDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self { options }
    }

    /// ffmpeg arguments: key frames only, no audio, MJPEG on stdout.
    pub fn args(input: &str) -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel", "error",
            "-skip_frame", "nokey",
            "-i", input,
            "-an",
            "-vsync", "vfr",
            "-f", "image2pipe",
            "-c:v", "mjpeg",
            "-q:v", "2",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Decode key frames into encoded JPEG stills, in stream order.
    pub fn decode(&self, source: VideoSource<'_>) -> Result<Vec<Vec<u8>>> {
        self.decode_with_cancel(source, &AtomicBool::new(false))
    }

    /// Like `decode`, but kills the decoder and returns `Cancelled` once `cancel` is raised.
    pub fn decode_with_cancel(&self, source: VideoSource<'_>, cancel: &AtomicBool) -> Result<Vec<Vec<u8>>> {
        if is_cancelled(cancel) {
            return Err(FramewiseError::Cancelled);
        }

        let input = match source {
            VideoSource::Path(path) => path.to_string_lossy().into_owned(),
            VideoSource::Bytes(_) => "pipe:0".to_string(),
        };

        let mut cmd = Command::new(&self.options.program);
        cmd.args(Self::args(&input))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(match source {
                VideoSource::Bytes(_) => Stdio::piped(),
                VideoSource::Path(_) => Stdio::null(),
            });

        let mut child = cmd.spawn().map_err(|e| {
            FramewiseError::Decode(format!(
                "failed to start {}: {}",
                self.options.program.display(),
                e
            ))
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FramewiseError::Decode("decoder stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let deadline = Instant::now() + self.options.timeout;
        let max_frames = self.options.max_frames.max(1);

        // A grandchild of the decoder can hold these pipes after the decoder exits
        if let (Some(mut stdin), VideoSource::Bytes(bytes)) = (stdin, source) {
            let bytes = bytes.to_vec();
            spawn_pipe_thread("decoder-stdin", move || {
                // A broken pipe means the decoder stopped reading; that is not our error
                if let Err(e) = stdin.write_all(&bytes) {
                    log::debug!("Decoder stdin closed early: {}", e);
                }
            });
        }

        let (err_tx, err_rx) = mpsc::channel::<String>();
        spawn_pipe_thread("decoder-stderr", move || {
            let mut message = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut message);
            }
            let _ = err_tx.send(message);
        });

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        spawn_pipe_thread("decoder-stdout", move || read_frames(stdout, tx));

        let mut frames = Vec::new();
        let mut stopped = None;
        loop {
            match recv_until(&rx, Some(deadline), cancel) {
                Received::Item(frame) => {
                    frames.push(frame);
                    if frames.len() >= max_frames {
                        stopped = Some(StopReason::FrameCap);
                        break;
                    }
                }
                Received::Deadline => {
                    stopped = Some(StopReason::Deadline);
                    break;
                }
                Received::Cancelled => {
                    stopped = Some(StopReason::Cancelled);
                    break;
                }
                Received::Closed => break,
            }
        }

        if stopped.is_some() {
            if let Err(e) = child.kill() {
                log::debug!("Decoder already exited: {}", e);
            }
        }
        // Unblocks the reader if it is mid-send
        drop(rx);

        let status = child.wait()?;
        if stopped == Some(StopReason::Cancelled) {
            log::debug!("Decoder cancelled after {} frames", frames.len());
            return Err(FramewiseError::Cancelled);
        }
        let stderr_text = err_rx.recv_timeout(STDERR_GRACE).unwrap_or_default();

        finish(frames, stopped, status, stderr_text.trim(), &self.options)
    }
}

fn spawn_pipe_thread(name: &str, f: impl FnOnce() + Send + 'static) {
    if let Err(e) = std::thread::Builder::new().name(name.to_string()).spawn(f) {
        log::warn!("Failed to spawn {} thread: {}", name, e);
    }
}

fn finish(
    frames: Vec<Vec<u8>>,
    stopped: Option<StopReason>,
    status: std::process::ExitStatus,
    stderr: &str,
    options: &DecoderOptions,
) -> Result<Vec<Vec<u8>>> {
    match stopped {
        Some(StopReason::Deadline) => {
            if frames.is_empty() {
                return Err(FramewiseError::Decode(format!(
                    "no frames within {}s",
                    options.timeout.as_secs()
                )));
            }
            log::warn!(
                "Decoder hit the {}s deadline; keeping {} frames",
                options.timeout.as_secs(),
                frames.len()
            );
        }
        Some(StopReason::FrameCap) => {
            log::debug!("Decoder stopped at the {} frame cap", options.max_frames);
        }
        Some(StopReason::Cancelled) => return Err(FramewiseError::Cancelled),
        None => {
            if frames.is_empty() {
                let detail = if stderr.is_empty() {
                    format!("decoder exited with {}", status)
                } else {
                    stderr.to_string()
                };
                return Err(FramewiseError::Decode(format!("no frames decoded: {}", detail)));
            }
            if !status.success() {
                log::warn!(
                    "Decoder exited with {} after {} frames: {}",
                    status,
                    frames.len(),
                    stderr
                );
            }
        }
    }

    Ok(frames)
}

fn read_frames(mut stdout: impl Read, tx: mpsc::Sender<Vec<u8>>) {
    let mut scanner = JpegScanner::new();
    let mut chunk = vec![0u8; DECODER_READ_CHUNK];

    loop {
        let read = match stdout.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                log::debug!("Decoder stdout read failed: {}", e);
                return;
            }
        };

        for frame in scanner.push(&chunk[..read]) {
            if tx.send(frame).is_err() {
                return;
            }
        }
    }
}

/// Splits a byte stream of concatenated JPEGs on SOI (FFD8) / EOI (FFD9) markers.
#[derive(Debug, Default)]
pub struct JpegScanner {
    buffer: Vec<u8>,
    // Offset already searched for EOI within the current frame
    scanned: usize,
}

impl JpegScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Discard anything before the next SOI
            match find_marker(&self.buffer, 0, 0xD8) {
                Some(0) => {}
                Some(start) => {
                    self.buffer.drain(..start);
                    self.scanned = 0;
                }
                None => {
                    // Keep a trailing 0xFF in case the marker straddles chunks
                    let keep = usize::from(self.buffer.last() == Some(&0xFF));
                    let drop_len = self.buffer.len() - keep;
                    self.buffer.drain(..drop_len);
                    self.scanned = 0;
                    return frames;
                }
            }

            let from = self.scanned.max(2);
            match find_marker(&self.buffer, from, 0xD9) {
                Some(eoi) => {
                    let end = eoi + 2;
                    frames.push(self.buffer.drain(..end).collect());
                    self.scanned = 0;
                }
                None => {
                    if self.buffer.len() > MAX_JPEG_BYTES {
                        log::warn!("Dropping oversized frame ({} bytes)", self.buffer.len());
                        self.buffer.clear();
                        self.scanned = 0;
                    } else {
                        self.scanned = self.buffer.len().saturating_sub(1);
                    }
                    return frames;
                }
            }
        }
    }
}

fn find_marker(buffer: &[u8], from: usize, marker: u8) -> Option<usize> {
    if buffer.len() < 2 || from >= buffer.len() - 1 {
        return None;
    }
    buffer[from..]
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == marker)
        .map(|p| p + from)
}
