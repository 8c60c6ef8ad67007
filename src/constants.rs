// Framewise Constants
// Defaults for settings live here; Settings overrides most of them at runtime.

// Paths
pub const DATA_FOLDER: &str = "framewise-data";
pub const DB_FILENAME: &str = "events.db";
pub const LEGACY_EVENTS_FILENAME: &str = "events.json";
pub const SNAPSHOTS_FOLDER: &str = "snapshots";
pub const WORK_FOLDER: &str = "work";
pub const SNAPSHOT_EXTENSION: &str = "jpg";

// Timeline
pub const SCHEMA_VERSION: u32 = 5;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 0;
pub const DEFAULT_EVENT_LENGTH_SECS: i64 = 60;
pub const DEFAULT_LANGUAGE: &str = "en";

// Snapshot GC
pub const GC_GRACE_SECS: u64 = 10;
pub const GC_INTERVAL_SECS: u64 = 300;

// Decoder
pub const DECODER_TIMEOUT_SECS: u64 = 300;
pub const MAX_DECODED_FRAMES: usize = 600;
pub const DECODER_READ_CHUNK: usize = 64 * 1024;
pub const MAX_JPEG_BYTES: usize = 16 * 1024 * 1024;

// Encoding
pub const DEFAULT_TARGET_WIDTH: u32 = 1280;
pub const JPEG_QUALITY: u8 = 85;

// Frame selection
pub const DEFAULT_MAX_FRAMES: usize = 3;
// Tie-break bias favoring earlier frames; tunable, not a contract
pub const KEYFRAME_BIAS: f64 = 0.005;
pub const SCORE_MAX_WIDTH: u32 = 640;

// Recording: (max duration secs, poll interval ms). Last row catches the rest.
pub const RECORD_INTERVALS: [(u64, u64); 5] = [
    (5, 500),
    (10, 1_000),
    (30, 2_000),
    (60, 4_000),
    (u64::MAX, 6_000),
];
// Per-source buffer cap is max_frames times this
pub const RECORD_BUFFER_FACTOR: usize = 10;

// Fetching
pub const FETCH_ATTEMPTS: u32 = 2;
pub const FETCH_RETRY_DELAY_MS: u64 = 1_000;
pub const FETCH_TIMEOUT_SECS: u64 = 10;
pub const MAX_FETCH_BYTES: u64 = 64 * 1024 * 1024;

// Worker pool
pub const MAX_WORKER_THREADS: usize = 8;

// Extensions
pub const VIDEO_EXTENSIONS: [&str; 12] = [
    "mp4", "mov", "avi", "mkv", "mts", "m2ts", "mpg", "mpeg",
    "webm", "m4v", "ts", "3gp",
];

pub const IMAGE_EXTENSIONS: [&str; 7] = [
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp",
];
