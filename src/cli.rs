// Framewise CLI binary

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use framewise_lib::config::{Settings, CONFIG_ENV};
use framewise_lib::jobs::sweeper::spawn_sweeper;
use framewise_lib::media::fetch::{FileSnapshotSource, HttpSnapshotSource, SnapshotSource};
use framewise_lib::timeline::{EventFilter, EventUpdate, NewEvent, Timeline};
use framewise_lib::{IngestOptions, MediaInput, MediaPipeline, TimeInput};

#[derive(Parser)]
#[command(name = "framewise")]
#[command(about = "Framewise - frame selection and event timeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Override the data directory from the settings file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the most distinct frames from images, videos and live sources
    Analyze(AnalyzeArgs),

    /// Query and edit stored events
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Remove snapshots no event references
    Gc {
        /// Keep sweeping on the configured interval until terminated
        #[arg(long)]
        watch: bool,
    },

    /// Open the store, apply migrations and retention
    Migrate,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Image or video files and URLs, told apart by extension
    inputs: Vec<String>,

    /// Image file or URL
    #[arg(long = "image")]
    images: Vec<String>,

    /// Video file or URL
    #[arg(long = "video")]
    videos: Vec<String>,

    /// Live source as NAME=URL or NAME=PATH
    #[arg(long = "record")]
    recordings: Vec<String>,

    /// Recording length in seconds
    #[arg(long, default_value = "10")]
    duration: f64,

    /// Frames kept per video or recording
    #[arg(long)]
    max_frames: Option<usize>,

    /// Longest edge of emitted frames
    #[arg(long)]
    target_width: Option<u32>,

    /// Put source names in frame labels
    #[arg(long)]
    include_filename: bool,

    /// Archive the first frame into the snapshot directory
    #[arg(long)]
    expose: bool,

    /// Write frames here as JPEG files
    #[arg(long)]
    out: Option<PathBuf>,

    /// Store an event for this analysis with the given title
    #[arg(long)]
    remember: Option<String>,

    /// Camera name for the stored event
    #[arg(long)]
    camera: Option<String>,
}

#[derive(Subcommand)]
enum EventCommands {
    /// List events, newest first
    List {
        #[arg(long = "camera")]
        cameras: Vec<String>,
        #[arg(long = "category")]
        categories: Vec<String>,
        /// Keep events ending after this time
        #[arg(long)]
        since: Option<String>,
        /// Keep events starting before this time
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one event
    Show { uid: String },

    /// Create an event
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Path inside the snapshot directory
        #[arg(long, default_value = "")]
        key_frame: String,
        #[arg(long, default_value = "")]
        camera: String,
        #[arg(long, default_value = "")]
        category: String,
        #[arg(long, default_value = "")]
        label: String,
    },

    /// Change fields of an event
    Update {
        uid: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        key_frame: Option<String>,
        #[arg(long)]
        camera: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },

    /// Delete an event and its snapshot
    Delete { uid: String },

    /// One line per event in a time range
    Summary {
        #[arg(long)]
        since: String,
        #[arg(long)]
        until: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref());
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }

    match cli.command {
        Commands::Analyze(args) => cmd_analyze(&settings, args),
        Commands::Events { command } => cmd_events(&settings, command),
        Commands::Gc { watch } => cmd_gc(&settings, watch),
        Commands::Migrate => cmd_migrate(&settings),
    }
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn cmd_analyze(settings: &Settings, args: AnalyzeArgs) -> Result<()> {
    let mut inputs = Vec::new();
    for location in &args.inputs {
        inputs.push(MediaInput::from_location(location)?);
    }
    for image in &args.images {
        inputs.push(if is_url(image) {
            MediaInput::ImageUrl(image.clone())
        } else {
            MediaInput::ImageFile(PathBuf::from(image))
        });
    }
    for video in &args.videos {
        inputs.push(if is_url(video) {
            MediaInput::VideoUrl(video.clone())
        } else {
            MediaInput::VideoFile(PathBuf::from(video))
        });
    }

    let has_video = inputs
        .iter()
        .any(|i| matches!(i, MediaInput::VideoFile(_) | MediaInput::VideoUrl(_)));
    if has_video && !framewise_lib::tools::is_ffmpeg_available() {
        log::warn!(
            "ffmpeg not found at {}; video inputs will fail",
            framewise_lib::tools::ffmpeg_path().display()
        );
    }

    // Opened first so archived key frames are held in the timeline's pending set
    let timeline = match args.remember {
        Some(_) => Some(Timeline::open(settings)?),
        None => None,
    };
    let mut pipeline = MediaPipeline::new(settings)?;
    if let Some(timeline) = &timeline {
        pipeline = pipeline.with_snapshots(Arc::clone(timeline.snapshots()));
    }
    if !args.recordings.is_empty() {
        if !args.duration.is_finite() || args.duration <= 0.0 {
            anyhow::bail!("--duration must be a positive number of seconds");
        }
        let sources = args
            .recordings
            .iter()
            .map(|entry| parse_source(entry, &pipeline))
            .collect();
        inputs.push(MediaInput::Recording {
            sources,
            duration: Duration::from_secs_f64(args.duration),
        });
    }

    let mut options = IngestOptions::from_settings(settings);
    if let Some(max_frames) = args.max_frames {
        options.max_frames = max_frames;
    }
    if let Some(width) = args.target_width {
        options.target_width = width;
    }
    options.include_filename = args.include_filename;
    options.expose_snapshot = args.expose || args.remember.is_some();

    let output = pipeline.process(&inputs, &options)?;

    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)
            .with_context(|| format!("Cannot create output directory {}", out.display()))?;
        for (i, frame) in output.frames.iter().enumerate() {
            let path = out.join(format!("frame-{:03}.jpg", i + 1));
            std::fs::write(&path, &frame.payload)
                .with_context(|| format!("Cannot write {}", path.display()))?;
        }
        log::info!("Wrote {} frames to {}", output.frames.len(), out.display());
    }

    let event = match (args.remember, &timeline) {
        (Some(title), Some(timeline)) => {
            let key_frame = output
                .key_frame
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some(timeline.create(NewEvent {
                title,
                key_frame,
                camera_name: args.camera.unwrap_or_default(),
                ..NewEvent::default()
            })?)
        }
        _ => None,
    };

    #[derive(Serialize)]
    struct AnalyzeReport<'a> {
        frames: &'a [framewise_lib::EncodedFrame],
        key_frame: Option<&'a Path>,
        event: Option<framewise_lib::Event>,
    }

    print_json(&AnalyzeReport {
        frames: &output.frames,
        key_frame: output.key_frame.as_deref(),
        event,
    })
}

fn cmd_events(settings: &Settings, command: EventCommands) -> Result<()> {
    let timeline = Timeline::open(settings)?;

    match command {
        EventCommands::List {
            cameras,
            categories,
            since,
            until,
            limit,
        } => {
            let filter = EventFilter {
                cameras,
                categories,
                start: resolve_time(&timeline, since)?,
                end: resolve_time(&timeline, until)?,
                limit,
            };
            print_json(&timeline.list(&filter)?)
        }
        EventCommands::Show { uid } => {
            let event = timeline
                .get(&uid)?
                .ok_or_else(|| anyhow::anyhow!("Event {} not found", uid))?;
            print_json(&event)
        }
        EventCommands::Create {
            title,
            start,
            end,
            description,
            key_frame,
            camera,
            category,
            label,
        } => {
            let event = timeline.create(NewEvent {
                title,
                start: start.map(TimeInput::from),
                end: end.map(TimeInput::from),
                description,
                key_frame,
                camera_name: camera,
                category,
                label,
            })?;
            print_json(&event)
        }
        EventCommands::Update {
            uid,
            title,
            start,
            end,
            description,
            key_frame,
            camera,
            category,
            label,
        } => {
            let changes = EventUpdate {
                title,
                start: start.map(TimeInput::from),
                end: end.map(TimeInput::from),
                description,
                key_frame,
                camera_name: camera,
                category,
                label,
            };
            let event = timeline
                .update(&uid, changes)?
                .ok_or_else(|| anyhow::anyhow!("Event {} not found", uid))?;
            print_json(&event)
        }
        EventCommands::Delete { uid } => {
            if !timeline.delete(&uid)? {
                anyhow::bail!("Event {} not found", uid);
            }
            println!("Deleted event {}", uid);
            Ok(())
        }
        EventCommands::Summary { since, until } => {
            let text = timeline.summaries(&TimeInput::from(since), &TimeInput::from(until))?;
            if text.is_empty() {
                println!("No events in range.");
            } else {
                println!("{}", text);
            }
            Ok(())
        }
    }
}

fn cmd_gc(settings: &Settings, watch: bool) -> Result<()> {
    let timeline = Arc::new(Timeline::open(settings)?);

    if !watch {
        let report = timeline.sweep_snapshots()?;
        return print_json(&report);
    }

    let _sweeper = spawn_sweeper(Arc::clone(&timeline), settings.gc_interval())?;
    println!(
        "Sweeping {} every {}s. Press Ctrl+C to stop.",
        timeline.snapshot_dir().display(),
        settings.gc_interval().as_secs()
    );
    loop {
        std::thread::park();
    }
}

fn cmd_migrate(settings: &Settings) -> Result<()> {
    let timeline = Timeline::open(settings)?;

    println!("Database:       {}", timeline.db_path().display());
    println!("Schema version: {}", timeline.schema_version()?);
    println!("Events:         {}", timeline.len());
    Ok(())
}

fn is_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// `NAME=URL`, `NAME=PATH`, or a bare URL/path named after itself.
fn parse_source(entry: &str, pipeline: &MediaPipeline) -> Arc<dyn SnapshotSource> {
    let (name, location) = match entry.split_once('=') {
        // URLs may carry '=' in their query
        Some((name, location)) if !name.is_empty() && !is_url(entry) => (name, location),
        _ => (entry, entry),
    };

    if is_url(location) {
        Arc::new(HttpSnapshotSource::new(name, location, pipeline.fetch_policy()))
    } else {
        Arc::new(FileSnapshotSource::new(name, location))
    }
}

fn resolve_time(
    timeline: &Timeline,
    value: Option<String>,
) -> Result<Option<chrono::DateTime<chrono::FixedOffset>>> {
    match value {
        Some(value) => Ok(Some(TimeInput::from(value).resolve(timeline.default_offset())?)),
        None => Ok(None),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
