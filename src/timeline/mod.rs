// Event timeline
//
// SQLite-backed event store with an in-memory view of all rows. Each operation
// opens a short-lived connection; the view is rebuilt after every mutation and
// on reload, after expired rows are purged.

pub mod gc;
pub mod lexicon;
pub mod migrations;
pub mod schema;
pub mod time;


use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::constants::DEFAULT_EVENT_LENGTH_SECS;
use crate::error::{FramewiseError, Result};

use gc::{LinkedSnapshots, SnapshotGc, SnapshotRegistry, SweepReport};
use lexicon::Lexicon;
use migrations::MigrationContext;
use schema::Event;
use time::{format_stored, offset_from_minutes, TimeInput};

/// Fields for a new event. Blank category or label are resolved from the title.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub title: String,
    /// Defaults to now
    pub start: Option<TimeInput>,
    /// Defaults to one minute after start
    pub end: Option<TimeInput>,
    pub description: String,
    /// An existing file directly inside the snapshot directory, or empty
    pub key_frame: String,
    pub camera_name: String,
    pub category: String,
    pub label: String,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct EventUpdate {
    pub title: Option<String>,
    pub start: Option<TimeInput>,
    pub end: Option<TimeInput>,
    pub description: Option<String>,
    pub key_frame: Option<String>,
    pub camera_name: Option<String>,
    pub category: Option<String>,
    pub label: Option<String>,
}

/// Query over the cached view. Empty lists match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub cameras: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Keep events ending after this instant
    pub start: Option<DateTime<FixedOffset>>,
    /// Keep events starting before this instant
    pub end: Option<DateTime<FixedOffset>>,
    pub limit: Option<usize>,
}

pub struct Timeline {
    db_path: PathBuf,
    snapshot_dir: PathBuf,
    // Canonical form of snapshot_dir, for key-frame checks
    snapshot_root: PathBuf,
    retention: Option<ChronoDuration>,
    default_offset: FixedOffset,
    gc_grace: Duration,
    lexicon: Arc<Lexicon>,
    snapshots: Arc<SnapshotRegistry>,
    events: RwLock<Vec<Event>>,
}

impl Timeline {
    /// Open the store: create directories, migrate, purge and load.
    pub fn open(settings: &Settings) -> Result<Self> {
        let lexicon = Lexicon::load(settings.lexicon_dir.as_deref(), &settings.language);
        Self::open_with_lexicon(settings, lexicon)
    }

    pub fn open_with_lexicon(settings: &Settings, lexicon: Lexicon) -> Result<Self> {
        std::fs::create_dir_all(&settings.data_dir)?;
        let snapshot_dir = settings.snapshot_dir();
        std::fs::create_dir_all(&snapshot_dir)?;
        let snapshot_root = snapshot_dir.canonicalize()?;

        let timeline = Self {
            db_path: settings.db_path(),
            snapshot_dir,
            snapshot_root,
            retention: match settings.retention_days {
                0 => None,
                days => Some(ChronoDuration::days(days as i64)),
            },
            default_offset: offset_from_minutes(settings.default_utc_offset_minutes)?,
            gc_grace: settings.gc_grace(),
            lexicon: Arc::new(lexicon),
            snapshots: Arc::new(SnapshotRegistry::new()),
            events: RwLock::new(Vec::new()),
        };

        let conn = timeline.connect()?;
        let legacy_events_file = settings.legacy_events_file();
        let ctx = MigrationContext {
            lexicon: &timeline.lexicon,
            snapshot_dir: &timeline.snapshot_dir,
            legacy_snapshot_dirs: &settings.legacy_snapshot_dirs,
            legacy_events_file: &legacy_events_file,
            default_offset: timeline.default_offset,
        };
        migrations::run_migrations(&conn, &ctx)?;
        drop(conn);

        timeline.reload()?;
        log::info!(
            "Opened timeline at {} ({} events)",
            timeline.db_path.display(),
            timeline.len()
        );
        Ok(timeline)
    }

    /// Open a short-lived connection.
    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Offset applied to times given without one.
    pub fn default_offset(&self) -> FixedOffset {
        self.default_offset
    }

    pub fn snapshots(&self) -> &Arc<SnapshotRegistry> {
        &self.snapshots
    }

    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.connect()?;
        Ok(migrations::get_schema_version(&conn)?)
    }

    /// Events in the cached view.
    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge expired rows and rebuild the cached view. Returns the number purged.
    /// On failure the previous view is kept.
    pub fn reload(&self) -> Result<usize> {
        let conn = self.connect()?;
        let purged = self.purge_expired(&conn)?;

        let mut events = schema::list_events(&conn)?;
        sort_newest_first(&mut events);

        *self.events.write()? = events;
        Ok(purged)
    }

    fn purge_expired(&self, conn: &Connection) -> Result<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now() - retention;

        let expired: Vec<Event> = schema::list_events(conn)?
            .into_iter()
            .filter(|e| matches!(e.start_time(), Some(start) if start < cutoff))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let tx = conn.unchecked_transaction()?;
        for event in &expired {
            tx.execute("DELETE FROM events WHERE uid = ?1", params![event.uid])?;
        }
        tx.commit()?;

        // Files go after the rows; a leftover file is only an orphan for the sweeper
        for event in &expired {
            self.remove_key_frame(&event.key_frame);
        }

        log::info!("Purged {} events older than {}", expired.len(), cutoff.to_rfc3339());
        Ok(expired.len())
    }

    pub fn create(&self, new: NewEvent) -> Result<Event> {
        let start = match &new.start {
            Some(t) => t.resolve(self.default_offset)?,
            None => Utc::now().with_timezone(&self.default_offset),
        };
        let end = match &new.end {
            Some(t) => t.resolve(self.default_offset)?,
            None => start + ChronoDuration::seconds(DEFAULT_EVENT_LENGTH_SECS),
        };
        if end < start {
            return Err(FramewiseError::Input(format!(
                "event ends ({}) before it starts ({})",
                format_stored(&end),
                format_stored(&start)
            )));
        }
        self.check_key_frame(&new.key_frame)?;

        let mut event = Event {
            uid: Uuid::new_v4().to_string(),
            title: new.title,
            start: format_stored(&start),
            end: format_stored(&end),
            description: new.description,
            key_frame: new.key_frame,
            camera_name: new.camera_name,
            category: new.category.trim().to_string(),
            label: new.label.trim().to_lowercase(),
        };
        self.classify(&mut event);

        {
            let _pending = self.snapshots.hold(&event.key_frame);
            let conn = self.connect()?;
            schema::insert_event(&conn, &event)?;
        }

        log::info!("Created event {} ({})", event.uid, event.title);
        self.reload()?;
        Ok(event)
    }

    pub fn get(&self, uid: &str) -> Result<Option<Event>> {
        let events = self.events.read()?;
        Ok(events.iter().find(|e| e.uid == uid).cloned())
    }

    /// Matching events, newest first. Rows with unparseable times sort last
    /// and are left out of time-bounded queries.
    pub fn list(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let cameras: Vec<String> = filter.cameras.iter().map(|c| c.to_lowercase()).collect();
        let categories: Vec<String> = filter.categories.iter().map(|c| c.to_lowercase()).collect();

        let events = self.events.read()?;
        let matched = events
            .iter()
            .filter(|e| cameras.is_empty() || cameras.contains(&e.camera_name.to_lowercase()))
            .filter(|e| categories.is_empty() || categories.contains(&e.category.to_lowercase()))
            .filter(|e| overlaps(e, filter.start, filter.end))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matched)
    }

    pub fn update(&self, uid: &str, changes: EventUpdate) -> Result<Option<Event>> {
        let conn = self.connect()?;
        let Some(mut event) = schema::get_event(&conn, uid)? else {
            return Ok(None);
        };
        let previous_key_frame = event.key_frame.clone();

        if let Some(title) = changes.title {
            event.title = title;
        }
        if let Some(description) = changes.description {
            event.description = description;
        }
        if let Some(camera_name) = changes.camera_name {
            event.camera_name = camera_name;
        }
        if let Some(category) = changes.category {
            event.category = category.trim().to_string();
        }
        if let Some(label) = changes.label {
            event.label = label.trim().to_lowercase();
        }
        if let Some(key_frame) = changes.key_frame {
            self.check_key_frame(&key_frame)?;
            event.key_frame = key_frame;
        }
        if let Some(start) = &changes.start {
            event.start = format_stored(&start.resolve(self.default_offset)?);
        }
        if let Some(end) = &changes.end {
            event.end = format_stored(&end.resolve(self.default_offset)?);
        }
        if let (Some(start), Some(end)) = (event.start_time(), event.end_time()) {
            if end < start {
                return Err(FramewiseError::Input("event ends before it starts".to_string()));
            }
        }
        self.classify(&mut event);

        {
            let _pending = self.snapshots.hold(&event.key_frame);
            schema::update_event(&conn, &event)?;
        }
        drop(conn);

        if previous_key_frame != event.key_frame {
            self.remove_key_frame(&previous_key_frame);
        }

        log::info!("Updated event {}", uid);
        self.reload()?;
        Ok(Some(event))
    }

    /// Delete the row and its snapshot. A failure to remove the file is logged
    /// and left to the sweeper; the row deletion still counts.
    pub fn delete(&self, uid: &str) -> Result<bool> {
        let conn = self.connect()?;
        let Some(event) = schema::get_event(&conn, uid)? else {
            return Ok(false);
        };
        let removed = schema::delete_event(&conn, uid)?;
        drop(conn);

        if removed {
            self.remove_key_frame(&event.key_frame);
            log::info!("Deleted event {}", uid);
        }
        self.reload()?;
        Ok(removed)
    }

    /// One line per event overlapping [start, end), oldest first.
    pub fn summaries(&self, start: &TimeInput, end: &TimeInput) -> Result<String> {
        let start = start.resolve(self.default_offset)?;
        let end = end.resolve(self.default_offset)?;

        let mut events = self.list(&EventFilter {
            start: Some(start),
            end: Some(end),
            ..EventFilter::default()
        })?;
        events.reverse();

        let lines: Vec<String> = events
            .iter()
            .map(|e| {
                let when = e
                    .start_time()
                    .map(|t| t.with_timezone(&self.default_offset).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| e.start.clone());
                if e.camera_name.is_empty() {
                    format!("{}: {}", when, e.title)
                } else {
                    format!("{} ({}): {}", when, e.camera_name, e.title)
                }
            })
            .collect();
        Ok(lines.join("\n"))
    }

    /// Collector for this store's snapshot directory.
    pub fn snapshot_gc(&self) -> SnapshotGc {
        SnapshotGc::new(&self.snapshot_dir, Arc::clone(&self.snapshots), self.gc_grace)
    }

    /// Run one sweep of the snapshot directory.
    pub fn sweep_snapshots(&self) -> Result<SweepReport> {
        self.snapshot_gc().sweep(self)
    }

    fn classify(&self, event: &mut Event) {
        if !event.category.is_empty() && !event.label.is_empty() {
            return;
        }
        let (category, label) = self.lexicon.resolve(&event.title);
        if event.category.is_empty() {
            event.category = category;
        }
        if event.label.is_empty() {
            event.label = label;
        }
    }

    fn check_key_frame(&self, key_frame: &str) -> Result<()> {
        if key_frame.trim().is_empty() {
            return Ok(());
        }
        let path = Path::new(key_frame);
        if !path.is_file() {
            return Err(FramewiseError::Input(format!("key frame {} does not exist", key_frame)));
        }
        if self.is_managed(path) {
            return Ok(());
        }
        Err(FramewiseError::Input(format!(
            "key frame {} is outside the snapshot directory {}",
            key_frame,
            self.snapshot_dir.display()
        )))
    }

    /// True for existing paths that resolve directly inside the snapshot
    /// directory, whether given relative, absolute or through `..`.
    fn is_managed(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(resolved) => resolved.parent() == Some(self.snapshot_root.as_path()),
            Err(_) => false,
        }
    }

    fn remove_key_frame(&self, key_frame: &str) {
        if key_frame.trim().is_empty() {
            return;
        }
        let path = Path::new(key_frame);
        if !path.exists() {
            return;
        }
        if !self.is_managed(path) {
            log::debug!("Leaving unmanaged snapshot {}", key_frame);
            return;
        }
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("Removed snapshot {}", key_frame),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove snapshot {}: {}", key_frame, e),
        }
    }
}

impl LinkedSnapshots for Timeline {
    fn linked_basenames(&self) -> Result<HashSet<String>> {
        let conn = self.connect()?;
        Ok(schema::linked_key_frames(&conn)?
            .iter()
            .filter_map(|p| schema::basename(p))
            .collect())
    }
}

fn overlaps(event: &Event, start: Option<DateTime<FixedOffset>>, end: Option<DateTime<FixedOffset>>) -> bool {
    if start.is_none() && end.is_none() {
        return true;
    }
    let (Some(event_start), Some(event_end)) = (event.start_time(), event.end_time()) else {
        return false;
    };
    if let Some(start) = start {
        if event_end <= start {
            return false;
        }
    }
    if let Some(end) = end {
        if event_start >= end {
            return false;
        }
    }
    true
}

fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| match (a.start_time(), b.start_time()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
