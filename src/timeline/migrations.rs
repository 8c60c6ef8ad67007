// Event store migrations
//
// Forward-only, tracked with PRAGMA user_version. Every step is idempotent and
// runs in its own transaction together with its version bump, so a crash
// leaves the store at a clean step boundary and a re-run is harmless.

use std::collections::HashSet;
use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, FixedOffset};
use rusqlite::{params, Connection};
use serde::Deserialize;

use super::lexicon::Lexicon;
use super::schema::{self, CREATE_EVENTS_TABLE, CREATE_EVENT_INDEXES};
use super::time::{format_stored, TimeInput};
use crate::constants::DEFAULT_EVENT_LENGTH_SECS;

/// Inputs the data-moving steps need.
pub struct MigrationContext<'a> {
    pub lexicon: &'a Lexicon,
    pub snapshot_dir: &'a Path,
    pub legacy_snapshot_dirs: &'a [PathBuf],
    pub legacy_events_file: &'a Path,
    pub default_offset: FixedOffset,
}

type Step = fn(&Connection, &MigrationContext<'_>) -> Result<()>;

/// All steps in order. Never reorder or remove a step after it ships.
const MIGRATIONS: &[(&str, Step)] = &[
    ("create events table", create_events_table),
    ("migrate legacy columns", migrate_columns),
    ("import legacy events file", import_legacy_events),
    ("relocate snapshots", relocate_snapshots),
    ("backfill category and label", backfill_classification),
];

pub fn target_version() -> u32 {
    MIGRATIONS.len() as u32
}

/// Get current schema version from database
pub fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations. Returns the resulting version.
pub fn run_migrations(conn: &Connection, ctx: &MigrationContext<'_>) -> Result<u32> {
    let current_version = get_schema_version(conn)?;
    let target = target_version();

    // Refuse to open a store written by a newer build
    if current_version > target {
        bail!(
            "Event store schema version {} is newer than this build supports (max {})",
            current_version,
            target
        );
    }

    if current_version == target {
        return Ok(current_version);
    }

    log::info!("Migrating event store from version {} to {}", current_version, target);

    for (i, (name, step)) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as u32;
        if version <= current_version {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        step(&tx, ctx).with_context(|| format!("migration {} ({}) failed", version, name))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;

        log::info!("Applied migration {} ({})", version, name);
    }

    archive_legacy_events_file(ctx.legacy_events_file);

    Ok(target)
}

fn create_events_table(conn: &Connection, _ctx: &MigrationContext<'_>) -> Result<()> {
    conn.execute_batch(CREATE_EVENTS_TABLE)?;
    conn.execute_batch(CREATE_EVENT_INDEXES)?;
    Ok(())
}

/// Bring older layouts to the current columns: `summary` becomes `title`,
/// `today_summary` is dropped, `category` and `label` are added.
fn migrate_columns(conn: &Connection, _ctx: &MigrationContext<'_>) -> Result<()> {
    let columns: HashSet<String> = schema::table_columns(conn, "events")?.into_iter().collect();
    let has = |c: &str| columns.contains(c);

    if has("summary") || has("today_summary") {
        log::info!("Rebuilding events table with current columns");
        let title = if has("title") {
            "title"
        } else if has("summary") {
            "summary"
        } else {
            "NULL"
        };
        let category = if has("category") { "category" } else { "NULL" };
        let label = if has("label") { "label" } else { "NULL" };

        conn.execute_batch("ALTER TABLE events RENAME TO events_old;")?;
        conn.execute_batch(CREATE_EVENTS_TABLE)?;
        conn.execute_batch(&format!(
            r#"INSERT INTO events (uid, title, start, "end", description, key_frame, camera_name, category, label)
               SELECT uid, {}, start, "end", description, key_frame, camera_name, {}, {}
               FROM events_old;"#,
            title, category, label
        ))?;
        // Old indexes follow the renamed table and go away with it
        conn.execute_batch("DROP TABLE events_old;")?;
        conn.execute_batch(CREATE_EVENT_INDEXES)?;
        return Ok(());
    }

    for column in ["title", "category", "label"] {
        if !has(column) {
            log::info!("Adding {} column", column);
            conn.execute_batch(&format!("ALTER TABLE events ADD COLUMN {} TEXT;", column))?;
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LegacyEvent {
    start: String,
    #[serde(default)]
    end: Option<String>,
    #[serde(default, alias = "title")]
    summary: String,
    #[serde(default)]
    description: String,
    /// "<key_frame>,<camera_name>"
    #[serde(default)]
    location: String,
}

/// Import the flat-file store. Ids are derived from content so a repeated
/// import inserts nothing new.
fn import_legacy_events(conn: &Connection, ctx: &MigrationContext<'_>) -> Result<()> {
    let path = ctx.legacy_events_file;
    if !path.exists() {
        return Ok(());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let events: Vec<LegacyEvent> = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            log::error!("Skipping malformed legacy events file {}: {}", path.display(), e);
            return Ok(());
        }
    };

    let mut imported = 0;
    for legacy in &events {
        let start = match TimeInput::from(legacy.start.as_str()).resolve(ctx.default_offset) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Skipping legacy event {:?}: {}", legacy.summary, e);
                continue;
            }
        };
        let end = legacy
            .end
            .as_deref()
            .and_then(|e| TimeInput::from(e).resolve(ctx.default_offset).ok())
            .filter(|e| *e >= start)
            .unwrap_or(start + ChronoDuration::seconds(DEFAULT_EVENT_LENGTH_SECS));

        let mut location = legacy.location.splitn(2, ',');
        let key_frame = location.next().unwrap_or("").trim();
        let camera_name = location.next().unwrap_or("").trim();

        let uid = legacy_uid(&legacy.start, &legacy.summary, &legacy.location);
        imported += conn.execute(
            r#"INSERT OR IGNORE INTO events (uid, title, start, "end", description, key_frame, camera_name, category, label)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '', '')"#,
            params![
                uid,
                legacy.summary,
                format_stored(&start),
                format_stored(&end),
                legacy.description,
                key_frame,
                camera_name,
            ],
        )?;
    }

    log::info!("Imported {} of {} legacy events", imported, events.len());
    Ok(())
}

fn legacy_uid(start: &str, summary: &str, location: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [start, summary, location] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    format!("legacy-{}", &hasher.finalize().to_hex()[..24])
}

/// Rename the imported flat file so it is not read again.
fn archive_legacy_events_file(path: &Path) {
    if !path.exists() {
        return;
    }
    let archived = path.with_extension("json.migrated");
    match std::fs::rename(path, &archived) {
        Ok(()) => log::info!("Legacy events file moved to {}", archived.display()),
        Err(e) => log::warn!("Could not move legacy events file {}: {}", path.display(), e),
    }
}

/// Move snapshots out of legacy directories and rewrite stored paths.
fn relocate_snapshots(conn: &Connection, ctx: &MigrationContext<'_>) -> Result<()> {
    for legacy_dir in ctx.legacy_snapshot_dirs {
        if legacy_dir == ctx.snapshot_dir {
            continue;
        }

        if legacy_dir.is_dir() {
            std::fs::create_dir_all(ctx.snapshot_dir)?;
            let mut moved = 0;
            for entry in walkdir::WalkDir::new(legacy_dir).min_depth(1).max_depth(1) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        log::warn!("Cannot read {}: {}", legacy_dir.display(), e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let target = ctx.snapshot_dir.join(entry.file_name());
                if target.exists() {
                    log::debug!("{} already relocated", target.display());
                    continue;
                }
                match move_file(entry.path(), &target) {
                    Ok(()) => moved += 1,
                    Err(e) => log::warn!("Failed to move {}: {}", entry.path().display(), e),
                }
            }
            log::info!("Moved {} snapshots from {}", moved, legacy_dir.display());
        }

        let old_prefix = dir_prefix(legacy_dir);
        let new_prefix = dir_prefix(ctx.snapshot_dir);
        let rewritten = conn.execute(
            "UPDATE events
             SET key_frame = ?2 || substr(key_frame, length(?1) + 1)
             WHERE substr(key_frame, 1, length(?1)) = ?1",
            params![old_prefix, new_prefix],
        )?;
        if rewritten > 0 {
            log::info!("Rewrote {} snapshot paths under {}", rewritten, legacy_dir.display());
        }
    }
    Ok(())
}

fn dir_prefix(dir: &Path) -> String {
    let s = dir.to_string_lossy();
    let trimmed = s.trim_end_matches(['/', '\\']);
    format!("{}{}", trimmed, MAIN_SEPARATOR_STR)
}

/// Rename, or copy and remove across filesystems. Modification times are kept.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let metadata = std::fs::metadata(from)?;
    std::fs::copy(from, to).with_context(|| format!("copy to {}", to.display()))?;
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    filetime::set_file_mtime(to, mtime)?;
    std::fs::remove_file(from)?;
    Ok(())
}

/// Fill blank category/label from the title.
fn backfill_classification(conn: &Connection, ctx: &MigrationContext<'_>) -> Result<()> {
    let rows: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT uid, COALESCE(title, '') FROM events
             WHERE COALESCE(category, '') = '' OR COALESCE(label, '') = ''",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut filled = 0;
    for (uid, title) in &rows {
        let (category, label) = ctx.lexicon.resolve(title);
        if category.is_empty() {
            continue;
        }
        filled += conn.execute(
            "UPDATE events
             SET category = CASE WHEN COALESCE(category, '') = '' THEN ?2 ELSE category END,
                 label = CASE WHEN COALESCE(label, '') = '' THEN ?3 ELSE label END
             WHERE uid = ?1",
            params![uid, category, label],
        )?;
    }

    if !rows.is_empty() {
        log::info!("Classified {} of {} unlabeled events", filled, rows.len());
    }
    Ok(())
}
