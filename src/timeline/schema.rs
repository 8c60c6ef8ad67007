// Event table types and query helpers

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use chrono::{DateTime, FixedOffset};

use crate::error::Result;

use super::time::parse_stored;

pub const CREATE_EVENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        uid TEXT PRIMARY KEY,
        title TEXT,
        start TEXT,
        "end" TEXT,
        description TEXT,
        key_frame TEXT,
        camera_name TEXT,
        category TEXT,
        label TEXT
    );
"#;

pub const CREATE_EVENT_INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_events_start ON events(start);
    CREATE INDEX IF NOT EXISTS idx_events_end ON events("end");
"#;

const EVENT_COLUMNS: &str =
    r#"uid, title, start, "end", description, key_frame, camera_name, category, label"#;

/// One timeline row. Times are stored as RFC 3339 text with an explicit offset;
/// rows written by older versions may hold other formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub uid: String,
    pub title: String,
    pub start: String,
    pub end: String,
    pub description: String,
    /// Path of the archived snapshot, empty when none
    pub key_frame: String,
    pub camera_name: String,
    pub category: String,
    pub label: String,
}

impl Event {
    pub fn start_time(&self) -> Option<DateTime<FixedOffset>> {
        parse_stored(&self.start)
    }

    pub fn end_time(&self) -> Option<DateTime<FixedOffset>> {
        parse_stored(&self.end)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uid: row.get(0)?,
            title: text(row, 1)?,
            start: text(row, 2)?,
            end: text(row, 3)?,
            description: text(row, 4)?,
            key_frame: text(row, 5)?,
            camera_name: text(row, 6)?,
            category: text(row, 7)?,
            label: text(row, 8)?,
        })
    }
}

// Legacy rows may hold NULL in any column
fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

/// Lowercased final path component.
pub fn basename(path: &str) -> Option<String> {
    if path.trim().is_empty() {
        return None;
    }
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)", EVENT_COLUMNS),
        params![
            event.uid,
            event.title,
            event.start,
            event.end,
            event.description,
            event.key_frame,
            event.camera_name,
            event.category,
            event.label,
        ],
    )?;
    Ok(())
}

pub fn get_event(conn: &Connection, uid: &str) -> Result<Option<Event>> {
    let event = conn
        .query_row(
            &format!("SELECT {} FROM events WHERE uid = ?1", EVENT_COLUMNS),
            params![uid],
            Event::from_row,
        )
        .optional()?;
    Ok(event)
}

pub fn list_events(conn: &Connection) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM events", EVENT_COLUMNS))?;
    let events = stmt
        .query_map([], Event::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Overwrite every column of an existing row. Returns false if the uid is unknown.
pub fn update_event(conn: &Connection, event: &Event) -> Result<bool> {
    let changed = conn.execute(
        r#"UPDATE events
           SET title = ?2, start = ?3, "end" = ?4, description = ?5,
               key_frame = ?6, camera_name = ?7, category = ?8, label = ?9
           WHERE uid = ?1"#,
        params![
            event.uid,
            event.title,
            event.start,
            event.end,
            event.description,
            event.key_frame,
            event.camera_name,
            event.category,
            event.label,
        ],
    )?;
    Ok(changed > 0)
}

pub fn delete_event(conn: &Connection, uid: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM events WHERE uid = ?1", params![uid])?;
    Ok(changed > 0)
}

pub fn count_events(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(count)
}

/// Non-empty key frame paths of every row.
pub fn linked_key_frames(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT key_frame FROM events WHERE key_frame IS NOT NULL AND key_frame != ''",
    )?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(paths)
}

/// Column names of `table`, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}
