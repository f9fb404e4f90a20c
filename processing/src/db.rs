//! SQLite event store.
//!
//! One row per persisted clip:
//!
//! ```sql
//! event(id INTEGER PRIMARY KEY AUTOINCREMENT, datetime TEXT,
//!       license_plate TEXT, media_urls TEXT)   -- media_urls: JSON array
//! ```
//!
//! The first media path is the dedup key; it is indexed through
//! `json_extract(media_urls, '$[0]')`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use tracing::{info, warn};

/// Attempts made when the database is locked by another writer.
const BUSY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub id: i64,
    pub datetime: String,
    pub license_plate: String,
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// A row with the same first media path already exists.
    Duplicate,
}

fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Cannot open database: {}", db_path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Create the `event` table (and dedup index) if it doesn't exist.
pub fn initialize(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = open(db_path)?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS event (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            datetime      TEXT,
            license_plate TEXT,
            media_urls    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_media_urls ON event (json_extract(media_urls, '$[0]'));
        CREATE INDEX IF NOT EXISTS idx_event_plate ON event (license_plate);
    ",
    )
    .context("Failed to create event table")?;

    info!("Database schema verified ({})", db_path.display());
    Ok(())
}

fn is_busy(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(err, _))
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Insert an event unless its first media path is already stored.
///
/// The existence check and the insert share one `BEGIN IMMEDIATE`
/// transaction, so two writers cannot both insert the same key.
pub fn insert_event(
    db_path: &Path,
    datetime: &str,
    license_plate: &str,
    media_urls: &[String],
) -> Result<InsertOutcome> {
    let Some(key) = media_urls.first() else {
        anyhow::bail!("Refusing to store an event without media");
    };

    let mut attempt = 1;
    loop {
        match try_insert(db_path, datetime, license_plate, key, media_urls) {
            Ok(outcome) => return Ok(outcome),
            Err(e) if is_busy(&e) && attempt < BUSY_ATTEMPTS => {
                warn!("Database busy (attempt {attempt}): {e}");
                std::thread::sleep(Duration::from_secs(2));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_insert(
    db_path: &Path,
    datetime: &str,
    license_plate: &str,
    key: &str,
    media_urls: &[String],
) -> Result<InsertOutcome> {
    let mut conn = open(db_path)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: i64 = tx.query_row(
        "SELECT COUNT(*) FROM event WHERE json_extract(media_urls, '$[0]') = ?1",
        params![key],
        |row| row.get(0),
    )?;
    if existing > 0 {
        tx.commit()?;
        return Ok(InsertOutcome::Duplicate);
    }

    tx.execute(
        "INSERT INTO event (datetime, license_plate, media_urls) VALUES (?1, ?2, ?3)",
        params![datetime, license_plate, serde_json::to_string(media_urls)?],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(InsertOutcome::Inserted(id))
}

/// All stored events, oldest id first.
pub fn all_events(db_path: &Path) -> Result<Vec<EventRow>> {
    let conn = open(db_path)?;
    let mut stmt =
        conn.prepare("SELECT id, datetime, license_plate, media_urls FROM event ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (id, datetime, plate, urls) = row?;
        let media_urls = match urls.as_deref().map(serde_json::from_str::<Vec<String>>) {
            Some(Ok(list)) => list,
            Some(Err(e)) => {
                warn!("Event {id}: unreadable media_urls: {e}");
                Vec::new()
            }
            None => Vec::new(),
        };
        events.push(EventRow {
            id,
            datetime: datetime.unwrap_or_default(),
            license_plate: plate.unwrap_or_default(),
            media_urls,
        });
    }
    Ok(events)
}

pub fn delete_events(db_path: &Path, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut conn = open(db_path)?;
    let tx = conn.transaction()?;
    let mut deleted = 0;
    {
        let mut stmt = tx.prepare("DELETE FROM event WHERE id = ?1")?;
        for id in ids {
            deleted += stmt.execute(params![id])?;
        }
    }
    tx.commit()?;
    Ok(deleted)
}

pub fn count_events(db_path: &Path) -> Result<u64> {
    let conn = open(db_path)?;
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM event", [], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_duplicate_first_media_is_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db").join("events.db");
        initialize(&db).unwrap();

        let first = insert_event(
            &db,
            "2025-05-26_12-00-00",
            "ABC123",
            &urls(&["ABC123/clip.mp4", "ABC123/clip_center.jpg"]),
        )
        .unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = insert_event(&db, "2025-05-26_12-00-05", "ABC123", &urls(&["ABC123/clip.mp4"])).unwrap();
        assert_eq!(second, InsertOutcome::Duplicate);
        assert_eq!(count_events(&db).unwrap(), 1);
        assert_eq!(all_events(&db).unwrap()[0].datetime, "2025-05-26_12-00-00");
    }

    #[test]
    fn test_media_urls_stored_as_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("events.db");
        initialize(&db).unwrap();
        insert_event(&db, "2025-05-26_12-00-00", "P1", &urls(&["P1/a.mp4", "P1/a_center.jpg"])).unwrap();

        let conn = Connection::open(&db).unwrap();
        let raw: String = conn
            .query_row("SELECT media_urls FROM event", [], |r| r.get(0))
            .unwrap();
        assert_eq!(raw, r#"["P1/a.mp4","P1/a_center.jpg"]"#);

        let rows = all_events(&db).unwrap();
        assert_eq!(rows[0].media_urls, urls(&["P1/a.mp4", "P1/a_center.jpg"]));
        assert_eq!(rows[0].license_plate, "P1");
    }

    #[test]
    fn test_initialize_is_idempotent_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("events.db");
        initialize(&db).unwrap();
        initialize(&db).unwrap();

        let InsertOutcome::Inserted(id) =
            insert_event(&db, "d", "P", &urls(&["P/x.mp4"])).unwrap()
        else {
            panic!("expected insert");
        };
        assert_eq!(delete_events(&db, &[id]).unwrap(), 1);
        assert_eq!(count_events(&db).unwrap(), 0);
        assert!(insert_event(&db, "d", "P", &[]).is_err());
    }
}
