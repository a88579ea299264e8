// --- SQLite persistence ------------------------------------------------------
//
// state.db holds two small tables:
// - playback_state: a single-row checkpoint of the scheduler (resume support)
// - cache_entries:  the content cache index (owned by `cache`)
//
// rusqlite is synchronous. Async callers go through spawn_blocking and open a
// fresh connection per operation; writes are rare (mode transitions plus a
// periodic checkpoint) so connection reuse buys nothing here.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::PlaybackMode;

pub fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS playback_state (
            id               INTEGER PRIMARY KEY CHECK (id = 1),
            mode             TEXT NOT NULL,
            track_index      INTEGER NOT NULL,
            ad_index         INTEGER NOT NULL,
            position         REAL NOT NULL,
            volume           INTEGER NOT NULL,
            track_reference  TEXT,
            saved_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            reference           TEXT PRIMARY KEY,
            local_path          TEXT NOT NULL,
            verified            INTEGER NOT NULL,
            size_bytes          INTEGER NOT NULL,
            last_fetch_attempt  TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

pub fn open_db(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    db_init(&conn)?;
    Ok(conn)
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// What survives a restart of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub mode: PlaybackMode,
    pub track_index: usize,
    pub ad_index: usize,
    /// Track position in seconds (never an ad position).
    pub position: f64,
    pub volume: u8,
    pub track_reference: Option<String>,
}

pub fn db_load_checkpoint(conn: &Connection) -> anyhow::Result<Option<Checkpoint>> {
    let row = conn
        .query_row(
            "SELECT mode, track_index, ad_index, position, volume, track_reference
             FROM playback_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((mode, track_index, ad_index, position, volume, track_reference)) = row else {
        return Ok(None);
    };
    let mode = PlaybackMode::parse(&mode)
        .ok_or_else(|| anyhow::anyhow!("invalid playback mode in checkpoint: {mode}"))?;

    Ok(Some(Checkpoint {
        mode,
        track_index: track_index.max(0) as usize,
        ad_index: ad_index.max(0) as usize,
        position: if position.is_finite() { position.max(0.0) } else { 0.0 },
        volume: volume.clamp(0, 100) as u8,
        track_reference,
    }))
}

pub fn db_save_checkpoint(conn: &Connection, cp: &Checkpoint) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO playback_state (id, mode, track_index, ad_index, position, volume, track_reference, saved_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            mode = excluded.mode,
            track_index = excluded.track_index,
            ad_index = excluded.ad_index,
            position = excluded.position,
            volume = excluded.volume,
            track_reference = excluded.track_reference,
            saved_at = excluded.saved_at",
        params![
            cp.mode.status_str(),
            cp.track_index as i64,
            cp.ad_index as i64,
            cp.position,
            i64::from(cp.volume),
            cp.track_reference,
            now_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Startup load. A corrupt or unreadable checkpoint is logged and ignored.
pub async fn load_checkpoint(path: PathBuf) -> Option<Checkpoint> {
    let res = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Checkpoint>> {
        let conn = open_db(&path)?;
        db_load_checkpoint(&conn)
    })
    .await;

    match res {
        Ok(Ok(cp)) => cp,
        Ok(Err(e)) => {
            tracing::warn!("failed to load playback checkpoint, starting fresh: {e}");
            None
        }
        Err(e) => {
            tracing::warn!("failed to join checkpoint load task, starting fresh: {e}");
            None
        }
    }
}

pub async fn persist_checkpoint(path: PathBuf, cp: Checkpoint) {
    let _ = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let conn = open_db(&path)?;
        db_save_checkpoint(&conn, &cp)?;
        Ok(())
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))
    .and_then(|x| x)
    .map_err(|e| tracing::warn!("failed to persist playback checkpoint: {e}"));
}
