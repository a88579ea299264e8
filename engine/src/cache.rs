// --- Content cache -----------------------------------------------------------
//
// Maps a remote content reference to a durable local file.
//
// - Cache-first: a verified entry is returned without touching the network.
// - Fetches go to `<key>.<rand>.tmp` and are renamed into place only once
//   complete, so a crash never leaves a partial file that looks valid.
// - The entry index lives in SQLite (cache_entries in state.db).
// - One fetch per reference at a time (per-key lock); concurrent callers for
//   the same reference wait and then hit the cache.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio::time::Duration;

use crate::error::AgentError;
use crate::store::{now_rfc3339, open_db};

/// Anything smaller than this is treated as a failed download.
pub const MIN_VALID_BYTES: u64 = 1024;

pub fn cache_key(reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    hex::encode(hasher.finalize())
}

fn extension_of(reference: &str) -> String {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "mp3".to_string(),
    }
}

pub fn file_name_for(reference: &str) -> String {
    format!("{}.{}", cache_key(reference), extension_of(reference))
}

fn local_path_of(reference: &str) -> Option<PathBuf> {
    let raw = reference.strip_prefix("file://").unwrap_or(reference);
    let p = Path::new(raw);
    p.is_absolute().then(|| p.to_path_buf())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub reference: String,
    pub local_path: PathBuf,
    pub verified: bool,
    pub size_bytes: u64,
    pub last_fetch_attempt: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Delay after failed attempt `n` (1-based): doubling, with ±25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
        let jitter = 0.75 + fastrand::f64() * 0.5;
        Duration::from_millis((base * jitter).round() as u64)
    }
}

/// Network seam. Writes the body of `reference` to `dest`, returns bytes written.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, reference: &str, dest: &Path) -> Result<u64, AgentError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, reference: &str, dest: &Path) -> Result<u64, AgentError> {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;

        let response = self.client.get(reference).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| AgentError::content_unavailable(reference, format!("create {}: {e}", dest.display())))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AgentError::content_unavailable(reference, format!("write: {e}")))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| AgentError::content_unavailable(reference, format!("flush: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| AgentError::content_unavailable(reference, format!("sync: {e}")))?;
        Ok(written)
    }
}

pub struct ContentCache {
    dir: PathBuf,
    db_path: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    policy: std::sync::Mutex<RetryPolicy>,
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    warm: std::sync::Mutex<WarmQueue>,
}

/// At most one warm-up runs; the newest list asked for meanwhile waits here.
#[derive(Default)]
struct WarmQueue {
    running: bool,
    pending: Option<Vec<String>>,
}

impl ContentCache {
    /// Opens the cache directory and index, removing stray temp files.
    pub async fn open(
        dir: PathBuf,
        db_path: PathBuf,
        fetcher: Arc<dyn Fetcher>,
        policy: RetryPolicy,
    ) -> anyhow::Result<Arc<Self>> {
        let (d, p) = (dir.clone(), db_path.clone());
        let removed = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            std::fs::create_dir_all(&d)?;
            open_db(&p)?;
            let mut removed = 0;
            for entry in std::fs::read_dir(&d)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "tmp") {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!("could not remove stale temp file {}: {e}", path.display());
                    } else {
                        removed += 1;
                    }
                }
            }
            Ok(removed)
        })
        .await??;

        if removed > 0 {
            tracing::info!("removed {removed} stale temp file(s) from {}", dir.display());
        }

        Ok(Arc::new(Self {
            dir,
            db_path,
            fetcher,
            policy: std::sync::Mutex::new(policy),
            locks: tokio::sync::Mutex::new(HashMap::new()),
            warm: std::sync::Mutex::new(WarmQueue::default()),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    fn policy(&self) -> RetryPolicy {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn key_lock(&self, reference: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(reference.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn with_db<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_db(&path)?;
            f(&conn)
        })
        .await?
    }

    pub async fn entry(&self, reference: &str) -> Option<CacheEntry> {
        let r = reference.to_string();
        self.with_db(move |conn| db_get_entry(conn, &r))
            .await
            .map_err(|e| tracing::warn!("cache index lookup failed: {e}"))
            .ok()
            .flatten()
    }

    /// Verified entry whose file is still present and plausible.
    async fn valid_cached(&self, reference: &str) -> Option<PathBuf> {
        let final_path = self.dir.join(file_name_for(reference));
        let entry = self.entry(reference).await;

        if let Some(entry) = &entry {
            if entry.verified {
                if file_is_valid(&entry.local_path).await {
                    return Some(entry.local_path.clone());
                }
                tracing::warn!(
                    "cached file for {reference} is missing or truncated, demoting entry"
                );
                let r = reference.to_string();
                let _ = self
                    .with_db(move |conn| db_demote(conn, &r))
                    .await
                    .map_err(|e| tracing::warn!("failed to demote cache entry: {e}"));
                return None;
            }
        }

        // A complete file without an index row (index lost): adopt it.
        if entry.is_none() && file_is_valid(&final_path).await {
            let size = file_size(&final_path).await;
            self.record_success(reference, &final_path, size).await;
            return Some(final_path);
        }
        None
    }

    pub async fn is_cached(&self, reference: &str) -> bool {
        if let Some(local) = local_path_of(reference) {
            return local.exists();
        }
        self.valid_cached(reference).await.is_some()
    }

    /// Cache-or-fetch. Network I/O happens only on a miss.
    pub async fn resolve(&self, reference: &str) -> Result<PathBuf, AgentError> {
        if let Some(local) = local_path_of(reference) {
            return if tokio::fs::metadata(&local).await.is_ok() {
                Ok(local)
            } else {
                Err(AgentError::content_unavailable(reference, "local file not found"))
            };
        }

        let lock = self.key_lock(reference).await;
        let _guard = lock.lock().await;

        if let Some(path) = self.valid_cached(reference).await {
            return Ok(path);
        }

        let policy = self.policy();
        let final_path = self.dir.join(file_name_for(reference));
        let mut last_err = String::from("no attempt made");

        for attempt in 1..=policy.attempts {
            let tmp = self.dir.join(format!(
                "{}.{:08x}.tmp",
                file_name_for(reference),
                fastrand::u32(..)
            ));

            match self.fetcher.fetch(reference, &tmp).await {
                Ok(size) if size >= MIN_VALID_BYTES => {
                    if let Err(e) = tokio::fs::rename(&tmp, &final_path).await {
                        last_err = format!("rename failed: {e}");
                        let _ = tokio::fs::remove_file(&tmp).await;
                    } else {
                        self.record_success(reference, &final_path, size).await;
                        tracing::info!("cached {reference} ({size} bytes)");
                        return Ok(final_path);
                    }
                }
                Ok(size) => {
                    last_err = format!("download too small ({size} bytes)");
                    let _ = tokio::fs::remove_file(&tmp).await;
                }
                Err(e) => {
                    last_err = e.to_string();
                    let _ = tokio::fs::remove_file(&tmp).await;
                }
            }

            tracing::debug!(
                "fetch attempt {attempt}/{} for {reference} failed: {last_err}",
                policy.attempts
            );
            if attempt < policy.attempts {
                tokio::time::sleep(policy.delay(attempt)).await;
            }
        }

        let r = reference.to_string();
        let _ = self
            .with_db(move |conn| db_touch_attempt(conn, &r))
            .await
            .map_err(|e| tracing::warn!("failed to record fetch attempt: {e}"));

        Err(AgentError::content_unavailable(reference, last_err))
    }

    async fn record_success(&self, reference: &str, path: &Path, size: u64) {
        let entry = CacheEntry {
            reference: reference.to_string(),
            local_path: path.to_path_buf(),
            verified: true,
            size_bytes: size,
            last_fetch_attempt: now_rfc3339(),
        };
        let _ = self
            .with_db(move |conn| db_upsert_entry(conn, &entry))
            .await
            .map_err(|e| tracing::warn!("failed to record cache entry: {e}"));
    }

    /// Evicts entries and files no longer referenced. Returns files removed.
    pub async fn retain(&self, keep: &HashSet<String>) -> anyhow::Result<usize> {
        let keep_refs = keep.clone();
        let keep_files: HashSet<String> = keep.iter().map(|r| file_name_for(r)).collect();
        let dir = self.dir.clone();

        let removed = self
            .with_db(move |conn| -> anyhow::Result<usize> {
                let mut removed = 0;
                for entry in db_all_entries(conn)? {
                    if !keep_refs.contains(&entry.reference) {
                        db_delete_entry(conn, &entry.reference)?;
                    }
                }
                for file in std::fs::read_dir(&dir)? {
                    let path = file?.path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if name.ends_with(".tmp") || keep_files.contains(name) || !path.is_file() {
                        continue;
                    }
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => tracing::warn!("could not evict {}: {e}", path.display()),
                    }
                }
                Ok(removed)
            })
            .await?;

        self.locks.lock().await.retain(|r, _| keep.contains(r));
        if removed > 0 {
            tracing::info!("evicted {removed} unreferenced file(s) from cache");
        }
        Ok(removed)
    }

    /// Background download of `references` in order. One warm-up at a time:
    /// a request made while one runs is queued, replacing any older queued
    /// list, and starts as soon as the running one ends.
    ///
    /// Returns `true` when a new warm-up task was started.
    pub fn spawn_warm(self: &Arc<Self>, references: Vec<String>) -> bool {
        {
            let mut warm = self.warm.lock().unwrap_or_else(|e| e.into_inner());
            if warm.running {
                tracing::debug!("cache warm-up running, queued {} item(s)", references.len());
                warm.pending = Some(references);
                return false;
            }
            warm.running = true;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut references = references;
            loop {
                let mut ok = 0usize;
                let total = references.len();
                for reference in &references {
                    match cache.resolve(reference).await {
                        Ok(_) => ok += 1,
                        Err(e) => tracing::debug!("warm-up skipped: {e}"),
                    }
                }
                tracing::info!("cache warm-up finished: {ok}/{total} available");

                let mut warm = cache.warm.lock().unwrap_or_else(|e| e.into_inner());
                match warm.pending.take() {
                    Some(next) => references = next,
                    None => {
                        warm.running = false;
                        break;
                    }
                }
            }
        });
        true
    }

    pub fn spawn_prefetch(self: &Arc<Self>, reference: String) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = cache.resolve(&reference).await {
                tracing::debug!("prefetch failed: {e}");
            }
        });
    }
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn file_is_valid(path: &Path) -> bool {
    file_size(path).await >= MIN_VALID_BYTES
}

// --- cache_entries table -----------------------------------------------------

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        reference: row.get(0)?,
        local_path: PathBuf::from(row.get::<_, String>(1)?),
        verified: row.get::<_, i64>(2)? != 0,
        size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
        last_fetch_attempt: row.get(4)?,
    })
}

fn db_get_entry(conn: &Connection, reference: &str) -> anyhow::Result<Option<CacheEntry>> {
    Ok(conn
        .query_row(
            "SELECT reference, local_path, verified, size_bytes, last_fetch_attempt
             FROM cache_entries WHERE reference = ?1",
            params![reference],
            row_to_entry,
        )
        .optional()?)
}

fn db_all_entries(conn: &Connection) -> anyhow::Result<Vec<CacheEntry>> {
    let mut stmt = conn.prepare(
        "SELECT reference, local_path, verified, size_bytes, last_fetch_attempt FROM cache_entries",
    )?;
    let rows = stmt.query_map([], row_to_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn db_upsert_entry(conn: &Connection, e: &CacheEntry) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO cache_entries (reference, local_path, verified, size_bytes, last_fetch_attempt)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(reference) DO UPDATE SET
            local_path = excluded.local_path,
            verified = excluded.verified,
            size_bytes = excluded.size_bytes,
            last_fetch_attempt = excluded.last_fetch_attempt",
        params![
            e.reference,
            e.local_path.to_string_lossy(),
            e.verified as i64,
            e.size_bytes as i64,
            e.last_fetch_attempt
        ],
    )?;
    Ok(())
}

fn db_demote(conn: &Connection, reference: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE cache_entries SET verified = 0 WHERE reference = ?1",
        params![reference],
    )?;
    Ok(())
}

fn db_touch_attempt(conn: &Connection, reference: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE cache_entries SET last_fetch_attempt = ?2 WHERE reference = ?1",
        params![reference, now_rfc3339()],
    )?;
    Ok(())
}

fn db_delete_entry(conn: &Connection, reference: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM cache_entries WHERE reference = ?1",
        params![reference],
    )?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    const A: &str = "https://cdn.example.com/music/a.mp3";
    const B: &str = "https://cdn.example.com/music/b.ogg?sig=1";

    fn no_tmp_files(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .unwrap()
            .all(|e| !e.unwrap().path().to_string_lossy().ends_with(".tmp"))
    }

    #[test]
    fn file_names_are_hashed_and_keep_audio_extensions() {
        assert_eq!(cache_key(A).len(), 64);
        assert_eq!(file_name_for(A), format!("{}.mp3", cache_key(A)));
        assert_eq!(file_name_for(B), format!("{}.ogg", cache_key(B)));
        assert!(file_name_for("https://x/stream").ends_with(".mp3"));
    }

    #[test]
    fn backoff_doubles_within_jitter() {
        let p = RetryPolicy::new(3, 400);
        for _ in 0..20 {
            let d1 = p.delay(1).as_millis();
            let d3 = p.delay(3).as_millis();
            assert!((300..=500).contains(&d1), "{d1}");
            assert!((1200..=2000).contains(&d3), "{d3}");
        }
    }

    #[tokio::test]
    async fn cached_content_resolves_offline_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MemoryFetcher::with(&[(A, 4096)]);
        let cache = open_cache(dir.path(), fetcher.clone()).await;

        let first = cache.resolve(A).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        fetcher.set_offline(true);
        let second = cache.resolve(A).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
        assert!(cache.is_cached(A).await);

        // Survives a reopen (durable index).
        let reopened = open_cache(dir.path(), fetcher.clone()).await;
        assert_eq!(reopened.resolve(A).await.unwrap(), first);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_content_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MemoryFetcher::with(&[(A, 4096)]);
        fetcher.set_offline(true);
        let cache = open_cache(dir.path(), fetcher.clone()).await;

        let err = cache.resolve(A).await.unwrap_err();
        assert!(matches!(err, AgentError::ContentUnavailable { .. }));
        assert_eq!(fetcher.calls(), 3);
        assert!(no_tmp_files(cache.dir()));
        assert!(!cache.is_cached(A).await);
    }

    #[tokio::test]
    async fn partial_downloads_never_become_cache_entries() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MemoryFetcher::with(&[(A, 4096), (B, 100)]);
        fetcher.fail_next.store(2, Ordering::SeqCst);
        let cache = open_cache(dir.path(), fetcher.clone()).await;

        let path = cache.resolve(A).await.unwrap();
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert!(no_tmp_files(cache.dir()));

        // Below the minimum size: rejected every attempt.
        assert!(cache.resolve(B).await.is_err());
        assert!(!cache.dir().join(file_name_for(B)).exists());
    }

    #[tokio::test]
    async fn stale_temp_files_are_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("audio_cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("abc.mp3.1234.tmp"), b"junk").unwrap();

        let cache = open_cache(dir.path(), MemoryFetcher::with(&[])).await;
        assert!(no_tmp_files(cache.dir()));
    }

    #[tokio::test]
    async fn vanished_file_is_demoted_and_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MemoryFetcher::with(&[(A, 2048)]);
        let cache = open_cache(dir.path(), fetcher.clone()).await;

        let path = cache.resolve(A).await.unwrap();
        std::fs::write(&path, b"tiny").unwrap();

        assert!(!cache.is_cached(A).await);
        assert!(!cache.entry(A).await.unwrap().verified);

        let again = cache.resolve(A).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.entry(A).await.unwrap().verified);
    }

    #[tokio::test]
    async fn local_paths_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("jingle.wav");
        std::fs::write(&local, b"RIFF").unwrap();
        let fetcher = MemoryFetcher::with(&[]);
        let cache = open_cache(dir.path(), fetcher.clone()).await;

        assert_eq!(cache.resolve(local.to_str().unwrap()).await.unwrap(), local);
        assert!(cache.resolve("/nope/missing.mp3").await.is_err());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn retain_evicts_unreferenced_content() {
        let dir = tempfile::tempdir().unwrap();
        let b = "https://cdn.example.com/music/b.mp3";
        let fetcher = MemoryFetcher::with(&[(A, 2048), (b, 2048)]);
        let cache = open_cache(dir.path(), fetcher.clone()).await;
        cache.resolve(A).await.unwrap();
        let b_path = cache.resolve(b).await.unwrap();

        let keep: HashSet<String> = [A.to_string()].into_iter().collect();
        assert_eq!(cache.retain(&keep).await.unwrap(), 1);
        assert!(!b_path.exists());
        assert!(cache.entry(b).await.is_none());
        assert!(cache.is_cached(A).await);
    }

    #[tokio::test]
    async fn warm_up_requested_while_busy_runs_for_the_newest_list() {
        let dir = tempfile::tempdir().unwrap();
        let b = "https://cdn.example.com/music/b.mp3";
        let c = "https://cdn.example.com/music/c.mp3";
        let fetcher = MemoryFetcher::with(&[(A, 2048), (b, 2048), (c, 2048)]);
        fetcher.delay_ms.store(50, Ordering::SeqCst);
        let cache = open_cache(dir.path(), fetcher.clone()).await;

        assert!(cache.spawn_warm(vec![A.to_string()]));
        assert!(!cache.spawn_warm(vec![b.to_string()]));
        assert!(!cache.spawn_warm(vec![A.to_string(), c.to_string()]));

        for _ in 0..200 {
            if !cache.warm.lock().unwrap().running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!cache.warm.lock().unwrap().running);
        assert!(cache.is_cached(A).await);
        assert!(cache.is_cached(c).await);
        // Superseded before it started.
        assert!(!cache.is_cached(b).await);
        assert_eq!(fetcher.calls(), 2);

        assert!(cache.spawn_warm(vec![b.to_string()]));
    }

    #[tokio::test]
    async fn concurrent_resolves_fetch_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MemoryFetcher::with(&[(A, 4096)]);
        let cache = open_cache(dir.path(), fetcher.clone()).await;

        let (x, y) = tokio::join!(cache.resolve(A), cache.resolve(A));
        assert_eq!(x.unwrap(), y.unwrap());
        assert_eq!(fetcher.calls(), 1);
    }
}
