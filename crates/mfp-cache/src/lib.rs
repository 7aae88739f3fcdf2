//! Durable snippet cache for MFP.
//!
//! A single SQLite table keyed by `id = sha256(normalize(code))`, so
//! whitespace variants of one snippet share an entry. Entries carry a TTL
//! measured from `last_used_at`; an expired entry is logically absent and is
//! physically removed the next time it is touched. After every `put` the
//! store evicts oldest-by-`last_used_at` entries down to `max_entries`.
//!
//! Writers serialize through a mutex around the connection; every statement
//! is short-running. Only successful executions are ever inserted.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use mfp_types::CacheEntry;

/// Default TTL for cached snippets, in seconds (7 days).
pub const DEFAULT_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Default bound on the number of cached snippets.
pub const DEFAULT_MAX_ENTRIES: usize = 1_000;

const COLUMNS: &str =
    "id, code, description, servers_used, success, result_summary, created_at, last_used_at, use_count, ttl_seconds";

/// Cache size snapshot for diagnostics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub path: PathBuf,
}

/// The snippet store. One process owns the database file.
#[derive(Debug)]
pub struct SnippetCache {
    conn: Mutex<Connection>,
    path: PathBuf,
    max_entries: usize,
}

impl SnippetCache {
    /// Open (or create) the cache at `path` and run schema initialization.
    pub fn open(path: &Path, max_entries: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache db {}", path.display()))?;
        initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            max_entries: max_entries.max(1),
        })
    }

    /// In-memory cache for tests and ephemeral runs.
    pub fn open_in_memory(max_entries: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory cache")?;
        initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            max_entries: max_entries.max(1),
        })
    }

    /// Upsert a successful snippet and return its id.
    ///
    /// On a fresh insert `use_count` starts at 1. Hitting an existing id
    /// bumps `use_count`, refreshes `last_used_at`, and overwrites the
    /// metadata (last writer wins). Eviction runs after every put.
    pub fn put(
        &self,
        code: &str,
        description: &str,
        servers_used: &[String],
        result_summary: &str,
        ttl_seconds: u64,
    ) -> Result<String> {
        let id = mfp_hash::code_id(code);
        let now = Utc::now().timestamp();
        let servers = serde_json::to_string(servers_used).context("serialize servers_used")?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO snippets \
             (id, code, description, servers_used, success, result_summary, created_at, last_used_at, use_count, ttl_seconds) \
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6, 1, ?7) \
             ON CONFLICT(id) DO UPDATE SET \
               description = excluded.description, \
               servers_used = excluded.servers_used, \
               result_summary = excluded.result_summary, \
               last_used_at = excluded.last_used_at, \
               ttl_seconds = excluded.ttl_seconds, \
               use_count = use_count + 1",
            params![id, code, description, servers, result_summary, now, ttl_seconds as i64],
        )
        .context("cache put failed")?;

        evict_lru(&conn, self.max_entries)?;
        Ok(id)
    }

    /// Fetch an entry by id, bumping `last_used_at` and `use_count` on a hit.
    /// An expired entry is deleted and reported as a miss. An age of exactly
    /// `ttl_seconds` is still a hit.
    pub fn get(&self, id: &str) -> Result<Option<CacheEntry>> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;

        let entry: Option<CacheEntry> = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM snippets WHERE id = ?1"),
                params![id],
                row_to_entry,
            )
            .optional()
            .context("cache get failed")?;

        let Some(entry) = entry else {
            return Ok(None);
        };
        if entry.is_expired_at(now) {
            conn.execute("DELETE FROM snippets WHERE id = ?1", params![id])
                .context("failed to remove expired entry")?;
            return Ok(None);
        }

        conn.execute(
            "UPDATE snippets SET last_used_at = ?1, use_count = use_count + 1 WHERE id = ?2",
            params![now, id],
        )
        .context("failed to touch cache entry")?;

        Ok(Some(CacheEntry {
            last_used_at: now,
            use_count: entry.use_count + 1,
            ..entry
        }))
    }

    /// Case-insensitive substring search over descriptions, newest first,
    /// restricted to non-expired entries at the storage layer.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<CacheEntry>> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM snippets \
                 WHERE instr(lower(description), lower(?1)) > 0 \
                   AND (?2 - last_used_at) <= ttl_seconds \
                 ORDER BY last_used_at DESC \
                 LIMIT ?3"
            ))
            .context("prepare cache search")?;

        let rows = stmt
            .query_map(params![query, now, limit as i64], row_to_entry)
            .context("cache search failed")?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("cache search row failed")?);
        }
        Ok(entries)
    }

    /// Number of physically present entries (including not-yet-reaped
    /// expired ones).
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM snippets", [], |row| row.get(0))
            .context("cache count failed")?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats { entries: self.len()?, path: self.path.clone() })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("cache mutex poisoned"))
    }

    #[cfg(test)]
    fn force_last_used_at(&self, id: &str, last_used_at: i64) {
        let conn = self.conn.lock().expect("lock");
        conn.execute(
            "UPDATE snippets SET last_used_at = ?1 WHERE id = ?2",
            params![last_used_at, id],
        )
        .expect("force last_used_at");
    }
}

/// Expected columns and the DDL fragment used when one has to be added to an
/// older database.
const SCHEMA_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT PRIMARY KEY"),
    ("code", "TEXT NOT NULL DEFAULT ''"),
    ("description", "TEXT NOT NULL DEFAULT ''"),
    ("servers_used", "TEXT NOT NULL DEFAULT '[]'"),
    ("success", "INTEGER NOT NULL DEFAULT 1"),
    ("result_summary", "TEXT NOT NULL DEFAULT ''"),
    ("created_at", "INTEGER NOT NULL DEFAULT 0"),
    ("last_used_at", "INTEGER NOT NULL DEFAULT 0"),
    ("use_count", "INTEGER NOT NULL DEFAULT 1"),
    ("ttl_seconds", "INTEGER NOT NULL DEFAULT 604800"),
];

fn create_table_sql() -> String {
    let columns: Vec<String> = SCHEMA_COLUMNS
        .iter()
        .map(|(name, ddl)| format!("{name} {ddl}"))
        .collect();
    format!("CREATE TABLE IF NOT EXISTS snippets ({})", columns.join(", "))
}

/// Create the schema if absent. If an existing table is missing columns
/// (an older layout), try `ALTER TABLE ... ADD COLUMN`; if that fails, drop
/// and recreate.
fn initialize(conn: &Connection) -> Result<()> {
    conn.execute(&create_table_sql(), [])
        .context("failed to create snippets table")?;

    let existing = table_columns(conn)?;
    let missing: Vec<&(&str, &str)> = SCHEMA_COLUMNS
        .iter()
        .filter(|(name, _)| !existing.iter().any(|c| c == name))
        .collect();

    if !missing.is_empty() {
        let mut altered = true;
        for (name, ddl) in &missing {
            if conn
                .execute(&format!("ALTER TABLE snippets ADD COLUMN {name} {ddl}"), [])
                .is_err()
            {
                altered = false;
                break;
            }
        }
        if !altered {
            conn.execute("DROP TABLE snippets", [])
                .context("failed to drop mismatched snippets table")?;
            conn.execute(&create_table_sql(), [])
                .context("failed to recreate snippets table")?;
        }
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snippets_last_used ON snippets (last_used_at)",
        [],
    )
    .context("failed to create cache index")?;
    Ok(())
}

fn table_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(snippets)")
        .context("pragma table_info")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .context("read table_info")?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.context("table_info row")?);
    }
    Ok(columns)
}

/// Delete oldest entries by `last_used_at` until the bound holds.
fn evict_lru(conn: &Connection, max_entries: usize) -> Result<()> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM snippets", [], |row| row.get(0))
        .context("cache count failed")?;
    let excess = count - max_entries as i64;
    if excess > 0 {
        conn.execute(
            "DELETE FROM snippets WHERE id IN \
             (SELECT id FROM snippets ORDER BY last_used_at ASC, id ASC LIMIT ?1)",
            params![excess],
        )
        .context("cache eviction failed")?;
    }
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let servers_json: String = row.get(3)?;
    Ok(CacheEntry {
        id: row.get(0)?,
        code: row.get(1)?,
        description: row.get(2)?,
        servers_used: serde_json::from_str(&servers_json).unwrap_or_default(),
        success: row.get::<_, i64>(4)? != 0,
        result_summary: row.get(5)?,
        created_at: row.get(6)?,
        last_used_at: row.get(7)?,
        use_count: row.get::<_, i64>(8)? as u64,
        ttl_seconds: row.get::<_, i64>(9)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SnippetCache {
        SnippetCache::open_in_memory(DEFAULT_MAX_ENTRIES).expect("cache")
    }

    #[test]
    fn put_then_get_roundtrips_code() {
        let cache = cache();
        let code = "from weather.functions import get_forecast\nprint(get_forecast('Oslo'))";
        let id = cache
            .put(code, "forecast for Oslo", &["weather".to_string()], "ok", 3600)
            .expect("put");

        let entry = cache.get(&id).expect("get").expect("hit");
        assert_eq!(entry.code, code);
        assert_eq!(entry.description, "forecast for Oslo");
        assert_eq!(entry.servers_used, vec!["weather".to_string()]);
        assert!(entry.success);
    }

    #[test]
    fn id_is_stable_under_whitespace_variants() {
        let cache = cache();
        let a = cache.put("x = 1\n\ny = 2", "v1", &[], "", 3600).expect("put");
        let b = cache.put("x = 1\r\ny = 2\r\n", "v2", &[], "", 3600).expect("put");
        assert_eq!(a, b);
        assert_eq!(cache.len().expect("len"), 1);
    }

    #[test]
    fn repeat_put_bumps_use_count_and_overwrites_metadata() {
        let cache = cache();
        let id = cache.put("x = 1", "first", &[], "r1", 3600).expect("put");
        cache.put("x = 1", "second", &[], "r2", 7200).expect("put");

        let entry = cache.get(&id).expect("get").expect("hit");
        // One insert, one conflict-update, one get touch.
        assert_eq!(entry.use_count, 3);
        assert_eq!(entry.description, "second");
        assert_eq!(entry.result_summary, "r2");
        assert_eq!(entry.ttl_seconds, 7200);
    }

    #[test]
    fn get_bumps_use_count_monotonically() {
        let cache = cache();
        let id = cache.put("x = 1", "d", &[], "", 3600).expect("put");
        let first = cache.get(&id).expect("get").expect("hit");
        let second = cache.get(&id).expect("get").expect("hit");
        assert!(second.use_count > first.use_count);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let cache = cache();
        let id = cache.put("x = 1", "d", &[], "", 60).expect("put");
        let now = Utc::now().timestamp();

        // Age ttl (with a second of slack so a clock tick mid-test cannot
        // flip the verdict): still a hit.
        cache.force_last_used_at(&id, now - 59);
        assert!(cache.get(&id).expect("get").is_some());

        // Past ttl: miss, and the row is physically removed.
        cache.force_last_used_at(&id, now - 62);
        assert!(cache.get(&id).expect("get").is_none());
        assert_eq!(cache.len().expect("len"), 0);
    }

    #[test]
    fn search_matches_description_case_insensitively() {
        let cache = cache();
        cache.put("a = 1", "Fetch Oslo forecast", &[], "", 3600).expect("put");
        cache.put("b = 2", "list petstore pets", &[], "", 3600).expect("put");

        let hits = cache.search("OSLO", 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].description, "Fetch Oslo forecast");
    }

    #[test]
    fn search_excludes_expired_entries() {
        let cache = cache();
        let id = cache.put("a = 1", "stale entry", &[], "", 60).expect("put");
        cache.force_last_used_at(&id, Utc::now().timestamp() - 120);

        assert!(cache.search("stale", 10).expect("search").is_empty());
    }

    #[test]
    fn search_orders_by_recency_and_caps_at_limit() {
        let cache = cache();
        let now = Utc::now().timestamp();
        for i in 0..5 {
            let id = cache
                .put(&format!("x = {i}"), "common description", &[], "", 3600)
                .expect("put");
            cache.force_last_used_at(&id, now - 100 + i);
        }

        let hits = cache.search("common", 3).expect("search");
        assert_eq!(hits.len(), 3);
        assert!(hits[0].last_used_at >= hits[1].last_used_at);
        assert!(hits[1].last_used_at >= hits[2].last_used_at);
    }

    #[test]
    fn eviction_removes_oldest_entry_once_over_bound() {
        let cache = SnippetCache::open_in_memory(3).expect("cache");
        let now = Utc::now().timestamp();

        let mut ids = Vec::new();
        for i in 0..3 {
            let id = cache.put(&format!("x = {i}"), "d", &[], "", 3600).expect("put");
            cache.force_last_used_at(&id, now - 100 + i);
            ids.push(id);
        }
        assert_eq!(cache.len().expect("len"), 3);

        // The 4th put evicts exactly one entry: the oldest.
        cache.put("x = 99", "d", &[], "", 3600).expect("put");
        assert_eq!(cache.len().expect("len"), 3);
        assert!(cache.get(&ids[0]).expect("get").is_none());
        assert!(cache.get(&ids[1]).expect("get").is_some());
    }

    #[test]
    fn persists_across_reopen() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("cache.db");

        let id = {
            let cache = SnippetCache::open(&path, 10).expect("open");
            cache.put("x = 1", "durable", &[], "", 3600).expect("put")
        };

        let cache = SnippetCache::open(&path, 10).expect("reopen");
        let entry = cache.get(&id).expect("get").expect("hit");
        assert_eq!(entry.description, "durable");
    }

    #[test]
    fn initialize_migrates_older_schema() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("cache.db");

        // Seed an older layout missing several columns.
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute(
                "CREATE TABLE snippets (id TEXT PRIMARY KEY, code TEXT NOT NULL DEFAULT '')",
                [],
            )
            .expect("create old table");
            conn.execute(
                "INSERT INTO snippets (id, code) VALUES ('old-id', 'x = 1')",
                [],
            )
            .expect("insert old row");
        }

        let cache = SnippetCache::open(&path, 10).expect("open migrated");
        // The migrated table accepts the full shape.
        let id = cache.put("y = 2", "after migration", &[], "", 3600).expect("put");
        assert!(cache.get(&id).expect("get").is_some());
    }

    #[test]
    fn stats_reports_entry_count() {
        let cache = cache();
        cache.put("x = 1", "d", &[], "", 3600).expect("put");
        let stats = cache.stats().expect("stats");
        assert_eq!(stats.entries, 1);
    }
}
