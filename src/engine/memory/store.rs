// ── Opsleuth Engine: SQLite Memory Backend ─────────────────────────────────
// Default MemoryBackend: one append-only `memory_events` table in SQLite
// via rusqlite. Records are never updated in place — every save is one
// more event under a namespace, which keeps concurrent writers safe
// without locking beyond the connection mutex.

use crate::atoms::error::EngineResult;
use crate::atoms::traits::MemoryBackend;
use crate::engine::types::MemoryRecord;
use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

/// How many recent candidates to pull per namespace scope before scoring.
const SEARCH_CANDIDATE_CAP: usize = 200;

/// Thread-safe database wrapper.
pub struct SqliteMemoryStore {
    /// The SQLite connection, protected by a Mutex.
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    /// Open (or create) the database at `path` and initialize tables.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        info!("[memory] Opening memory store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init_schema(&conn)?;
        Ok(SqliteMemoryStore { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(SqliteMemoryStore { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> EngineResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_events (
                id         TEXT PRIMARY KEY,
                namespace  TEXT NOT NULL,
                content    TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_events_namespace
                ON memory_events (namespace, created_at);",
        )?;
        Ok(())
    }

    /// Fetch recent events whose namespace equals `namespace` or sits
    /// below it, newest first.
    fn recent_in_scope(&self, namespace: &str, cap: usize) -> EngineResult<Vec<MemoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, namespace, content, created_at FROM memory_events
             WHERE namespace = ?1 OR namespace LIKE ?1 || '/%'
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![namespace, cap as i64], |row| {
            Ok(MemoryRecord {
                id: row.get(0)?,
                namespace: row.get(1)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

/// Score a record against query tokens: hit count over distinct tokens.
/// Zero-token queries match everything (broad retrieval).
fn keyword_score(content: &str, tokens: &[String]) -> usize {
    if tokens.is_empty() {
        return 1;
    }
    let haystack = content.to_lowercase();
    tokens.iter().filter(|t| haystack.contains(t.as_str())).count()
}

fn query_tokens(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 2)
        .collect();
    tokens.dedup();
    tokens
}

#[async_trait]
impl MemoryBackend for SqliteMemoryStore {
    async fn append(&self, namespace: &str, content: &str) -> EngineResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_events (id, namespace, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, namespace, content, created_at],
        )?;
        Ok(id)
    }

    async fn search(
        &self,
        namespace: &str,
        query: &str,
        limit: usize,
    ) -> EngineResult<Vec<MemoryRecord>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let candidates = self.recent_in_scope(namespace, SEARCH_CANDIDATE_CAP)?;
        let tokens = query_tokens(query);

        // Score by token hits; candidates are already newest-first, and the
        // stable sort keeps recency as the tie-breaker.
        let mut scored: Vec<(usize, MemoryRecord)> = candidates
            .into_iter()
            .map(|r| (keyword_score(&r.content, &tokens), r))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(_, r)| r).collect())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_search_exact_namespace() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        store
            .append("/opsleuth/infra/u1/s1", "payment-service runs on k8s cluster prod-east")
            .await
            .unwrap();

        let hits = store
            .search("/opsleuth/infra/u1/s1", "payment cluster", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].namespace, "/opsleuth/infra/u1/s1");
    }

    #[tokio::test]
    async fn test_search_scope_covers_subnamespaces() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        store
            .append("/opsleuth/infra/u1/s1", "redis cache in session one")
            .await
            .unwrap();
        store
            .append("/opsleuth/infra/u1/s2", "redis cache in session two")
            .await
            .unwrap();
        store
            .append("/opsleuth/infra/u2/s1", "redis cache of another actor")
            .await
            .unwrap();

        // Cross-session scope sees both of u1's sessions, not u2's
        let broad = store.search("/opsleuth/infra/u1", "redis", 10).await.unwrap();
        assert_eq!(broad.len(), 2);

        // Session scope is strictly narrower
        let narrow = store
            .search("/opsleuth/infra/u1/s1", "redis", 10)
            .await
            .unwrap();
        assert_eq!(narrow.len(), 1);
    }

    #[tokio::test]
    async fn test_prefix_does_not_leak_across_sibling_actors() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        store.append("/opsleuth/infra/u1", "fact about u1").await.unwrap();
        store.append("/opsleuth/infra/u10", "fact about u10").await.unwrap();

        let hits = store.search("/opsleuth/infra/u1", "fact", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "fact about u1");
    }

    #[tokio::test]
    async fn test_unmatched_tokens_filtered_out() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        store
            .append("/opsleuth/users/u1/preferences", "prefers slack alerts")
            .await
            .unwrap();

        let hits = store
            .search("/opsleuth/users/u1/preferences", "kubernetes pods", 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_is_broad() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        store
            .append("/opsleuth/users/u1/preferences", "prefers slack alerts")
            .await
            .unwrap();

        let hits = store
            .search("/opsleuth/users/u1/preferences", "", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
