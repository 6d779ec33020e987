use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Fixed key under which the memory blob is stored.
pub const MEMORY_BLOB_KEY: &str = "memory";

/// Upper bound on rows pulled from SQLite before in-process ranking.
const SEARCH_CANDIDATE_LIMIT: usize = 200;

/// One ingested forum comment, rendered as a self-contained sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct ForumDocument {
    /// `topic_{tid}_comment_{pid}`
    pub doc_id: String,
    pub topic_id: i64,
    pub post_id: i64,
    pub title: String,
    pub username: String,
    pub text: String,
    pub ingested_at: DateTime<Utc>,
}

pub struct AgentDatabase {
    conn: Mutex<Connection>,
}

impl AgentDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_blob (
                key TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS forum_documents (
                doc_id TEXT PRIMARY KEY,
                topic_id INTEGER NOT NULL,
                post_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                username TEXT NOT NULL,
                text TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_forum_documents_topic ON forum_documents(topic_id)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Memory blob
    // ========================================================================

    pub fn get_memory_blob(&self) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT content FROM memory_blob WHERE key = ?1",
            [MEMORY_BLOB_KEY],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(content) => Ok(Some(content)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the whole blob in a single statement.
    pub fn set_memory_blob(&self, content: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO memory_blob (key, content, updated_at) VALUES (?1, ?2, ?3)",
            params![MEMORY_BLOB_KEY, content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Forum documents
    // ========================================================================

    pub fn upsert_document(&self, doc: &ForumDocument) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO forum_documents
             (doc_id, topic_id, post_id, title, username, text, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                doc.doc_id,
                doc.topic_id,
                doc.post_id,
                doc.title,
                doc.username,
                doc.text,
                doc.ingested_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn count_documents(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM forum_documents", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Documents containing any of `terms` (case-insensitive), newest first.
    pub fn find_documents_matching(&self, terms: &[String]) -> Result<Vec<ForumDocument>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let clauses = (1..=terms.len())
            .map(|idx| format!("LOWER(text) LIKE ?{}", idx))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT doc_id, topic_id, post_id, title, username, text, ingested_at
             FROM forum_documents WHERE {} ORDER BY post_id DESC LIMIT {}",
            clauses, SEARCH_CANDIDATE_LIMIT
        );
        let patterns = terms
            .iter()
            .map(|term| format!("%{}%", escape_like(&term.to_lowercase())))
            .collect::<Vec<_>>();

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params_from_iter(patterns.iter()), |row| {
                Ok(ForumDocument {
                    doc_id: row.get(0)?,
                    topic_id: row.get(1)?,
                    post_id: row.get(2)?,
                    title: row.get(3)?,
                    username: row.get(4)?,
                    text: row.get(5)?,
                    ingested_at: parse_rfc3339(row.get::<_, String>(6)?, 6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(docs)
    }
}

/// `%` and `_` in user text match literally; SQLite's LIKE has no default escape,
/// so they are simply dropped.
fn escape_like(term: &str) -> String {
    term.chars().filter(|c| *c != '%' && *c != '_').collect()
}

fn parse_rfc3339(value: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(tid: i64, pid: i64, text: &str) -> ForumDocument {
        ForumDocument {
            doc_id: format!("topic_{}_comment_{}", tid, pid),
            topic_id: tid,
            post_id: pid,
            title: "Title".to_string(),
            username: "alice".to_string(),
            text: text.to_string(),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn memory_blob_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");

        let db = AgentDatabase::new(&path).unwrap();
        assert_eq!(db.get_memory_blob().unwrap(), None);
        db.set_memory_blob("first").unwrap();
        db.set_memory_blob("second").unwrap();
        drop(db);

        let reopened = AgentDatabase::new(&path).unwrap();
        assert_eq!(reopened.get_memory_blob().unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn documents_upsert_by_id_and_match_terms() {
        let dir = tempfile::tempdir().unwrap();
        let db = AgentDatabase::new(dir.path().join("docs.db")).unwrap();

        db.upsert_document(&doc(1, 10, "Rust borrow checker rant")).unwrap();
        db.upsert_document(&doc(1, 11, "Coffee machine broke again")).unwrap();
        db.upsert_document(&doc(1, 10, "Rust borrow checker rant, edited"))
            .unwrap();
        assert_eq!(db.count_documents().unwrap(), 2);

        let found = db
            .find_documents_matching(&["BORROW".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].text.ends_with("edited"));

        let found = db
            .find_documents_matching(&["rust".to_string(), "coffee".to_string()])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].post_id, 11);

        assert!(db.find_documents_matching(&[]).unwrap().is_empty());
    }
}
