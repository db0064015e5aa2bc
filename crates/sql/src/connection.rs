//! Connection lifecycle: open/close, typed prepared statements, and
//! transaction scopes with guaranteed rollback/release on every exit path.
//!
//! The cache is ephemeral and single-process: the database file is
//! recreated on every start rather than meant to survive across runs.

use crate::error::{QueryError, SqlResult};
use rusqlite::Connection as RusqliteConnection;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Single process-wide SQLite connection. Writes are serialized through this
/// one connection; reads use short-lived statements against the same
/// connection — SQLite itself serializes access under the single `Mutex`,
/// so higher layers need no lock of their own.
pub struct Connection {
    inner: Mutex<RusqliteConnection>,
}

impl Connection {
    /// Open (or recreate) the database file at `path` with `0600`
    /// permissions.
    pub fn open(path: impl AsRef<Path>) -> SqlResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| QueryError::new("DELETE FILE", e.to_string()))?;
        }
        let conn = RusqliteConnection::open(path)
            .map_err(|e| QueryError::new("OPEN", e.to_string()))?;
        Self::apply_pragmas(&conn)?;
        Self::set_permissions(path);
        info!(path = %path.display(), "sqlite cache opened");
        Ok(Self { inner: Mutex::new(conn) })
    }

    /// In-memory connection, used by tests and by any caller that doesn't
    /// need the file on disk (the cache is ephemeral regardless).
    pub fn open_in_memory() -> SqlResult<Self> {
        let conn = RusqliteConnection::open_in_memory()
            .map_err(|e| QueryError::new("OPEN", e.to_string()))?;
        Self::apply_pragmas(&conn)?;
        Ok(Self { inner: Mutex::new(conn) })
    }

    fn apply_pragmas(conn: &RusqliteConnection) -> SqlResult<()> {
        conn.pragma_update(None, "journal_mode", "memory")
            .map_err(|e| QueryError::new("PRAGMA journal_mode", e.to_string()))?;
        conn.pragma_update(None, "synchronous", "off")
            .map_err(|e| QueryError::new("PRAGMA synchronous", e.to_string()))?;
        Ok(())
    }

    #[cfg(unix)]
    fn set_permissions(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }
    }

    #[cfg(not(unix))]
    fn set_permissions(_path: &Path) {}

    /// Execute a statement that doesn't return rows.
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> SqlResult<usize> {
        let conn = self.inner.lock().expect("sqlite mutex poisoned");
        conn.execute(sql, params).map_err(|e| QueryError::new(sql, e.to_string()))
    }

    /// Run `f` inside a transaction. On error from `f` or from commit, the
    /// transaction rolls back (rusqlite rolls back any transaction dropped
    /// without a commit, so every exit path — early return, `?`, panic
    /// unwinding — releases cleanly).
    pub fn with_transaction<R>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> SqlResult<R>,
    ) -> SqlResult<R> {
        let mut conn = self.inner.lock().expect("sqlite mutex poisoned");
        let tx = conn
            .transaction()
            .map_err(|e| QueryError::new("BEGIN", e.to_string()))?;
        let result = f(&tx)?;
        tx.commit().map_err(|e| QueryError::new("COMMIT", e.to_string()))?;
        debug!("transaction committed");
        Ok(result)
    }

    /// Read-only access for streaming queries (the query planner prepares
    /// and steps its own cursor rather than buffering).
    pub fn with_connection<R>(&self, f: impl FnOnce(&RusqliteConnection) -> SqlResult<R>) -> SqlResult<R> {
        let conn = self.inner.lock().expect("sqlite mutex poisoned");
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_rolls_back_on_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (k TEXT PRIMARY KEY)", &[]).unwrap();
        let res: SqlResult<()> = conn.with_transaction(|tx| {
            tx.execute("INSERT INTO t(k) VALUES ('a')", []).map_err(|e| QueryError::new("INSERT", e.to_string()))?;
            Err(QueryError::new("FORCE FAIL", "boom".to_string()))
        });
        assert!(res.is_err());
        let count: i64 = conn
            .with_connection(|c| {
                c.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(|e| QueryError::new("SELECT", e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn transaction_commits_on_success() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (k TEXT PRIMARY KEY)", &[]).unwrap();
        conn.with_transaction(|tx| {
            tx.execute("INSERT INTO t(k) VALUES ('a')", []).map_err(|e| QueryError::new("INSERT", e.to_string()))?;
            Ok(())
        })
        .unwrap();
        let count: i64 = conn
            .with_connection(|c| {
                c.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(|e| QueryError::new("SELECT", e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
