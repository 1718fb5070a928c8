//! Short-lived SQLite access with retry on lock contention.
//!
//! Every call opens its own connection, runs one statement (or one batch in a
//! single transaction), commits and closes. Many processes may share the same
//! file, so connections are never held across calls.
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Connection, Executor, Sqlite};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::retry::RetryPolicy;
use crate::config::STORE_BUSY_TIMEOUT;
use crate::error::StoreError;

/// Whether the connection may take write locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    Modify,
}

/// How the statement is applied to its arguments
#[derive(Debug, Clone)]
pub enum Execution {
    /// One statement with one argument list
    Single(Vec<SqlValue>),
    /// One statement applied to every argument list, in one transaction
    Many(Vec<Vec<SqlValue>>),
    /// Several `;`-separated statements without arguments
    Script,
}

/// Rows wanted back from a [`Execution::Single`] statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    None,
    One,
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

/// Handle to the work-status database file
#[derive(Debug, Clone)]
pub struct StatusDb {
    path: PathBuf,
    retry: RetryPolicy,
    busy_timeout: Duration,
}

impl StatusDb {
    pub fn new(path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            retry,
            busy_timeout: STORE_BUSY_TIMEOUT,
        }
    }

    /// Override the SQLite busy handler timeout
    #[cfg(test)]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Execute a statement under the retry policy
    pub async fn execute(
        &self,
        sql: &str,
        execution: Execution,
        mode: AccessMode,
        fetch: Fetch,
    ) -> Result<Vec<SqliteRow>, StoreError> {
        let what = statement_label(sql);
        self.retry
            .retry(&what, || self.execute_once(sql, &execution, mode, fetch))
            .await
    }

    async fn execute_once(
        &self,
        sql: &str,
        execution: &Execution,
        mode: AccessMode,
        fetch: Fetch,
    ) -> Result<Vec<SqliteRow>, sqlx::Error> {
        let mut conn = self.connect(mode).await?;
        let result = Self::run(&mut conn, sql, execution, fetch).await;
        let closed = conn.close().await;
        let rows = result?;
        closed?;
        Ok(rows)
    }

    async fn connect(&self, mode: AccessMode) -> Result<SqliteConnection, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .busy_timeout(self.busy_timeout);

        let options = match mode {
            AccessMode::ReadOnly => options.read_only(true),
            AccessMode::Modify => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(sqlx::Error::Io)?;
                }
                options.create_if_missing(true)
            }
        };

        SqliteConnection::connect_with(&options).await
    }

    async fn run(
        conn: &mut SqliteConnection,
        sql: &str,
        execution: &Execution,
        fetch: Fetch,
    ) -> Result<Vec<SqliteRow>, sqlx::Error> {
        match execution {
            Execution::Single(args) => {
                let query = bind_values(sqlx::query(sql), args);
                match fetch {
                    Fetch::None => {
                        query.execute(&mut *conn).await?;
                        Ok(Vec::new())
                    }
                    Fetch::One => Ok(query.fetch_optional(&mut *conn).await?.into_iter().collect()),
                    Fetch::All => query.fetch_all(&mut *conn).await,
                }
            }
            Execution::Many(arg_lists) => {
                let mut tx = conn.begin().await?;
                for args in arg_lists {
                    bind_values(sqlx::query(sql), args)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(Vec::new())
            }
            Execution::Script => {
                (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
                Ok(Vec::new())
            }
        }
    }
}

fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &'q [SqlValue],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

/// First line of a statement, for log and error messages
fn statement_label(sql: &str) -> String {
    let line = sql.trim().lines().next().unwrap_or_default().trim();
    if line.len() > 60 {
        let cut = (0..=60).rev().find(|i| line.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &line[..cut])
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;
    use tempfile::TempDir;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    async fn create_table(db: &StatusDb) {
        db.execute(
            "CREATE TABLE IF NOT EXISTS t (k TEXT PRIMARY KEY, v REAL);",
            Execution::Script,
            AccessMode::Modify,
            Fetch::None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_many_and_fetch_all() {
        let dir = TempDir::new().unwrap();
        let db = StatusDb::new(dir.path().join("s.sqlite"), fast_policy(3));
        create_table(&db).await;

        db.execute(
            "INSERT INTO t (k, v) VALUES (?, ?)",
            Execution::Many(vec![
                vec!["a".into(), 1.0.into()],
                vec!["b".into(), 2.0.into()],
            ]),
            AccessMode::Modify,
            Fetch::None,
        )
        .await
        .unwrap();

        let rows = db
            .execute(
                "SELECT k, v FROM t ORDER BY k",
                Execution::Single(vec![]),
                AccessMode::ReadOnly,
                Fetch::All,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get::<String, _>(0), "b");
        assert_eq!(rows[1].get::<f64, _>(1), 2.0);

        let one = db
            .execute(
                "SELECT v FROM t WHERE k = ?",
                Execution::Single(vec!["missing".into()]),
                AccessMode::ReadOnly,
                Fetch::One,
            )
            .await
            .unwrap();
        assert!(one.is_empty());
    }

    #[tokio::test]
    async fn test_writes_create_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workspace").join("nested").join("s.sqlite");
        let db = StatusDb::new(&path, fast_policy(3));

        let read = db
            .execute(
                "SELECT 1",
                Execution::Single(vec![]),
                AccessMode::ReadOnly,
                Fetch::All,
            )
            .await;
        assert!(read.is_err());
        assert!(!path.parent().unwrap().exists());

        create_table(&db).await;
        assert!(db.exists());
    }

    #[tokio::test]
    async fn test_read_only_handle_cannot_write() {
        let dir = TempDir::new().unwrap();
        let db = StatusDb::new(dir.path().join("s.sqlite"), fast_policy(3));
        create_table(&db).await;

        let result = db
            .execute(
                "INSERT INTO t (k, v) VALUES ('x', 1.0)",
                Execution::Single(vec![]),
                AccessMode::ReadOnly,
                Fetch::None,
            )
            .await;
        assert!(matches!(result, Err(StoreError::Database { .. })));
    }

    #[tokio::test]
    async fn test_retries_until_lock_released() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.sqlite");
        let db = StatusDb::new(&path, fast_policy(500)).with_busy_timeout(Duration::ZERO);
        create_table(&db).await;

        let mut holder =
            SqliteConnection::connect_with(&SqliteConnectOptions::new().filename(&path))
                .await
                .unwrap();
        sqlx::raw_sql("BEGIN EXCLUSIVE")
            .execute(&mut holder)
            .await
            .unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            (&mut holder).execute(sqlx::raw_sql("COMMIT")).await.unwrap();
            holder.close().await.unwrap();
        });

        db.execute(
            "INSERT INTO t (k, v) VALUES (?, ?)",
            Execution::Single(vec!["late".into(), 3.0.into()]),
            AccessMode::Modify,
            Fetch::None,
        )
        .await
        .unwrap();
        release.await.unwrap();

        let rows = db
            .execute(
                "SELECT count(1) FROM t",
                Execution::Single(vec![]),
                AccessMode::ReadOnly,
                Fetch::One,
            )
            .await
            .unwrap();
        assert_eq!(rows[0].get::<i64, _>(0), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_contention() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.sqlite");
        let db = StatusDb::new(&path, fast_policy(3)).with_busy_timeout(Duration::ZERO);
        create_table(&db).await;

        let mut holder =
            SqliteConnection::connect_with(&SqliteConnectOptions::new().filename(&path))
                .await
                .unwrap();
        sqlx::raw_sql("BEGIN EXCLUSIVE")
            .execute(&mut holder)
            .await
            .unwrap();

        let result = db
            .execute(
                "INSERT INTO t (k, v) VALUES ('x', 1.0)",
                Execution::Single(vec![]),
                AccessMode::Modify,
                Fetch::None,
            )
            .await;

        match result {
            Err(StoreError::Contention { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected contention error, got {:?}", other.map(|rows| rows.len())),
        }

        sqlx::raw_sql("ROLLBACK").execute(&mut holder).await.unwrap();
    }

    #[test]
    fn test_statement_label_truncates() {
        assert_eq!(statement_label("\n  SELECT 1\n FROM t"), "SELECT 1");
        let long = "x".repeat(100);
        assert_eq!(statement_label(&long).len(), 63);
    }
}
