//! SQLite database backend for notifybus-core
//!
//! SQLite has no LISTEN/NOTIFY, so this backend only serves the access
//! layer. Every checkout goes through the pool's [`AsyncRwLock`] so that
//! writers never race each other on the single database file.

use crate::lock::AsyncRwLock;
use crate::{Config, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// SQLite connection pool
#[derive(Clone)]
pub struct SqlitePool {
    pool: Pool<Sqlite>,
    lock: AsyncRwLock,
}

impl SqlitePool {
    /// Create a new SQLite pool from config
    pub async fn new(config: &Config) -> Result<Self> {
        // Parse the URL and configure for WAL mode (better concurrency)
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        info!(url = %config.database_url, "SQLite pool ready");

        Ok(Self {
            pool,
            lock: AsyncRwLock::new(),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Reader/writer lock shared by every checkout from this pool
    pub fn lock(&self) -> &AsyncRwLock {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Access, DbPool};
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    async fn create_test_pool() -> DbPool {
        let config = Config::new("sqlite::memory:").max_connections(4);
        DbPool::new(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_pool_creation() {
        let db = create_test_pool().await;
        assert!(!db.is_postgres());

        let mut conn = db.acquire(Access::Read).await.unwrap();
        assert_eq!(conn.access(), Access::Read);
        conn.execute("SELECT 1").await.unwrap();
        assert!(conn.as_sqlite().is_some());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let db = create_test_pool().await;

        {
            let mut conn = db.acquire(Access::Write).await.unwrap();
            conn.execute(
                "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO items (name) VALUES ('a'), ('b');",
            )
            .await
            .unwrap();
        }

        let mut conn = db.acquire(Access::Read).await.unwrap();
        let sqlite = conn.as_sqlite().unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(sqlite)
            .await
            .unwrap();
        assert_eq!(row.0, 2);
    }

    #[tokio::test]
    async fn test_writer_waits_for_open_readers() {
        let db = create_test_pool().await;
        let DbPool::Sqlite(pool) = &db else {
            panic!("expected sqlite pool");
        };

        let reader = db.acquire(Access::Read).await.unwrap();
        assert_eq!(pool.lock().readers(), 1);

        // The lock is taken before the pool, so the writer parks on it
        let mut writer = task::spawn(pool.lock().write());
        assert_pending!(writer.poll());

        drop(reader);
        assert_eq!(pool.lock().readers(), 0);
        let _guard = assert_ready!(writer.poll());
    }

    #[tokio::test]
    async fn test_sqlite_cannot_notify() {
        use crate::db::NotifyBackend;

        let db = create_test_pool().await;
        assert!(!db.supports_notify());
        assert!(matches!(
            db.connect_listener().await,
            Err(crate::Error::Unsupported(_))
        ));
    }
}
