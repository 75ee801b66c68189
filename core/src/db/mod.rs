//! Database abstraction layer for notifybus-core
//!
//! Two seams live here:
//! - [`NotifyBackend`] / [`ListenerConnection`]: what the broker needs from
//!   a database with LISTEN/NOTIFY (a dedicated listening connection, and a
//!   way to send notifications).
//! - [`DbPool::acquire`]: pooled connections for the surrounding access
//!   layer, serialized through an [`AsyncRwLock`](crate::lock::AsyncRwLock)
//!   on SQLite.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::channel::Channel;
use crate::lock::{ReadGuard, WriteGuard};
use crate::{Config, Error, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;

/// A notification as received on the listening connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub channel: Channel,
    /// Absent payloads arrive as ""
    pub payload: String,
}

/// A notification with its topic already encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub channel: Channel,
    pub payload: Option<String>,
}

/// Backend capable of LISTEN/NOTIFY
#[async_trait]
pub trait NotifyBackend: Send + Sync + 'static {
    /// Whether this backend can deliver notifications at all
    fn supports_notify(&self) -> bool {
        true
    }

    /// Open a dedicated connection for listening
    async fn connect_listener(&self) -> Result<Box<dyn ListenerConnection>>;

    /// Send a batch of notifications in one round trip
    async fn notify_batch(&self, batch: &[Outbound]) -> Result<()>;
}

/// One physical connection in LISTEN mode
///
/// Owned by a single listener loop run; dropped (closing the connection)
/// when that run fails or stops.
#[async_trait]
pub trait ListenerConnection: Send {
    /// Apply `UNLISTEN` for `unlisten` then `LISTEN` for `listen`, atomically
    async fn reconcile(&mut self, unlisten: &[Channel], listen: &[Channel]) -> Result<()>;

    /// Run a no-op statement; an error means the connection is dead
    async fn ping(&mut self) -> Result<()>;

    /// Wait for the next notification
    ///
    /// Must be cancel-safe: the listener loop drops this future whenever a
    /// timer tick wins the race.
    async fn recv(&mut self) -> Result<Inbound>;
}

/// Database pool type (enum dispatch for runtime selection)
pub enum DbPool {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresPool),
}

/// Intent of an access-layer checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl DbPool {
    /// Create a new database pool from config
    pub async fn new(config: &Config) -> Result<Self> {
        #[cfg(feature = "postgres")]
        if config.is_postgres() {
            return Ok(Self::Postgres(postgres::PostgresPool::new(config).await?));
        }

        #[cfg(feature = "sqlite")]
        if config.is_sqlite() {
            return Ok(Self::Sqlite(sqlite::SqlitePool::new(config).await?));
        }

        Err(Error::Config(format!(
            "Unsupported database URL: {}",
            config.database_url
        )))
    }

    /// Check if this is a PostgreSQL pool (supports LISTEN/NOTIFY)
    pub fn is_postgres(&self) -> bool {
        #[cfg(feature = "postgres")]
        if matches!(self, Self::Postgres(_)) {
            return true;
        }
        false
    }

    /// Check out a connection for reading or writing
    ///
    /// On SQLite the pool's reader/writer lock is taken before the
    /// connection and held until the returned [`DbConnection`] is dropped.
    pub async fn acquire(&self, access: Access) -> Result<DbConnection> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(pool) => {
                let guard = match access {
                    Access::Read => AccessGuard::Read(pool.lock().read().await),
                    Access::Write => AccessGuard::Write(pool.lock().write().await),
                };
                let conn = pool.pool().acquire().await?;
                Ok(DbConnection {
                    conn: PooledConn::Sqlite(conn),
                    access,
                    _guard: Some(guard),
                })
            }
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => {
                let conn = pool.pool().acquire().await?;
                Ok(DbConnection {
                    conn: PooledConn::Postgres(conn),
                    access,
                    _guard: None,
                })
            }
        }
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(pool) => pool.pool().close().await,
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => pool.pool().close().await,
        }
    }
}

#[async_trait]
impl NotifyBackend for DbPool {
    fn supports_notify(&self) -> bool {
        self.is_postgres()
    }

    async fn connect_listener(&self) -> Result<Box<dyn ListenerConnection>> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => Err(Error::Unsupported("SQLite has no LISTEN/NOTIFY".into())),
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => pool.connect_listener().await,
        }
    }

    async fn notify_batch(&self, batch: &[Outbound]) -> Result<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => Err(Error::Unsupported("SQLite has no LISTEN/NOTIFY".into())),
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => pool.notify_batch(batch).await,
        }
    }
}

// Held only for its Drop
#[allow(dead_code)]
enum AccessGuard {
    Read(ReadGuard),
    Write(WriteGuard),
}

enum PooledConn {
    #[cfg(feature = "sqlite")]
    Sqlite(PoolConnection<sqlx::Sqlite>),
    #[cfg(feature = "postgres")]
    Postgres(PoolConnection<sqlx::Postgres>),
}

/// A pooled connection checked out through [`DbPool::acquire`]
///
/// Returns to the pool, and releases any access lock, on drop.
pub struct DbConnection {
    conn: PooledConn,
    access: Access,
    _guard: Option<AccessGuard>,
}

impl DbConnection {
    pub fn access(&self) -> Access {
        self.access
    }

    /// Run raw SQL (may contain several statements); returns rows affected
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        let affected = match &mut self.conn {
            #[cfg(feature = "sqlite")]
            PooledConn::Sqlite(conn) => {
                sqlx::raw_sql(sql).execute(&mut **conn).await?.rows_affected()
            }
            #[cfg(feature = "postgres")]
            PooledConn::Postgres(conn) => {
                sqlx::raw_sql(sql).execute(&mut **conn).await?.rows_affected()
            }
        };
        Ok(affected)
    }

    #[cfg(feature = "sqlite")]
    pub fn as_sqlite(&mut self) -> Option<&mut sqlx::SqliteConnection> {
        match &mut self.conn {
            PooledConn::Sqlite(conn) => Some(&mut **conn),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}
