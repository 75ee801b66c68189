//! PostgreSQL database backend for notifybus-core
//!
//! Uses LISTEN/NOTIFY for real-time delivery. Channel names come from
//! [`Channel::encode`] and are spliced into statements verbatim; payloads
//! are always bound parameters.

use super::{Inbound, ListenerConnection, NotifyBackend, Outbound};
use crate::channel::Channel;
use crate::{Config, Error, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions, PgQueryResult};
use sqlx::{Executor, Pool, Postgres};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Most `pg_notify` calls put in a single statement
///
/// Postgres caps a target list at 1664 entries; larger batches are split
/// into several statements inside one transaction.
pub const MAX_NOTIFY_PER_STATEMENT: usize = 1000;

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: Pool<Postgres>,
}

impl PostgresPool {
    /// Create a new PostgreSQL pool from config
    pub async fn new(config: &Config) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.database_url)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        info!(max_connections = config.max_connections, "PostgreSQL pool ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl NotifyBackend for PostgresPool {
    async fn connect_listener(&self) -> Result<Box<dyn ListenerConnection>> {
        let listener = PgListener::connect_with(&self.pool).await?;
        debug!("opened listening connection");
        Ok(Box::new(PgListenerConnection { listener }))
    }

    async fn notify_batch(&self, batch: &[Outbound]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // NOTIFY is delivered at commit, so the whole batch lands or none of it
        let mut tx = self.pool.begin().await?;
        for chunk in batch.chunks(MAX_NOTIFY_PER_STATEMENT) {
            let sql = build_notify_sql(chunk.iter().map(|n| &n.channel));
            let mut query = sqlx::query(&sql);
            for notification in chunk {
                query = query.bind(notification.payload.as_deref());
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }
}

/// The listening side: one `PgListener` driven by raw statements
///
/// LISTEN state is tracked by the listener loop, not by `PgListener`, so a
/// transparent reconnect inside sqlx would leave the new session listening
/// to nothing. `try_recv` reports that case as `Ok(None)`, which is turned
/// into [`Error::ConnectionLost`] to force a full re-subscribe.
pub struct PgListenerConnection {
    listener: PgListener,
}

#[async_trait]
impl ListenerConnection for PgListenerConnection {
    async fn reconcile(&mut self, unlisten: &[Channel], listen: &[Channel]) -> Result<()> {
        let sql = build_reconcile_sql(unlisten, listen);
        if let Err(e) = execute_on(&mut self.listener, &sql).await {
            // A statement error leaves the explicit transaction open and aborted
            if let Err(rollback) = execute_on(&mut self.listener, "ROLLBACK").await {
                warn!(error = %rollback, "rollback after failed reconcile also failed");
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        execute_on(&mut self.listener, "SELECT NULL").await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Inbound> {
        match self.listener.try_recv().await? {
            Some(notification) => Ok(Inbound {
                channel: Channel::from_wire(notification.channel()),
                payload: notification.payload().to_owned(),
            }),
            None => Err(Error::ConnectionLost),
        }
    }
}

type StatementFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<PgQueryResult, sqlx::Error>> + Send + 'a>>;

/// Run a simple-query string on the listening connection
///
/// Must stay a boxed `Send` future so the async-trait methods above are `Send`.
fn execute_on<'a>(listener: &'a mut PgListener, sql: &'a str) -> StatementFuture<'a> {
    listener.execute(sqlx::raw_sql(sql))
}

/// `BEGIN; UNLISTEN a; ... LISTEN b; ...; COMMIT;`
pub(crate) fn build_reconcile_sql(unlisten: &[Channel], listen: &[Channel]) -> String {
    let mut sql = String::from("BEGIN;");
    for channel in unlisten {
        sql.push_str(" UNLISTEN ");
        sql.push_str(channel.as_str());
        sql.push(';');
    }
    for channel in listen {
        sql.push_str(" LISTEN ");
        sql.push_str(channel.as_str());
        sql.push(';');
    }
    sql.push_str(" COMMIT;");
    sql
}

/// `SELECT pg_notify('a', $1), pg_notify('b', $2), ...`
pub(crate) fn build_notify_sql<'a>(channels: impl Iterator<Item = &'a Channel>) -> String {
    let mut sql = String::from("SELECT ");
    for (i, channel) in channels.enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&format!("pg_notify('{}', ${})", channel, i + 1));
    }
    sql
}
