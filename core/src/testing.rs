//! In-memory LISTEN/NOTIFY stand-in for tests
//!
//! Behaves like a tiny Postgres: each listener connection has its own
//! LISTEN set, notifications reach only connections listening at publish
//! time, and a batch is delivered all at once. Faults can be injected to
//! exercise reconnect paths.

use crate::channel::Channel;
use crate::db::{Inbound, ListenerConnection, NotifyBackend, Outbound};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Hub {
    next_id: u64,
    connections: HashMap<u64, Session>,
    connects: usize,
    pings: usize,
    fail_connects: usize,
    fail_reconcile: bool,
    fail_publish: bool,
}

struct Session {
    listening: HashSet<Channel>,
    // `None` tells the connection it has been severed
    tx: mpsc::UnboundedSender<Option<Inbound>>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBackend {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap()
    }

    /// Union of every open connection's LISTEN set
    pub(crate) fn listening(&self) -> HashSet<Channel> {
        self.hub()
            .connections
            .values()
            .flat_map(|s| s.listening.iter().cloned())
            .collect()
    }

    pub(crate) fn is_listening(&self, topic: &str) -> bool {
        let channel = Channel::encode(topic);
        self.listening().contains(&channel)
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.hub().connections.len()
    }

    pub(crate) fn connects(&self) -> usize {
        self.hub().connects
    }

    pub(crate) fn pings(&self) -> usize {
        self.hub().pings
    }

    /// Sever every open connection
    pub(crate) fn drop_connections(&self) {
        let mut hub = self.hub();
        for (_, session) in hub.connections.drain() {
            let _ = session.tx.send(None);
        }
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.hub().fail_connects = n;
    }

    pub(crate) fn fail_next_reconcile(&self) {
        self.hub().fail_reconcile = true;
    }

    pub(crate) fn fail_publishes(&self, fail: bool) {
        self.hub().fail_publish = fail;
    }
}

#[async_trait]
impl NotifyBackend for MemoryBackend {
    async fn connect_listener(&self) -> Result<Box<dyn ListenerConnection>> {
        let mut hub = self.hub();
        hub.connects += 1;
        if hub.fail_connects > 0 {
            hub.fail_connects -= 1;
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }

        let id = hub.next_id;
        hub.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        hub.connections.insert(
            id,
            Session {
                listening: HashSet::new(),
                tx,
            },
        );

        Ok(Box::new(MemoryConnection {
            id,
            hub: self.hub.clone(),
            rx,
        }))
    }

    async fn notify_batch(&self, batch: &[Outbound]) -> Result<()> {
        let hub = self.hub();
        if hub.fail_publish {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        for notification in batch {
            for session in hub.connections.values() {
                if session.listening.contains(&notification.channel) {
                    let _ = session.tx.send(Some(Inbound {
                        channel: notification.channel.clone(),
                        payload: notification.payload.clone().unwrap_or_default(),
                    }));
                }
            }
        }
        Ok(())
    }
}

struct MemoryConnection {
    id: u64,
    hub: Arc<Mutex<Hub>>,
    rx: mpsc::UnboundedReceiver<Option<Inbound>>,
}

impl MemoryConnection {
    fn session<'a>(hub: &'a mut Hub, id: u64) -> Result<&'a mut Session> {
        hub.connections.get_mut(&id).ok_or(Error::ConnectionLost)
    }
}

#[async_trait]
impl ListenerConnection for MemoryConnection {
    async fn reconcile(&mut self, unlisten: &[Channel], listen: &[Channel]) -> Result<()> {
        let mut hub = self.hub.lock().unwrap();
        if std::mem::take(&mut hub.fail_reconcile) {
            return Err(Error::Database(sqlx::Error::WorkerCrashed));
        }
        let session = Self::session(&mut hub, self.id)?;
        for channel in unlisten {
            session.listening.remove(channel);
        }
        session.listening.extend(listen.iter().cloned());
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        let mut hub = self.hub.lock().unwrap();
        Self::session(&mut hub, self.id)?;
        hub.pings += 1;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Inbound> {
        match self.rx.recv().await {
            Some(Some(inbound)) => Ok(inbound),
            Some(None) | None => Err(Error::ConnectionLost),
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.connections.remove(&self.id);
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub(crate) async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
