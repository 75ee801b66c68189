//! Background LISTEN loop
//!
//! One long-lived task per broker owns the physical listening connection.
//! It converges the connection's LISTEN set to the registry's required
//! channels on every tick, relays incoming notifications to the registry,
//! and on any failure throws the connection away and starts over with a
//! full re-subscribe.
//!
//! Runs are identified by a generation number. Starting bumps it and
//! spawns a run bound to the new value; stopping just bumps it again. A run
//! whose generation is no longer current winds down at its next check
//! without being aborted, so a statement already in flight completes.

use crate::channel::Channel;
use crate::db::{ListenerConnection, NotifyBackend};
use crate::registry::{ErrorHook, SubscriptionRegistry, report};
use crate::{Config, Error, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handle to the broker's listener task
pub struct ListenerLoop {
    backend: Arc<dyn NotifyBackend>,
    registry: Arc<SubscriptionRegistry>,
    reconcile_interval: Duration,
    keepalive_interval: Duration,
    generation: watch::Sender<u64>,
    // Generation of the run currently spawned, if any
    active: Mutex<Option<u64>>,
}

impl ListenerLoop {
    pub fn new(
        backend: Arc<dyn NotifyBackend>,
        registry: Arc<SubscriptionRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            backend,
            registry,
            reconcile_interval: config.reconcile_interval,
            keepalive_interval: config.keepalive_interval,
            generation: watch::Sender::new(0),
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<u64>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a run unless one is already active
    ///
    /// Returns `Ok(false)` when a run was already going. Must be called
    /// from within a Tokio runtime; otherwise the generation bump is undone
    /// and [`Error::NoRuntime`] is returned.
    pub fn start(&self, on_error: ErrorHook) -> Result<bool> {
        let mut active = self.active();
        if *active == Some(self.generation()) {
            debug!(generation = self.generation(), "listener loop already running");
            return Ok(false);
        }

        self.generation.send_modify(|g| *g += 1);
        let generation = self.generation();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.generation.send_modify(|g| *g -= 1);
                return Err(Error::NoRuntime);
            }
        };

        let run = Run {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            reconcile_interval: self.reconcile_interval,
            keepalive_interval: self.keepalive_interval,
            generation: self.generation.subscribe(),
            this_run: generation,
            on_error,
        };
        handle.spawn(run.run());
        *active = Some(generation);

        info!(generation, "listener loop started");
        Ok(true)
    }

    /// Invalidate the current run
    ///
    /// Cooperative: the run notices at its next check. Deliveries already
    /// under way may still finish after this returns.
    pub fn stop(&self) {
        let mut active = self.active();
        self.generation.send_modify(|g| *g += 1);
        if let Some(generation) = active.take() {
            info!(generation, "listener loop stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.active() == Some(self.generation())
    }

    /// Current generation number
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

impl Drop for ListenerLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Run {
    backend: Arc<dyn NotifyBackend>,
    registry: Arc<SubscriptionRegistry>,
    reconcile_interval: Duration,
    keepalive_interval: Duration,
    generation: watch::Receiver<u64>,
    this_run: u64,
    on_error: ErrorHook,
}

impl Run {
    fn should_run(&self) -> bool {
        // has_changed errors once the ListenerLoop is gone
        self.generation.has_changed().is_ok() && *self.generation.borrow() == self.this_run
    }

    async fn run(mut self) {
        while self.should_run() {
            if let Err(e) = self.session().await {
                report(&self.on_error, &e);
                // Don't hammer a server that just refused us
                self.pause(self.reconcile_interval).await;
            }
        }
        info!(generation = self.this_run, "listener loop stopped");
    }

    /// One connection's lifetime: connect, then tick/receive until stale or broken
    async fn session(&mut self) -> Result<()> {
        let mut conn = self.backend.connect_listener().await?;
        // Fresh connection listens to nothing; the first tick re-subscribes everything
        let mut subscribed: HashSet<Channel> = HashSet::new();
        debug!(generation = self.this_run, "listening connection established");

        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_keepalive = Instant::now();

        while self.should_run() {
            tokio::select! {
                biased;

                _ = self.generation.changed() => {}

                _ = ticker.tick() => {
                    self.reconcile(conn.as_mut(), &mut subscribed).await?;
                    if last_keepalive.elapsed() >= self.keepalive_interval {
                        last_keepalive = Instant::now();
                        conn.ping().await?;
                    }
                }

                inbound = conn.recv() => {
                    let inbound = inbound?;
                    if self.should_run() {
                        self.registry.dispatch(&inbound.channel, &inbound.payload, &self.on_error);
                    } else {
                        debug!(channel = %inbound.channel, "dropping notification for stale run");
                    }
                }
            }
        }

        Ok(())
    }

    async fn reconcile(
        &self,
        conn: &mut dyn ListenerConnection,
        subscribed: &mut HashSet<Channel>,
    ) -> Result<()> {
        let required = self.registry.snapshot_required();
        let listen: Vec<Channel> = required.difference(subscribed).cloned().collect();
        let unlisten: Vec<Channel> = subscribed.difference(&required).cloned().collect();
        if listen.is_empty() && unlisten.is_empty() {
            return Ok(());
        }

        conn.reconcile(&unlisten, &listen).await?;

        // Only a committed change updates what we believe we're listening to
        for channel in &unlisten {
            subscribed.remove(channel);
        }
        subscribed.extend(listen.iter().cloned());
        debug!(
            added = listen.len(),
            removed = unlisten.len(),
            listening = subscribed.len(),
            "reconciled LISTEN set"
        );
        Ok(())
    }

    /// Sleep, but wake early if the generation moves
    async fn pause(&mut self, duration: Duration) {
        if !self.should_run() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.generation.changed() => {
                warn!(generation = self.this_run, "listener loop interrupted while backing off");
            }
        }
    }
}
