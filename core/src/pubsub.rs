//! High-level pub/sub API
//!
//! This is the main interface for notifybus-core, tying together:
//! - the subscription registry (who wants which topic)
//! - the listener loop (keeps one connection LISTENing to exactly those topics)
//! - the publisher (batched `pg_notify`)

use crate::db::{DbPool, NotifyBackend};
use crate::listener::ListenerLoop;
use crate::publisher::Publisher;
use crate::registry::{ErrorHook, Subscription, SubscriptionRegistry};
use crate::{Config, Error, Notification, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// The main pub/sub broker
pub struct PubSub {
    db: Option<Arc<DbPool>>,
    backend: Arc<dyn NotifyBackend>,
    config: Config,
    registry: Arc<SubscriptionRegistry>,
    listener: ListenerLoop,
    publisher: Publisher,
    started: AtomicBool,
}

impl PubSub {
    /// Create a broker over a freshly connected database pool
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(DbPool::new(&config).await?);
        let mut pubsub = Self::with_backend(db.clone(), config)?;
        pubsub.db = Some(db);

        info!("PubSub broker initialized");
        Ok(pubsub)
    }

    /// Create a broker over any LISTEN/NOTIFY backend
    pub fn with_backend(backend: Arc<dyn NotifyBackend>, config: Config) -> Result<Self> {
        config.validate()?;
        let registry = SubscriptionRegistry::new();
        let listener = ListenerLoop::new(backend.clone(), registry.clone(), &config);
        let publisher = Publisher::new(backend.clone());

        Ok(Self {
            db: None,
            backend,
            config,
            registry,
            listener,
            publisher,
            started: AtomicBool::new(false),
        })
    }

    /// Start the background listener loop
    ///
    /// Every error the loop catches (connection loss, failed statements,
    /// panicking callbacks) is logged and passed to `on_error`. Calling this
    /// while the loop is running does nothing.
    pub fn start_loop(&self, on_error: Option<ErrorHook>) -> Result<()> {
        if !self.backend.supports_notify() {
            return Err(Error::Unsupported(
                "database does not support LISTEN/NOTIFY".into(),
            ));
        }

        let on_error = on_error.unwrap_or_else(|| Arc::new(|_: &Error| {}));
        self.listener.start(on_error)?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the listener loop
    ///
    /// Cooperative; a delivery already in progress may still complete.
    /// `subscribe` and `publish` keep working and the loop can be started
    /// again.
    pub fn stop_loop(&self) {
        self.listener.stop();
    }

    fn ensure_started(&self, operation: &'static str) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotStarted(operation))
        }
    }

    /// Subscribe to a topic
    ///
    /// The callback receives each payload published to `topic` from the
    /// moment the listener loop has reconciled (within one tick). Drop the
    /// returned handle to unsubscribe.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.ensure_started("subscribe")?;
        Ok(self.registry.subscribe(topic, Arc::new(callback)))
    }

    /// Publish one payload to a topic
    pub async fn publish(&self, topic: &str, payload: Option<&str>) -> Result<()> {
        let notification = Notification {
            topic: topic.to_string(),
            payload: payload.map(str::to_string),
        };
        self.publish_batch(std::slice::from_ref(&notification)).await
    }

    /// Publish several notifications as one atomic batch
    pub async fn publish_batch(&self, notifications: &[Notification]) -> Result<()> {
        self.ensure_started("publish")?;
        self.publisher.publish(notifications).await
    }

    /// Check if the listener loop is running
    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    /// Get the number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    /// Underlying pool, when built with [`PubSub::new`]
    pub fn db(&self) -> Option<&Arc<DbPool>> {
        self.db.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the loop and close the pool
    pub async fn shutdown(self) {
        info!("PubSub broker shutting down...");
        self.listener.stop();
        if let Some(db) = &self.db {
            db.close().await;
        }
        info!("PubSub broker shutdown complete");
    }
}
