//! Batched publishing
//!
//! Encodes each notification's topic and hands the whole batch to the
//! backend as a single unit.

use crate::channel::Channel;
use crate::db::{NotifyBackend, Outbound};
use crate::{Notification, Result};
use std::sync::Arc;
use tracing::debug;

/// Sends notifications through a [`NotifyBackend`]
#[derive(Clone)]
pub struct Publisher {
    backend: Arc<dyn NotifyBackend>,
}

impl Publisher {
    pub fn new(backend: Arc<dyn NotifyBackend>) -> Self {
        Self { backend }
    }

    /// Publish a batch; an empty batch is a no-op
    pub async fn publish(&self, notifications: &[Notification]) -> Result<()> {
        if notifications.is_empty() {
            return Ok(());
        }

        let batch: Vec<Outbound> = notifications
            .iter()
            .map(|n| Outbound {
                channel: Channel::encode(&n.topic),
                payload: n.payload.clone(),
            })
            .collect();

        self.backend.notify_batch(&batch).await?;
        debug!(count = batch.len(), "published notifications");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::registry::{ErrorHook, SubscriptionRegistry};
    use crate::testing::{MemoryBackend, wait_until};
    use crate::{Config, listener::ListenerLoop};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let backend = MemoryBackend::new();
        backend.fail_publishes(true);
        let publisher = Publisher::new(Arc::new(backend));

        // Would fail if it reached the backend
        publisher.publish(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces() {
        let backend = MemoryBackend::new();
        backend.fail_publishes(true);
        let publisher = Publisher::new(Arc::new(backend));

        let err = publisher
            .publish(&[Notification::new("orders", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }

    #[tokio::test]
    async fn test_batch_delivered_in_order() {
        let backend = MemoryBackend::new();
        let registry = SubscriptionRegistry::new();
        let config = Config::new("memory://").reconcile_interval(Duration::from_millis(10));
        let listener = ListenerLoop::new(Arc::new(backend.clone()), registry.clone(), &config);
        let hook: ErrorHook = Arc::new(|_: &Error| {});
        listener.start(hook).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = registry.subscribe(
            "orders",
            Arc::new(move |payload: &str| s.lock().unwrap().push(payload.to_string())),
        );
        assert!(wait_until(Duration::from_secs(2), || backend.is_listening("orders")).await);

        let publisher = Publisher::new(Arc::new(backend.clone()));
        publisher
            .publish(&[
                Notification::new("orders", "a"),
                Notification::empty("orders"),
                Notification::new("elsewhere", "x"),
                Notification::new("orders", "b"),
            ])
            .await
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 3).await);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "", "b"]);
        listener.stop();
    }
}
