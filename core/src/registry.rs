//! In-memory subscription registry
//!
//! Maps each channel to the callbacks registered on it. The set of
//! channels with at least one callback is what the listener loop must be
//! `LISTEN`ing on; empty entries are removed eagerly so the map's keys are
//! exactly that set.

use crate::channel::Channel;
use crate::Error;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, error};
use uuid::Uuid;

/// Callback type for notification delivery; receives the payload
pub type Callback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Receives every error caught by the broker's background work
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync + 'static>;

/// Identifies one subscription among those on the same channel
pub type SubscriberId = Uuid;

type ChannelMap = HashMap<Channel, HashMap<SubscriberId, Callback>>;

/// Channel -> subscriber callbacks
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: RwLock<ChannelMap>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a callback for a topic
    ///
    /// The returned handle removes exactly this registration when it is
    /// dropped or [`Subscription::unsubscribe`]d.
    pub fn subscribe(self: &Arc<Self>, topic: &str, callback: Callback) -> Subscription {
        let channel = Channel::encode(topic);
        let id = Uuid::new_v4();

        {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            let subscribers = channels.entry(channel.clone()).or_default();
            if subscribers.is_empty() {
                debug!(%channel, "channel now required");
            }
            subscribers.insert(id, callback);
        }

        Subscription {
            registry: Arc::downgrade(self),
            channel,
            id,
            active: true,
        }
    }

    fn remove(&self, channel: &Channel, id: SubscriberId) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                channels.remove(channel);
                debug!(%channel, "channel no longer required");
            }
        }
    }

    /// Deliver a payload to every callback currently on `channel`
    ///
    /// Callbacks are snapshotted before any runs, so subscribe/unsubscribe
    /// from inside a callback is safe and does not affect this delivery.
    /// A panicking callback is reported to `on_error` and the rest still run.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, channel: &Channel, payload: &str, on_error: &ErrorHook) -> usize {
        let callbacks: Vec<Callback> = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            match channels.get(channel) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return 0,
            }
        };

        for callback in &callbacks {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                let err = Error::Callback {
                    channel: channel.to_string(),
                    message: panic_message(panic.as_ref()),
                };
                report(on_error, &err);
            }
        }

        callbacks.len()
    }

    /// Channels that currently have at least one subscription
    pub fn snapshot_required(&self) -> HashSet<Channel> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.keys().cloned().collect()
    }

    pub fn is_required(&self, channel: &Channel) -> bool {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.contains_key(channel)
    }

    /// Total number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.values().map(HashMap::len).sum()
    }

    pub fn channel_count(&self) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.len()
    }
}

/// Log an error and hand it to the hook; a panicking hook is contained
pub(crate) fn report(on_error: &ErrorHook, err: &Error) {
    error!(error = %err, "notifybus error");
    if panic::catch_unwind(AssertUnwindSafe(|| on_error(err))).is_err() {
        error!("error hook panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to one registered callback
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    channel: Channel,
    id: SubscriberId,
    active: bool,
}

impl Subscription {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove this registration
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
