//! Channel -> subscribers reverse index.
//!
//! Turns each broadcast into an O(subscribers-of-channel) walk instead of
//! O(all-clients). Writes (subscribe/unsubscribe/disconnect) take the write
//! lock; every broadcast takes the read lock just long enough to copy the
//! subscriber list, then iterates the snapshot lock-free.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

/// Anything addressable by a stable numeric id can live in the index.
pub trait Keyed {
    fn key(&self) -> u64;
}

/// Insertion-ordered channel membership.
pub struct SubscriptionIndex<T> {
    channels: RwLock<HashMap<String, Vec<Arc<T>>>>,
}

impl<T> Default for SubscriptionIndex<T> {
    fn default() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Keyed> SubscriptionIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` to `channel`. Double-adds indicate a bookkeeping bug in
    /// the caller; they are logged and ignored so the index stays consistent.
    pub fn add(&self, channel: &str, client: &Arc<T>) {
        let mut channels = self.channels.write();
        let members = channels.entry(channel.to_string()).or_default();
        if members.iter().any(|c| c.key() == client.key()) {
            error!(channel, client = client.key(), "duplicate subscription index add");
            return;
        }
        members.push(Arc::clone(client));
    }

    pub fn add_multiple(&self, channels: &[String], client: &Arc<T>) {
        for channel in channels {
            self.add(channel, client);
        }
    }

    /// Remove `client` from `channel`. Removing a non-member is logged as a
    /// bug and otherwise a no-op.
    pub fn remove(&self, channel: &str, client: &Arc<T>) {
        let mut channels = self.channels.write();
        let Some(members) = channels.get_mut(channel) else {
            error!(channel, client = client.key(), "remove from unknown channel");
            return;
        };
        let before = members.len();
        members.retain(|c| c.key() != client.key());
        if members.len() == before {
            error!(channel, client = client.key(), "remove of non-subscribed client");
        }
        if members.is_empty() {
            channels.remove(channel);
        }
    }

    pub fn remove_multiple(&self, channel_names: &[String], client: &Arc<T>) {
        for channel in channel_names {
            self.remove(channel, client);
        }
    }

    /// Remove `client` from every channel. O(all-channels), which is fine:
    /// disconnects are rare relative to broadcasts.
    pub fn remove_client(&self, client: &Arc<T>) {
        let mut channels = self.channels.write();
        channels.retain(|_, members| {
            members.retain(|c| c.key() != client.key());
            !members.is_empty()
        });
    }

    /// Snapshot of the channel's subscribers, safe to iterate without the
    /// lock. Concurrent subscribes affect only subsequent broadcasts.
    pub fn get(&self, channel: &str) -> Vec<Arc<T>> {
        self.channels
            .read()
            .get(channel)
            .map(|members| members.to_vec())
            .unwrap_or_default()
    }

    pub fn count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}
