//! Subscription registry.
//!
//! The registry maps topics to their compiled subscription filters. It is read on every pull
//! cycle and written rarely, so the full map is held behind an `ArcSwap` and updated with
//! read-copy-update semantics: every reader observes a consistent point-in-time snapshot and
//! never a half-installed expression.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::error::{ConsumerError, Result};
use crate::filter::{CompiledFilter, ExpressionKind, MessageSelector};
use crate::message::PulledMessage;

/// A snapshot of all subscriptions, keyed by topic.
pub type SubscriptionMap = HashMap<String, Arc<SubscriptionEntry>>;

/// A single topic subscription.
#[derive(Debug, PartialEq)]
pub struct SubscriptionEntry {
    /// The subscribed topic.
    pub topic: String,
    /// The kind of the subscription's expression.
    pub kind: ExpressionKind,
    /// The normalized expression text.
    pub expression: String,
    /// The compiled form of `expression`.
    pub filter: CompiledFilter,
    /// A monotonically increasing version, bumped whenever this topic's expression changes.
    pub version: u64,
}

impl SubscriptionEntry {
    /// Check if the given message is admitted by this subscription.
    pub fn admits(&self, msg: &PulledMessage) -> bool {
        self.filter.admits(msg)
    }
}

/// A registry of topic subscriptions.
pub struct SubscriptionRegistry {
    /// The current snapshot of all subscriptions.
    entries: ArcSwap<SubscriptionMap>,
    /// A counter used for versioning subscription entries.
    next_version: AtomicU64,
    /// A signal emitted on every change to the registry.
    changes_tx: watch::Sender<u64>,
    /// Held so that the change signal never closes.
    changes_rx: watch::Receiver<u64>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Create a new instance.
    pub fn new() -> Self {
        let (changes_tx, changes_rx) = watch::channel(0);
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            next_version: AtomicU64::new(1),
            changes_tx,
            changes_rx,
        }
    }

    /// Subscribe to the given topic with the given selector.
    ///
    /// The selector is compiled before anything is installed, so an invalid expression leaves
    /// the registry untouched. An identical re-subscription is a no-op which returns the
    /// already installed entry.
    #[tracing::instrument(level = "debug", skip(self, selector), fields(kind = %selector.kind))]
    pub fn subscribe(&self, topic: &str, selector: &MessageSelector) -> Result<Arc<SubscriptionEntry>> {
        if topic.trim().is_empty() {
            return Err(ConsumerError::InvalidArgument("subscription topic may not be empty".into()));
        }
        let filter = selector.compile()?;
        let expression = selector.expression_text().to_string();

        let mut installed = None;
        self.entries.rcu(|current| {
            if let Some(existing) = current.get(topic) {
                if existing.kind == selector.kind && existing.expression == expression {
                    installed = Some(existing.clone());
                    return current.clone();
                }
            }
            let entry = Arc::new(SubscriptionEntry {
                topic: topic.to_string(),
                kind: selector.kind,
                expression: expression.clone(),
                filter: filter.clone(),
                version: self.next_version.fetch_add(1, Ordering::SeqCst),
            });
            installed = Some(entry.clone());
            let mut updated = current.as_ref().clone();
            updated.insert(topic.to_string(), entry);
            Arc::new(updated)
        });

        let entry = match installed {
            Some(entry) => entry,
            None => return Err(ConsumerError::IllegalState("subscription was not installed".into())),
        };
        tracing::debug!(topic, expression = %entry.expression, version = entry.version, "subscription installed");
        self.notify();
        Ok(entry)
    }

    /// Remove the subscription for the given topic, returning `true` if one existed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let mut removed = false;
        self.entries.rcu(|current| {
            removed = current.contains_key(topic);
            if !removed {
                return current.clone();
            }
            let mut updated = current.as_ref().clone();
            updated.remove(topic);
            Arc::new(updated)
        });
        if removed {
            tracing::debug!(topic, "subscription removed");
            self.notify();
        }
        removed
    }

    /// Get the current subscription for the given topic.
    pub fn get(&self, topic: &str) -> Option<Arc<SubscriptionEntry>> {
        self.entries.load().get(topic).cloned()
    }

    /// Get a consistent snapshot of all subscriptions.
    pub fn snapshot(&self) -> Arc<SubscriptionMap> {
        self.entries.load_full()
    }

    /// The set of currently subscribed topics.
    pub fn topics(&self) -> BTreeSet<String> {
        self.entries.load().keys().cloned().collect()
    }

    /// Check if the given topic is currently subscribed.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.entries.load().contains_key(topic)
    }

    /// A signal which changes whenever the registry is mutated.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes_rx.clone()
    }

    fn notify(&self) {
        let next = *self.changes_rx.borrow() + 1;
        let _res = self.changes_tx.send(next);
    }
}
