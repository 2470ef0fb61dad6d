//! Core data model shared by the pull loops and the dispatcher.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

/// The property key under which a message's tag is addressable from predicate expressions.
pub const PROPERTY_TAGS: &str = "TAGS";

/// A handle identifying a single queue (partition) of a topic on a broker.
///
/// Queues are the unit of ordering and parallelism. Handles are owned by the assignment view;
/// all other components only ever hold clones.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueHandle {
    /// The topic to which this queue belongs.
    pub topic: String,
    /// The ID of this queue within its topic.
    pub queue_id: u32,
    /// The address of the broker hosting this queue.
    pub broker: String,
}

impl QueueHandle {
    /// Create a new instance.
    pub fn new(topic: impl Into<String>, queue_id: u32, broker: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
            broker: broker.into(),
        }
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.topic, self.broker, self.queue_id)
    }
}

/// A message pulled from a queue.
///
/// Pulled messages are never mutated. A redelivery is a fresh copy carrying an incremented
/// `reconsume_count`, see `PulledMessage::redelivery`.
#[derive(Clone, Debug, PartialEq)]
pub struct PulledMessage {
    /// The queue from which this message was pulled.
    pub queue: QueueHandle,
    /// The offset of this message within its queue.
    pub offset: u64,
    /// The message's tag, if any.
    pub tags: Option<String>,
    /// The message's business keys.
    pub keys: Vec<String>,
    /// User properties attached to the message.
    pub properties: HashMap<String, String>,
    /// The message payload.
    pub body: Bytes,
    /// The number of times this message has already been handed back for reconsumption.
    pub reconsume_count: u32,
}

impl PulledMessage {
    /// Create a new message with no tag, keys or properties.
    pub fn new(queue: QueueHandle, offset: u64, body: impl Into<Bytes>) -> Self {
        Self {
            queue,
            offset,
            tags: None,
            keys: vec![],
            properties: HashMap::new(),
            body: body.into(),
            reconsume_count: 0,
        }
    }

    /// Builder method to set the message tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags = Some(tag.into());
        self
    }

    /// Builder method to add a user property.
    pub fn with_property(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.properties.insert(key.into(), val.into());
        self
    }

    /// Builder method to add a business key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Look up a property by name, resolving `TAGS` to the message tag.
    pub fn property(&self, name: &str) -> Option<&str> {
        if name == PROPERTY_TAGS {
            return self.tags.as_deref();
        }
        self.properties.get(name).map(String::as_str)
    }

    /// Produce a copy of this message for redelivery, with its reconsume count incremented.
    pub fn redelivery(&self) -> Self {
        let mut msg = self.clone();
        msg.reconsume_count = msg.reconsume_count.saturating_add(1);
        msg
    }
}

/// The outcome of handing a batch of messages to user processing logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The batch was processed and its offsets may be marked consumed.
    Success,
    /// The batch failed and should be redelivered later.
    RetryLater,
    /// Ordered mode only: suspend the whole queue for a while, then redeliver from the same
    /// offset. Treated as `RetryLater` in concurrent mode.
    SuspendQueueAndRetry,
}

impl ConsumeOutcome {
    /// A bool indicating if this outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
