//! A long-polling push consumer for partitioned message queues.
//!
//! A `PushConsumer` pulls messages from the queues assigned to it by an external rebalancer,
//! filters them against its topic subscriptions, and pushes the admitted messages to a
//! registered handler, either concurrently or in strict per-queue order. Offsets are committed
//! only up to the lowest message which has not yet reached a terminal disposition.

pub mod assignment;
pub mod config;
pub mod consumer;
#[cfg(test)]
mod consumer_test;
pub mod dispatch;
pub mod error;
pub mod filter;
#[cfg(test)]
mod fixtures;
pub mod flow;
pub mod handler;
pub mod message;
pub mod offset;
pub mod pull;
pub mod subscription;
pub mod transport;

pub use async_trait::async_trait;

pub use crate::{
    assignment::AssignmentView,
    config::ConsumerConfig,
    consumer::{PushConsumer, ServiceState},
    error::{ConsumerError, Result},
    filter::{ExpressionKind, MessageSelector},
    handler::{ConcurrentHandler, ConsumeContext, DeadLetterSink, LoggingDeadLetterSink, MessageListener, OrderlyHandler},
    message::{ConsumeOutcome, PulledMessage, QueueHandle},
    offset::{MemoryOffsetStore, OffsetStore, SledOffsetStore, StartingPoint},
    transport::Transport,
};

pub(crate) const METRIC_MESSAGES_CONSUMED: &str = "hadron_consumer_messages_consumed";
pub(crate) const METRIC_MESSAGES_FILTERED: &str = "hadron_consumer_messages_filtered";
pub(crate) const METRIC_MESSAGES_RETRIED: &str = "hadron_consumer_messages_retried";
pub(crate) const METRIC_MESSAGES_DEAD_LETTERED: &str = "hadron_consumer_messages_dead_lettered";
pub(crate) const METRIC_PULL_ERRORS: &str = "hadron_consumer_pull_errors";
pub(crate) const METRIC_COMMIT_ERRORS: &str = "hadron_consumer_commit_errors";
pub(crate) const METRIC_CORE_POOL_SIZE: &str = "hadron_consumer_core_pool_size";

/// Register the consumer's metrics with the installed recorder.
pub(crate) fn register_metrics() {
    metrics::register_counter!(METRIC_MESSAGES_CONSUMED, metrics::Unit::Count, "messages which reached a successful disposition");
    metrics::register_counter!(METRIC_MESSAGES_FILTERED, metrics::Unit::Count, "pulled messages rejected by a subscription filter");
    metrics::register_counter!(METRIC_MESSAGES_RETRIED, metrics::Unit::Count, "messages scheduled for redelivery");
    metrics::register_counter!(METRIC_MESSAGES_DEAD_LETTERED, metrics::Unit::Count, "messages routed to the dead-letter sink");
    metrics::register_counter!(METRIC_PULL_ERRORS, metrics::Unit::Count, "transport errors while pulling messages");
    metrics::register_counter!(METRIC_COMMIT_ERRORS, metrics::Unit::Count, "errors while committing offsets");
    metrics::register_gauge!(METRIC_CORE_POOL_SIZE, metrics::Unit::Count, "the size of the handler worker pool");
}
