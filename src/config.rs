//! Consumer configuration.

use std::time::Duration;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::error::{ConsumerError, Result};
use crate::offset::StartingPoint;

/// The environment variable prefix used by `ConsumerConfig::from_env`.
pub const ENV_PREFIX: &str = "HADRON_CONSUMER_";

/// Push consumer configuration.
///
/// Every field has a default, so an empty environment yields a usable config.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsumerConfig {
    /// The name of the consumer group, attached to logs.
    pub consumer_group: String,
    /// The initial size of the worker pool.
    pub core_pool_size: usize,
    /// The maximum number of messages fetched per long-poll.
    pub pull_batch_size: u32,
    /// The maximum number of messages handed to a single handler invocation.
    pub consume_batch_size: usize,
    /// The maximum time a long-poll fetch may block at the broker.
    pub poll_timeout_ms: u64,
    /// How long pull loops sleep between checks while the consumer is suspended.
    pub suspend_delay_ms: u64,
    /// How long pull loops sleep when their queue's cached backlog is over threshold.
    pub flow_control_delay_ms: u64,
    /// The maximum number of admitted but unfinished messages cached per queue.
    pub pull_threshold_per_queue: usize,
    /// Concurrent mode: the maximum offset span between the oldest and newest unfinished message
    /// of a queue.
    pub max_span: u64,
    /// The initial backoff after a transport error.
    pub pull_backoff_initial_ms: u64,
    /// The maximum backoff after repeated transport errors.
    pub pull_backoff_max_ms: u64,
    /// The number of redeliveries before a message is dead-lettered; `-1` never dead-letters.
    pub max_reconsume_times: i32,
    /// Concurrent mode: the delay before the first redelivery of a message.
    pub retry_delay_initial_ms: u64,
    /// Concurrent mode: the growth factor applied to the retry delay per redelivery.
    pub retry_delay_multiplier: f64,
    /// Concurrent mode: the maximum retry delay.
    pub retry_delay_max_ms: u64,
    /// Ordered mode: how long a queue stays suspended after a failed batch.
    pub suspend_queue_ms: u64,
    /// The interval between periodic offset commits.
    pub commit_interval_ms: u64,
    /// The maximum time shutdown waits for in-flight handler invocations.
    pub shutdown_grace_ms: u64,
    /// Where to start consuming a queue which has no stored offset.
    #[serde(deserialize_with = "ConsumerConfig::parse_starting_point")]
    pub starting_point: StartingPoint,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "default-group".into(),
            core_pool_size: 20,
            pull_batch_size: 32,
            consume_batch_size: 1,
            poll_timeout_ms: 15_000,
            suspend_delay_ms: 1_000,
            flow_control_delay_ms: 50,
            pull_threshold_per_queue: 1_000,
            max_span: 2_000,
            pull_backoff_initial_ms: 100,
            pull_backoff_max_ms: 30_000,
            max_reconsume_times: 16,
            retry_delay_initial_ms: 1_000,
            retry_delay_multiplier: 2.0,
            retry_delay_max_ms: 60_000,
            suspend_queue_ms: 1_000,
            commit_interval_ms: 5_000,
            shutdown_grace_ms: 10_000,
            starting_point: StartingPoint::Latest,
        }
    }
}

impl ConsumerConfig {
    /// Build a config from environment variables prefixed with `HADRON_CONSUMER_`.
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|err| ConsumerError::InvalidArgument(format!("error building consumer config from env: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate this config, rejecting values which would wedge or spin the consumer.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: &str| if ok { Ok(()) } else { Err(ConsumerError::InvalidArgument(msg.into())) };
        check(!self.consumer_group.trim().is_empty(), "consumer_group may not be empty")?;
        check(self.core_pool_size > 0, "core_pool_size must be greater than 0")?;
        check(self.pull_batch_size > 0, "pull_batch_size must be greater than 0")?;
        check(self.consume_batch_size > 0, "consume_batch_size must be greater than 0")?;
        check(self.pull_threshold_per_queue > 0, "pull_threshold_per_queue must be greater than 0")?;
        check(self.max_span > 0, "max_span must be greater than 0")?;
        check(self.max_reconsume_times >= -1, "max_reconsume_times must be -1 or greater")?;
        check(self.pull_backoff_initial_ms > 0, "pull_backoff_initial_ms must be greater than 0")?;
        check(
            self.pull_backoff_max_ms >= self.pull_backoff_initial_ms,
            "pull_backoff_max_ms may not be less than pull_backoff_initial_ms",
        )?;
        check(
            self.retry_delay_multiplier.is_finite() && self.retry_delay_multiplier >= 1.0,
            "retry_delay_multiplier must be a finite value of at least 1.0",
        )?;
        check(
            self.retry_delay_max_ms >= self.retry_delay_initial_ms,
            "retry_delay_max_ms may not be less than retry_delay_initial_ms",
        )?;
        check(self.commit_interval_ms > 0, "commit_interval_ms must be greater than 0")?;
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn suspend_delay(&self) -> Duration {
        Duration::from_millis(self.suspend_delay_ms)
    }

    pub fn flow_control_delay(&self) -> Duration {
        Duration::from_millis(self.flow_control_delay_ms)
    }

    pub fn suspend_queue(&self) -> Duration {
        Duration::from_millis(self.suspend_queue_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check if a message which has been redelivered `reconsume_count` times is exhausted.
    pub fn retries_exhausted(&self, reconsume_count: u32) -> bool {
        self.max_reconsume_times >= 0 && i64::from(reconsume_count) >= i64::from(self.max_reconsume_times)
    }

    /// The delay before redelivering a message in concurrent mode.
    ///
    /// `reconsume_count` is the count carried by the redelivered copy, so the first retry uses
    /// the initial delay.
    pub fn retry_delay(&self, reconsume_count: u32) -> Duration {
        let exp = reconsume_count.saturating_sub(1).min(64) as i32;
        let millis = (self.retry_delay_initial_ms as f64) * self.retry_delay_multiplier.powi(exp);
        let capped = millis.min(self.retry_delay_max_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Parse a starting point from `beginning`, `latest` or a literal offset.
    fn parse_starting_point<'de, D: Deserializer<'de>>(val: D) -> std::result::Result<StartingPoint, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "beginning" => Ok(StartingPoint::Beginning),
            "latest" => Ok(StartingPoint::Latest),
            other => other
                .parse::<u64>()
                .map(StartingPoint::Offset)
                .map_err(|_| DeError::custom(format!("invalid starting point {:?}, expected beginning, latest or an offset", raw))),
        }
    }
}
