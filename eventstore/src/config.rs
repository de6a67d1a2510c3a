//! Validated configuration for the eventstore and projection handlers.
//!
//! Bounded values are `nutype` newtypes, so an out-of-range setting fails
//! when the configuration is loaded rather than when a handler runs.

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::types::InstanceId;

/// Buffered events per live subscription.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct SubscriptionCapacity(usize);

/// Events fetched per handler transaction.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 200,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BulkLimit(u64);

/// Failed executions after which a statement is skipped.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 5,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxFailureCount(u32);

/// Settings of an [`Eventstore`](crate::Eventstore).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventstoreConfig {
    /// Channel capacity of each subscription.
    pub subscription_capacity: SubscriptionCapacity,
    /// Deadline of a push, including the database transaction.
    pub push_timeout: Option<Duration>,
    /// Deadline of filter and sequence queries.
    pub query_timeout: Option<Duration>,
}

/// Settings of a [`ProjectionHandler`](crate::handler::ProjectionHandler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Events processed per transaction.
    pub bulk_limit: BulkLimit,
    /// Interval of the periodic trigger in live mode.
    pub requeue_every: Duration,
    /// Wait before a failed trigger is repeated.
    pub retry_failed_after: Duration,
    /// Attempts per trigger before waiting for the next wake-up.
    pub retries: u32,
    /// Failures after which a statement is skipped.
    pub max_failure_count: MaxFailureCount,
    /// Lease taken per instance before processing; `None` assumes a single
    /// handler per projection.
    pub lock_duration: Option<Duration>,
    /// Instances to catch up on start. Empty means every instance found in
    /// the log.
    pub instances: Vec<InstanceId>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            bulk_limit: BulkLimit::default(),
            requeue_every: Duration::from_secs(60),
            retry_failed_after: Duration::from_secs(1),
            retries: 3,
            max_failure_count: MaxFailureCount::default(),
            lock_duration: None,
            instances: Vec::new(),
        }
    }
}

impl HandlerConfig {
    /// Sets the bulk limit.
    #[must_use]
    pub const fn with_bulk_limit(mut self, bulk_limit: BulkLimit) -> Self {
        self.bulk_limit = bulk_limit;
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_max_failure_count(mut self, max_failure_count: MaxFailureCount) -> Self {
        self.max_failure_count = max_failure_count;
        self
    }

    /// Enables the per-instance lease.
    #[must_use]
    pub const fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = Some(lock_duration);
        self
    }

    /// Sets the periodic trigger interval.
    #[must_use]
    pub const fn with_requeue_every(mut self, requeue_every: Duration) -> Self {
        self.requeue_every = requeue_every;
        self
    }

    /// Sets the retry delay.
    #[must_use]
    pub const fn with_retry_failed_after(mut self, retry_failed_after: Duration) -> Self {
        self.retry_failed_after = retry_failed_after;
        self
    }

    /// Restricts the handler to these instances.
    #[must_use]
    pub fn with_instances(mut self, instances: Vec<InstanceId>) -> Self {
        self.instances = instances;
        self
    }
}
