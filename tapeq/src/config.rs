use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::shard::InsertStrategy;

/// Configuration for shard sizing within a logical queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs a shard may hold before it is split.
    pub max_shard_size: u64,
    /// Adjacent shards whose combined job count is at most this are merged.
    pub merge_threshold: u64,
    /// How jobs are inserted into a shard that stays under its size limit.
    pub insert_strategy: InsertStrategy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_shard_size: 25_000,
            merge_threshold: 5_000,
            insert_strategy: InsertStrategy::InPlace,
        }
    }
}

/// Configuration for object store access.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    /// How long a locked fetch waits before giving up.
    pub lock_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
        }
    }
}

/// Configuration for agent liveness.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// An agent whose heartbeat has not moved for this long is dead.
    pub heartbeat_timeout_ms: u64,
    /// Interval between heartbeats of the background heartbeat task.
    pub heartbeat_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// Configuration for the garbage collector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Interval between collection passes of the background collector.
    pub interval_ms: u64,
    /// Backoff applied to transient failures while collecting an object.
    pub retry: RetryConfig,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

/// Configuration for a retrieve mount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountConfig {
    /// Failures tolerated for one job before this mount stops offering it.
    pub max_retries_within_mount: u32,
    /// Failures tolerated for one job across all mounts before it is failed.
    pub max_total_retries: u32,
    /// Upper bound on query rounds per `get_next_job_batch` call.
    pub max_batch_rounds: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            max_retries_within_mount: 3,
            max_total_retries: 6,
            max_batch_rounds: 16,
        }
    }
}

/// Aggregate configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub queue: QueueConfig,
    pub backend: BackendConfig,
    pub agent: AgentConfig,
    pub gc: GcConfig,
    pub mount: MountConfig,
}
