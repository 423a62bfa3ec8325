//! tapeq - Sharded retrieve queues and mount scheduling for tape libraries.
//!
//! Retrieve jobs wait in one logical queue per tape (VID). Each queue is an
//! object in a shared object store pointing at an fSeq-ordered list of
//! bounded shards. Tape-server processes pop batches of jobs for the tape they
//! have mounted, subject to quotas and to the free space of the disk systems
//! the files are retrieved to. Any process may die at any point; garbage
//! collectors repair what it left behind.
//!
//! # Core Concepts
//!
//! - **Backend**: The [`Backend`] trait is the object store contract: create,
//!   fetch, locked fetch, update, delete and list of opaque versioned blobs.
//!   [`InMemoryBackend`] is the reference implementation.
//!
//! - **Objects**: [`ObjectStore`] layers typed JSON payloads with an owner
//!   header on top of a backend.
//!
//! - **Agents**: An [`AgentHandle`] records every object its process is in the
//!   middle of changing, so that a [`GarbageCollector`] can finish the work if
//!   the process dies.
//!
//! - **Queues**: [`RetrieveQueue`] manages the shards of one tape's queue and
//!   [`RetrieveQueueShard`] holds the jobs themselves. Each job is backed by a
//!   retrieve request object, see [`queue_retrieve_requests`].
//!
//! - **Mounts**: A [`RetrieveMount`] drains a queue for one drive session.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use tapeq::*;
//!
//! let store = ObjectStore::new(Arc::new(InMemoryBackend::new()), &BackendConfig::default());
//! let queue = RetrieveQueue::open_or_create(store.clone(), "V00001", QueueConfig::default()).await?;
//! let agent = AgentHandle::register(store, "RetrieveMount", &AgentConfig::default()).await?;
//! let mount = RetrieveMount::builder()
//!     .with_info(info)
//!     .with_queue(queue)
//!     .with_agent(agent)
//!     .with_catalogue(catalogue)
//!     .with_free_space(free_space)
//!     .build()?;
//! mount.start_session().await?;
//! let batch = mount.get_next_job_batch(100, 10 << 30).await?;
//! ```

/// Agents, ownership sets and the agent register.
pub mod agent;

/// Object store backend contract and the in-memory backend.
pub mod backend;

/// Catalogue interface consumed by mounts and garbage collection.
pub mod catalogue;

/// Configuration structures for queues, backends, agents, GC and mounts.
pub mod config;

/// Per-batch disk system free-space admission.
pub mod disk_space;

/// Error types.
pub mod error;

/// Garbage collection of dead agents' objects.
pub mod gc;

/// Retrieve job descriptions.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Retrieve mounts and their batch scheduler.
pub mod mount;

/// Typed object envelope over a backend.
pub mod object;

/// Logical retrieve queues.
pub mod queue;

/// Recommended access order strategies.
pub mod rao;

/// Retrieve request objects.
pub mod request;

/// Retry and backoff policy.
pub mod retry;

/// Background heartbeat and collector tasks.
pub mod runtime;

/// Queue shards.
pub mod shard;

/// Tracing spans and event helpers.
pub mod telemetry;

pub use agent::{AgentHandle, RetireOutcome};
pub use backend::{Backend, BackendCapabilities, InMemoryBackend, LockToken, VersionedBlob};
pub use catalogue::{Catalogue, DiskSystem, TapeFileLocation};
pub use config::*;
pub use disk_space::{Admission, DiskSystemFreeSpaceList, FreeSpaceSource};
pub use error::{BackendError, Result, SchedulerError};
pub use gc::{AgentGcReport, AgentWatchdog, GarbageCollector, GcObjectOutcome, GcPassReport};
pub use job::*;
pub use mount::{
    DriveStatus, FlushReport, MountInfo, RetrieveJob, RetrieveMount, RetrieveMountBuilder,
    SessionState,
};
pub use object::{ObjectHeader, ObjectPayload, ObjectStore, ObjectType};
pub use queue::{
    MountCriteria, QueueCandidate, QueueCandidateList, QueueStatistics, RetrieveQueue,
    ShardGcOutcome, queue_address,
};
pub use rao::{FseqOrder, RaoStrategy};
pub use request::{
    NewRetrieveRequest, RequestGcOutcome, RequestStatus, RetrieveRequestContent,
    queue_retrieve_requests, request_address,
};
pub use retry::{FailureDecision, RetryConfig};
pub use runtime::{ShutdownToken, spawn_collector, spawn_heartbeat};
pub use shard::{CandidateJobList, InsertStrategy, JobsSummary, RetrieveQueueShard};
