//! Garbage collection of objects left behind by dead agents.
//!
//! A collector is itself an agent. Each pass it reads the agent register,
//! watches every other agent's heartbeat, and for each agent found dead it
//! takes over the agent's owned objects one at a time: the object goes into
//! the collector's ownership, is repaired according to its type, and is then
//! dropped from both ownership sets. An agent emptied this way is deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::Instrument;

use crate::agent::{AgentContent, AgentHandle, registered_agents, unregister_agent};
use crate::backend::Backend;
use crate::catalogue::Catalogue;
use crate::config::{GcConfig, QueueConfig};
use crate::error::Result;
use crate::object::{ObjectStore, ObjectType};
use crate::queue::{ShardGcOutcome, garbage_collect_shard};
use crate::request::{RequestGcOutcome, garbage_collect_request};
use crate::retry::retry_transient;
use crate::telemetry::{gc_span, record_gc_object};

/// Liveness tracker for one agent, seen from a collector.
///
/// Death is inferred: the heartbeat counter has not moved for longer than the
/// agent's timeout, measured on the collector's clock.
#[derive(Clone, Debug)]
pub struct AgentWatchdog {
    last_heartbeat: Option<u64>,
    last_change: Instant,
    timeout: Duration,
}

impl AgentWatchdog {
    /// `heartbeat` is `None` while the agent object cannot be read.
    pub fn new(heartbeat: Option<u64>, timeout: Duration, now: Instant) -> Self {
        Self {
            last_heartbeat: heartbeat,
            last_change: now,
            timeout,
        }
    }

    pub fn observe(&mut self, heartbeat: Option<u64>, now: Instant) {
        if heartbeat != self.last_heartbeat {
            self.last_heartbeat = heartbeat;
            self.last_change = now;
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_dead(&self, now: Instant) -> bool {
        now.duration_since(self.last_change) > self.timeout
    }
}

/// What happened to one object taken over from a dead agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GcObjectOutcome {
    AlreadyGone,
    Shard(ShardGcOutcome),
    Request(RequestGcOutcome),
    /// Types with no recovery procedure are only dropped from ownership.
    Ignored(ObjectType),
}

impl GcObjectOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::AlreadyGone
            | Self::Shard(ShardGcOutcome::AlreadyGone)
            | Self::Request(RequestGcOutcome::AlreadyGone) => "already_gone",
            Self::Shard(ShardGcOutcome::Skipped)
            | Self::Request(RequestGcOutcome::Skipped) => "skipped",
            Self::Shard(ShardGcOutcome::Relinked) => "relinked",
            Self::Shard(ShardGcOutcome::Collected { .. }) => "collected",
            Self::Request(RequestGcOutcome::Requeued) => "requeued",
            Self::Request(RequestGcOutcome::Relabelled) => "relabelled",
            Self::Request(RequestGcOutcome::Deleted) => "deleted",
            Self::Ignored(_) => "ignored",
        }
    }
}

/// Result of collecting one dead agent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AgentGcReport {
    pub objects_collected: usize,
    pub objects_failed: usize,
    /// Whether the agent object itself was deleted.
    pub agent_removed: bool,
}

/// Result of one [`GarbageCollector::run_once`] pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GcPassReport {
    pub agents_seen: usize,
    pub dead_agents: usize,
    pub agents_removed: usize,
    pub objects_collected: usize,
    pub objects_failed: usize,
}

pub struct GarbageCollector<B> {
    agent: AgentHandle<B>,
    catalogue: Arc<dyn Catalogue>,
    queue_config: QueueConfig,
    config: GcConfig,
    default_timeout: Duration,
    watchdogs: Mutex<HashMap<String, AgentWatchdog>>,
}

impl<B> std::fmt::Debug for GarbageCollector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("agent", &self.agent)
            .field("config", &self.config)
            .field("watched_agents", &self.watchdogs.lock().len())
            .finish()
    }
}

impl<B: Backend> GarbageCollector<B> {
    /// `agent` is the collector's own, already registered, agent.
    ///
    /// `default_timeout` applies to agents whose object cannot be read.
    pub fn new(
        agent: AgentHandle<B>,
        catalogue: Arc<dyn Catalogue>,
        queue_config: QueueConfig,
        config: GcConfig,
        default_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            catalogue,
            queue_config,
            config,
            default_timeout,
            watchdogs: Mutex::new(HashMap::new()),
        }
    }

    pub fn agent(&self) -> &AgentHandle<B> {
        &self.agent
    }

    fn store(&self) -> &ObjectStore<B> {
        self.agent.store()
    }

    /// Look at every registered agent once and collect the dead ones.
    ///
    /// Failures on one agent are logged and counted; the pass goes on.
    pub async fn run_once(&self) -> Result<GcPassReport> {
        let agents = registered_agents(self.store()).await?;
        let now = Instant::now();
        let mut report = GcPassReport::default();
        let mut dead = Vec::new();

        for address in &agents {
            if address == self.agent.address() {
                continue;
            }
            report.agents_seen += 1;
            let content = match self.store().fetch::<AgentContent>(address).await {
                Ok(agent) => Some(agent.payload),
                Err(err) if err.is_no_such_object() => None,
                Err(err) => {
                    tracing::warn!(agent = %address, error = %err, "cannot read agent");
                    continue;
                }
            };
            if self.observe(address, content.as_ref(), now) {
                dead.push((address.clone(), content.is_some()));
            }
        }
        self.watchdogs
            .lock()
            .retain(|address, _| agents.contains(address));

        for (address, exists) in dead {
            report.dead_agents += 1;
            if !exists {
                // Registered, but the agent object was never created.
                unregister_agent(self.store(), &address).await?;
                self.watchdogs.lock().remove(&address);
                report.agents_removed += 1;
                tracing::info!(agent = %address, "unregistered agent with no object");
                continue;
            }
            match self.collect_agent(&address).await {
                Ok(agent_report) => {
                    report.objects_collected += agent_report.objects_collected;
                    report.objects_failed += agent_report.objects_failed;
                    if agent_report.agent_removed {
                        report.agents_removed += 1;
                        self.watchdogs.lock().remove(&address);
                    }
                }
                Err(err) => {
                    tracing::error!(agent = %address, error = %err, "agent collection failed");
                }
            }
        }
        Ok(report)
    }

    fn observe(&self, address: &str, content: Option<&AgentContent>, now: Instant) -> bool {
        if content.is_some_and(|c| c.needs_gc) {
            return true;
        }
        let heartbeat = content.map(|c| c.heartbeat);
        let timeout = content
            .map(|c| Duration::from_millis(c.timeout_ms))
            .unwrap_or(self.default_timeout);

        let mut watchdogs = self.watchdogs.lock();
        let watchdog = watchdogs
            .entry(address.to_string())
            .or_insert_with(|| AgentWatchdog::new(heartbeat, timeout, now));
        watchdog.set_timeout(timeout);
        watchdog.observe(heartbeat, now);
        watchdog.is_dead(now)
    }

    /// Take over and repair everything `dead_agent` owns, then delete it.
    pub async fn collect_agent(&self, dead_agent: &str) -> Result<AgentGcReport> {
        let span = gc_span(self.agent.address(), dead_agent);
        async move {
            let dead = AgentHandle::attach(self.store().clone(), dead_agent);
            let owned = match dead.owned_objects().await {
                Ok(owned) => owned,
                Err(err) if err.is_no_such_object() => {
                    unregister_agent(self.store(), dead_agent).await?;
                    return Ok(AgentGcReport {
                        agent_removed: true,
                        ..AgentGcReport::default()
                    });
                }
                Err(err) => return Err(err),
            };
            tracing::info!(owned = owned.len(), "collecting dead agent");

            let mut report = AgentGcReport::default();
            for address in owned {
                self.agent.add_to_ownership([address.as_str()]).await?;
                let outcome = retry_transient(&self.config.retry, "collect object", || {
                    self.collect_object(&address, dead_agent)
                })
                .await;
                match outcome {
                    Ok(outcome) => {
                        dead.remove_from_ownership([address.as_str()]).await?;
                        report.objects_collected += 1;
                        let object_type = match outcome {
                            GcObjectOutcome::Shard(_) => ObjectType::RetrieveQueueShard.as_str(),
                            GcObjectOutcome::Request(_) => ObjectType::RetrieveRequest.as_str(),
                            GcObjectOutcome::Ignored(object_type) => object_type.as_str(),
                            GcObjectOutcome::AlreadyGone => "unknown",
                        };
                        record_gc_object(&address, object_type, outcome.label());
                    }
                    Err(err) => {
                        report.objects_failed += 1;
                        tracing::error!(
                            address = %address,
                            error = %err,
                            "failed to collect object, left with its owner"
                        );
                    }
                }
                self.agent.remove_from_ownership([address.as_str()]).await?;
            }

            if report.objects_failed == 0 {
                report.agent_removed = self.remove_agent_if_empty(dead_agent).await?;
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn collect_object(
        &self,
        address: &str,
        dead_agent: &str,
    ) -> Result<GcObjectOutcome> {
        let header = match self.store().fetch_header(address).await {
            Ok(header) => header,
            Err(err) if err.is_no_such_object() => {
                return Ok(GcObjectOutcome::AlreadyGone);
            }
            Err(err) => return Err(err),
        };
        match header.object_type {
            ObjectType::RetrieveQueueShard => garbage_collect_shard(
                self.store(),
                &self.queue_config,
                address,
                dead_agent,
                &self.agent,
                self.catalogue.as_ref(),
            )
            .await
            .map(GcObjectOutcome::Shard),
            ObjectType::RetrieveRequest => garbage_collect_request(
                self.store(),
                &self.queue_config,
                address,
                dead_agent,
                &self.agent,
                self.catalogue.as_ref(),
            )
            .await
            .map(GcObjectOutcome::Request),
            other => {
                tracing::warn!(
                    address,
                    object_type = %other,
                    "no recovery procedure for object type, dropping from ownership"
                );
                Ok(GcObjectOutcome::Ignored(other))
            }
        }
    }

    async fn remove_agent_if_empty(&self, address: &str) -> Result<bool> {
        let agent = match self.store().lock::<AgentContent>(address).await {
            Ok(agent) => agent,
            Err(err) if err.is_no_such_object() => {
                unregister_agent(self.store(), address).await?;
                return Ok(true);
            }
            Err(err) => return Err(err),
        };
        if !agent.payload.owned.is_empty() {
            self.store().release(agent).await?;
            return Ok(false);
        }
        self.store().remove(agent).await?;
        unregister_agent(self.store(), address).await?;
        tracing::info!(agent = %address, "dead agent removed");
        Ok(true)
    }
}
