//! Agents: process-scoped owners of in-flight objects.
//!
//! Before an agent touches an object in a way that could leave it orphaned
//! (creating it, moving it between owners), it records the object's address
//! in its ownership set. Should the process die, a collector finds the
//! address there and finishes or undoes the work.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::AgentConfig;
use crate::error::{BackendError, Result, SchedulerError};
use crate::object::{ObjectPayload, ObjectStore, ObjectType};

/// Address of the register listing every live agent.
pub const AGENT_REGISTER_ADDRESS: &str = "AgentRegister";

/// Persistent state of an agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentContent {
    /// Kind of process, e.g. `RetrieveMount` or `GarbageCollector`.
    pub description: String,
    pub heartbeat: u64,
    pub timeout_ms: u64,
    pub owned: BTreeSet<String>,
    /// Set when the agent retired while still owning objects.
    pub needs_gc: bool,
}

impl ObjectPayload for AgentContent {
    const TYPE: ObjectType = ObjectType::Agent;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentRegisterContent {
    pub agents: BTreeSet<String>,
}

impl ObjectPayload for AgentRegisterContent {
    const TYPE: ObjectType = ObjectType::AgentRegister;
}

/// What [`AgentHandle::retire`] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetireOutcome {
    /// The agent owned nothing and was deleted.
    Deleted,
    /// The agent still owns objects and was flagged for collection.
    LeftBehind { owned: usize },
}

/// Handle on one agent object.
pub struct AgentHandle<B> {
    store: ObjectStore<B>,
    address: String,
    leave_behind: Arc<AtomicBool>,
}

impl<B> Clone for AgentHandle<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            address: self.address.clone(),
            leave_behind: Arc::clone(&self.leave_behind),
        }
    }
}

impl<B> std::fmt::Debug for AgentHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("address", &self.address)
            .field("leave_behind", &self.leave_behind.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B: Backend> AgentHandle<B> {
    /// Create a new agent object and list it in the agent register.
    pub async fn register(
        store: ObjectStore<B>,
        agent_type: &str,
        config: &AgentConfig,
    ) -> Result<Self> {
        let host = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| "localhost".to_string());
        let address = format!(
            "{agent_type}-{host}-{}-{}",
            std::process::id(),
            Uuid::new_v4()
        );

        ensure_register(&store).await?;
        let mut register =
            store.lock::<AgentRegisterContent>(AGENT_REGISTER_ADDRESS).await?;
        register.payload.agents.insert(address.clone());
        store.commit_and_release(register).await?;

        let content = AgentContent {
            description: agent_type.to_string(),
            heartbeat: 0,
            timeout_ms: config.heartbeat_timeout_ms,
            owned: BTreeSet::new(),
            needs_gc: false,
        };
        store
            .insert(&address, AGENT_REGISTER_ADDRESS, &content)
            .await?;

        tracing::info!(agent = %address, "agent registered");
        Ok(Self::attach(store, address))
    }

    /// Handle on an existing agent, typically a dead one being collected.
    pub fn attach(store: ObjectStore<B>, address: impl Into<String>) -> Self {
        Self {
            store,
            address: address.into(),
            leave_behind: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &ObjectStore<B> {
        &self.store
    }

    /// Bump the heartbeat counter. Returns the new value.
    pub async fn heartbeat(&self) -> Result<u64> {
        let mut agent = self.store.lock::<AgentContent>(&self.address).await?;
        agent.payload.heartbeat = agent.payload.heartbeat.wrapping_add(1);
        let beat = agent.payload.heartbeat;
        self.store.commit_and_release(agent).await?;
        Ok(beat)
    }

    pub async fn add_to_ownership<I, S>(&self, addresses: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut agent = self.store.lock::<AgentContent>(&self.address).await?;
        agent.payload.owned.extend(addresses.into_iter().map(Into::into));
        self.store.commit_and_release(agent).await
    }

    pub async fn remove_from_ownership<I, S>(&self, addresses: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut agent = self.store.lock::<AgentContent>(&self.address).await?;
        for address in addresses {
            agent.payload.owned.remove(address.as_ref());
        }
        self.store.commit_and_release(agent).await
    }

    pub async fn owned_objects(&self) -> Result<Vec<String>> {
        let agent = self.store.fetch::<AgentContent>(&self.address).await?;
        Ok(agent.payload.owned.into_iter().collect())
    }

    /// Let [`retire`](Self::retire) leave this agent for collection instead
    /// of failing when it still owns objects.
    pub fn leave_non_empty_behind(&self) {
        self.leave_behind.store(true, Ordering::Relaxed);
    }

    /// Remove the agent at the end of its life.
    pub async fn retire(&self) -> Result<RetireOutcome> {
        let mut agent = self.store.lock::<AgentContent>(&self.address).await?;
        let owned = agent.payload.owned.len();
        if owned == 0 {
            self.store.remove(agent).await?;
            unregister_agent(&self.store, &self.address).await?;
            tracing::info!(agent = %self.address, "agent retired");
            return Ok(RetireOutcome::Deleted);
        }

        if self.leave_behind.load(Ordering::Relaxed) {
            agent.payload.needs_gc = true;
            self.store.commit_and_release(agent).await?;
            tracing::warn!(
                agent = %self.address,
                owned,
                "agent retired with owned objects, left for garbage collection"
            );
            return Ok(RetireOutcome::LeftBehind { owned });
        }

        self.store.release(agent).await?;
        Err(SchedulerError::AgentStillOwnsObjects {
            address: self.address.clone(),
            count: owned,
        })
    }
}

async fn ensure_register<B: Backend>(store: &ObjectStore<B>) -> Result<()> {
    if store.exists(AGENT_REGISTER_ADDRESS).await? {
        return Ok(());
    }
    match store
        .insert(
            AGENT_REGISTER_ADDRESS,
            AGENT_REGISTER_ADDRESS,
            &AgentRegisterContent::default(),
        )
        .await
    {
        Err(SchedulerError::Backend(BackendError::AlreadyExists(_))) => {
            Ok(())
        }
        other => other,
    }
}

/// Addresses of every registered agent.
pub async fn registered_agents<B: Backend>(
    store: &ObjectStore<B>,
) -> Result<Vec<String>> {
    match store
        .fetch::<AgentRegisterContent>(AGENT_REGISTER_ADDRESS)
        .await
    {
        Ok(register) => Ok(register.payload.agents.into_iter().collect()),
        Err(err) if err.is_no_such_object() => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

pub(crate) async fn unregister_agent<B: Backend>(
    store: &ObjectStore<B>,
    address: &str,
) -> Result<()> {
    let mut register =
        store.lock::<AgentRegisterContent>(AGENT_REGISTER_ADDRESS).await?;
    register.payload.agents.remove(address);
    store.commit_and_release(register).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::BackendConfig;

    fn store() -> ObjectStore<InMemoryBackend> {
        ObjectStore::new(
            Arc::new(InMemoryBackend::new()),
            &BackendConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let store = store();
        let agent =
            AgentHandle::register(store.clone(), "RetrieveMount", &AgentConfig::default())
                .await
                .unwrap();

        assert!(agent.address().starts_with("RetrieveMount-"));
        assert_eq!(
            registered_agents(&store).await.unwrap(),
            vec![agent.address().to_string()]
        );
        assert_eq!(agent.heartbeat().await.unwrap(), 1);
        assert_eq!(agent.heartbeat().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ownership_round_trip() {
        let store = store();
        let agent = AgentHandle::register(store, "Test", &AgentConfig::default())
            .await
            .unwrap();

        agent.add_to_ownership(["a", "b", "c"]).await.unwrap();
        agent.remove_from_ownership(["b"]).await.unwrap();
        assert_eq!(agent.owned_objects().await.unwrap(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_retire_empty_agent_deletes_it() {
        let store = store();
        let agent =
            AgentHandle::register(store.clone(), "Test", &AgentConfig::default())
                .await
                .unwrap();

        assert_eq!(agent.retire().await.unwrap(), RetireOutcome::Deleted);
        assert!(!store.exists(agent.address()).await.unwrap());
        assert!(registered_agents(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retire_non_empty_agent() {
        let store = store();
        let agent =
            AgentHandle::register(store.clone(), "Test", &AgentConfig::default())
                .await
                .unwrap();
        agent.add_to_ownership(["RetrieveRequest-1"]).await.unwrap();

        let err = agent.retire().await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::AgentStillOwnsObjects { count: 1, .. }
        ));
        assert!(!store.backend().is_locked(agent.address()));

        agent.leave_non_empty_behind();
        assert_eq!(
            agent.retire().await.unwrap(),
            RetireOutcome::LeftBehind { owned: 1 }
        );
        let content = store.fetch::<AgentContent>(agent.address()).await.unwrap();
        assert!(content.payload.needs_gc);
        assert_eq!(registered_agents(&store).await.unwrap().len(), 1);
    }
}
