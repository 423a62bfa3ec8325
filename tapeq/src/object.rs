//! Typed objects on top of a [`Backend`].
//!
//! Each stored object is a JSON envelope holding an [`ObjectHeader`] (type,
//! owner, previous owner) and a typed payload. Objects refer to each other only
//! by address. The owner field is what garbage collection inspects to decide
//! whether an object was abandoned by a dead agent.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, LockToken};
use crate::config::BackendConfig;
use crate::error::{BackendError, Result, SchedulerError};

/// Kinds of object kept in the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Agent,
    AgentRegister,
    RetrieveQueue,
    RetrieveQueueShard,
    RetrieveRequest,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Agent => "agent",
            ObjectType::AgentRegister => "agent_register",
            ObjectType::RetrieveQueue => "retrieve_queue",
            ObjectType::RetrieveQueueShard => "retrieve_queue_shard",
            ObjectType::RetrieveRequest => "retrieve_request",
        }
    }
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A payload type that can be stored as an object.
pub trait ObjectPayload:
    Serialize + DeserializeOwned + Send + Sync + 'static
{
    const TYPE: ObjectType;
}

/// Metadata common to every object.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub object_type: ObjectType,
    pub owner: String,
    pub backup_owner: String,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    header: &'a ObjectHeader,
    payload: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    header: ObjectHeader,
    payload: T,
}

#[derive(Deserialize)]
struct HeaderOnly {
    header: ObjectHeader,
}

/// An object read without a lock.
#[derive(Clone, Debug)]
pub struct Fetched<T> {
    pub address: String,
    pub header: ObjectHeader,
    pub payload: T,
    pub version: u64,
}

/// An object read under its exclusive lock.
///
/// Must be handed back to [`ObjectStore::commit_and_release`],
/// [`ObjectStore::release`] or [`ObjectStore::remove`].
#[derive(Debug)]
pub struct Locked<T> {
    address: String,
    token: LockToken,
    pub header: ObjectHeader,
    pub payload: T,
}

impl<T> Locked<T> {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn owner(&self) -> &str {
        &self.header.owner
    }

    /// Change the owner, keeping the previous one as backup owner.
    pub fn set_owner(&mut self, owner: impl Into<String>) {
        let previous =
            std::mem::replace(&mut self.header.owner, owner.into());
        self.header.backup_owner = previous;
    }
}

/// Typed access to a backend.
pub struct ObjectStore<B> {
    backend: Arc<B>,
    lock_timeout: Duration,
}

impl<B> Clone for ObjectStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<B> std::fmt::Debug for ObjectStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("backend_type", &std::any::type_name::<B>())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl<B: Backend> ObjectStore<B> {
    pub fn new(backend: Arc<B>, config: &BackendConfig) -> Self {
        Self {
            backend,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Create a new object owned by `owner`.
    pub async fn insert<T: ObjectPayload>(
        &self,
        address: &str,
        owner: &str,
        payload: &T,
    ) -> Result<()> {
        let header = ObjectHeader {
            object_type: T::TYPE,
            owner: owner.to_string(),
            backup_owner: owner.to_string(),
        };
        let bytes = encode(&header, payload)?;
        self.backend.create(address, bytes).await?;
        Ok(())
    }

    pub async fn fetch<T: ObjectPayload>(
        &self,
        address: &str,
    ) -> Result<Fetched<T>> {
        let blob = self.backend.fetch(address).await?;
        let (header, payload) = decode::<T>(address, &blob.bytes)?;
        Ok(Fetched {
            address: address.to_string(),
            header,
            payload,
            version: blob.version,
        })
    }

    /// Read only the header, whatever the payload type.
    pub async fn fetch_header(&self, address: &str) -> Result<ObjectHeader> {
        let blob = self.backend.fetch(address).await?;
        let header: HeaderOnly = serde_json::from_slice(&blob.bytes)?;
        Ok(header.header)
    }

    pub async fn lock<T: ObjectPayload>(
        &self,
        address: &str,
    ) -> Result<Locked<T>> {
        let (token, blob) =
            self.backend.locked_fetch(address, self.lock_timeout).await?;
        match decode::<T>(address, &blob.bytes) {
            Ok((header, payload)) => Ok(Locked {
                address: address.to_string(),
                token,
                header,
                payload,
            }),
            Err(err) => {
                self.backend.release(address, token).await?;
                Err(err)
            }
        }
    }

    /// Write a locked object back, keeping the lock.
    pub async fn commit<T: ObjectPayload>(
        &self,
        locked: &Locked<T>,
    ) -> Result<()> {
        let bytes = encode(&locked.header, &locked.payload)?;
        self.backend
            .update(&locked.address, &locked.token, bytes)
            .await?;
        Ok(())
    }

    pub async fn commit_and_release<T: ObjectPayload>(
        &self,
        locked: Locked<T>,
    ) -> Result<()> {
        let committed = self.commit(&locked).await;
        self.backend.release(&locked.address, locked.token).await?;
        committed
    }

    pub async fn release<T>(&self, locked: Locked<T>) -> Result<()> {
        self.backend.release(&locked.address, locked.token).await?;
        Ok(())
    }

    /// Delete a locked object. The lock is released if the delete fails.
    pub async fn remove<T>(&self, locked: Locked<T>) -> Result<()> {
        let Locked { address, token, .. } = locked;
        let Err(err) = self.backend.delete(&address, token.clone()).await else {
            return Ok(());
        };
        if !matches!(err, BackendError::NoSuchObject(_))
            && let Err(release_err) = self.backend.release(&address, token).await
        {
            tracing::error!(
                object = %address,
                error = %release_err,
                "failed to release lock after failed delete"
            );
        }
        Err(err.into())
    }

    pub async fn exists(&self, address: &str) -> Result<bool> {
        Ok(self.backend.exists(address).await?)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.backend.list().await?)
    }
}

fn encode<T: Serialize>(header: &ObjectHeader, payload: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&EnvelopeRef { header, payload })?)
}

fn decode<T: ObjectPayload>(
    address: &str,
    bytes: &[u8],
) -> Result<(ObjectHeader, T)> {
    let HeaderOnly { header } = serde_json::from_slice(bytes)?;
    if header.object_type != T::TYPE {
        return Err(SchedulerError::WrongType {
            address: address.to_string(),
            expected: T::TYPE.as_str(),
            found: header.object_type.to_string(),
        });
    }
    let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
    Ok((envelope.header, envelope.payload))
}
