//! Object store backend contract.
//!
//! A backend is a flat key/value store of opaque byte blobs addressed by
//! string keys. Every mutation of an existing object happens under an
//! exclusive lock obtained through [`Backend::locked_fetch`]; the returned
//! [`LockToken`] must be presented to `update`, `release` and `delete`.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackendError;

mod memory;

pub use memory::InMemoryBackend;

/// Proof of an exclusive lock held on one object.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object content together with the backend's version counter.
///
/// The version starts at 1 on creation and increases on every update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedBlob {
    pub bytes: Vec<u8>,
    pub version: u64,
}

/// Capabilities a backend declares at construction.
///
/// Callers branch on these flags, never on the concrete backend type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Objects survive the process.
    pub persistent: bool,
    /// Contents are discarded when the backend is dropped.
    pub delete_on_drop: bool,
}

/// Abstract object store contract.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Atomically create a new object. Fails with `AlreadyExists`.
    async fn create(
        &self,
        address: &str,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError>;

    /// Read an object without locking it.
    async fn fetch(&self, address: &str) -> Result<VersionedBlob, BackendError>;

    /// Take the exclusive lock on an object and read it.
    ///
    /// Blocks until the lock is granted. Fails with `LockTimeout` once
    /// `timeout` has elapsed.
    async fn locked_fetch(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<(LockToken, VersionedBlob), BackendError>;

    /// Overwrite an object whose lock is held by `lock`.
    async fn update(
        &self,
        address: &str,
        lock: &LockToken,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError>;

    /// Release a lock without changing the object.
    async fn release(
        &self,
        address: &str,
        lock: LockToken,
    ) -> Result<(), BackendError>;

    /// Delete an object whose lock is held by `lock`.
    async fn delete(
        &self,
        address: &str,
        lock: LockToken,
    ) -> Result<(), BackendError>;

    async fn exists(&self, address: &str) -> Result<bool, BackendError>;

    /// List every object address in the store.
    async fn list(&self) -> Result<Vec<String>, BackendError>;

    fn capabilities(&self) -> BackendCapabilities;
}
