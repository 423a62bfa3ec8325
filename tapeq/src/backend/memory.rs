use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Backend, BackendCapabilities, LockToken, VersionedBlob};
use crate::error::BackendError;

#[derive(Debug)]
struct Slot {
    bytes: Vec<u8>,
    version: u64,
    lock: Option<LockToken>,
}

/// In-memory backend.
///
/// Suitable for tests and single-process deployments. Lock waiters park on a
/// [`Notify`] and are woken whenever any lock is released or any object is
/// deleted.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    objects: Mutex<HashMap<String, Slot>>,
    released: Notify,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Whether an object is currently locked.
    pub fn is_locked(&self, address: &str) -> bool {
        self.objects
            .lock()
            .get(address)
            .is_some_and(|slot| slot.lock.is_some())
    }

    fn check_lock(
        slot: &Slot,
        address: &str,
        lock: &LockToken,
    ) -> Result<(), BackendError> {
        if slot.lock.as_ref() == Some(lock) {
            Ok(())
        } else {
            Err(BackendError::LockNotHeld {
                address: address.to_string(),
            })
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn create(
        &self,
        address: &str,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError> {
        let mut objects = self.objects.lock();
        if objects.contains_key(address) {
            return Err(BackendError::AlreadyExists(address.to_string()));
        }
        objects.insert(
            address.to_string(),
            Slot {
                bytes,
                version: 1,
                lock: None,
            },
        );
        Ok(())
    }

    async fn fetch(&self, address: &str) -> Result<VersionedBlob, BackendError> {
        self.objects
            .lock()
            .get(address)
            .map(|slot| VersionedBlob {
                bytes: slot.bytes.clone(),
                version: slot.version,
            })
            .ok_or_else(|| BackendError::NoSuchObject(address.to_string()))
    }

    async fn locked_fetch(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<(LockToken, VersionedBlob), BackendError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            // Register interest before checking so a release between the
            // check and the wait is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut objects = self.objects.lock();
                let slot = objects.get_mut(address).ok_or_else(|| {
                    BackendError::NoSuchObject(address.to_string())
                })?;
                if slot.lock.is_none() {
                    let token = LockToken::new();
                    slot.lock = Some(token.clone());
                    return Ok((
                        token,
                        VersionedBlob {
                            bytes: slot.bytes.clone(),
                            version: slot.version,
                        },
                    ));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BackendError::LockTimeout {
                    address: address.to_string(),
                    waited_ms: (now - started).as_millis() as u64,
                });
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn update(
        &self,
        address: &str,
        lock: &LockToken,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError> {
        let mut objects = self.objects.lock();
        let slot = objects
            .get_mut(address)
            .ok_or_else(|| BackendError::NoSuchObject(address.to_string()))?;
        Self::check_lock(slot, address, lock)?;
        slot.bytes = bytes;
        slot.version += 1;
        Ok(())
    }

    async fn release(
        &self,
        address: &str,
        lock: LockToken,
    ) -> Result<(), BackendError> {
        {
            let mut objects = self.objects.lock();
            let slot = objects.get_mut(address).ok_or_else(|| {
                BackendError::NoSuchObject(address.to_string())
            })?;
            Self::check_lock(slot, address, &lock)?;
            slot.lock = None;
        }
        self.released.notify_waiters();
        Ok(())
    }

    async fn delete(
        &self,
        address: &str,
        lock: LockToken,
    ) -> Result<(), BackendError> {
        {
            let mut objects = self.objects.lock();
            let slot = objects.get(address).ok_or_else(|| {
                BackendError::NoSuchObject(address.to_string())
            })?;
            Self::check_lock(slot, address, &lock)?;
            objects.remove(address);
        }
        self.released.notify_waiters();
        Ok(())
    }

    async fn exists(&self, address: &str) -> Result<bool, BackendError> {
        Ok(self.objects.lock().contains_key(address))
    }

    async fn list(&self) -> Result<Vec<String>, BackendError> {
        let mut addresses: Vec<String> =
            self.objects.lock().keys().cloned().collect();
        addresses.sort();
        Ok(addresses)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            persistent: false,
            delete_on_drop: true,
        }
    }
}
