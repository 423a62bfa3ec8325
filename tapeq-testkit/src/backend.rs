use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tapeq::backend::{Backend, BackendCapabilities, LockToken, VersionedBlob};
use tapeq::error::BackendError;

/// Backend operations that can be made to fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Create,
    Fetch,
    LockedFetch,
    Update,
    Delete,
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    address_prefix: String,
    remaining: usize,
    transient: bool,
}

/// Backend wrapper failing chosen operations on chosen addresses.
///
/// Transient faults surface as `Contention`, others as `Io`. Operations not
/// matching any armed fault go to the wrapped backend.
#[derive(Debug)]
pub struct FaultInjectingBackend<B> {
    inner: Arc<B>,
    faults: Mutex<Vec<Fault>>,
    injected: Mutex<usize>,
}

impl<B: Backend> FaultInjectingBackend<B> {
    pub fn new(inner: Arc<B>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            injected: Mutex::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }

    /// Fail the next `times` matching operations with a retryable error.
    pub fn fail_transiently(&self, operation: Operation, address_prefix: &str, times: usize) {
        self.arm(operation, address_prefix, times, true);
    }

    /// Fail the next `times` matching operations with an I/O error.
    pub fn fail_hard(&self, operation: Operation, address_prefix: &str, times: usize) {
        self.arm(operation, address_prefix, times, false);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> usize {
        *self.injected.lock()
    }

    fn arm(&self, operation: Operation, address_prefix: &str, times: usize, transient: bool) {
        self.faults.lock().push(Fault {
            operation,
            address_prefix: address_prefix.to_string(),
            remaining: times,
            transient,
        });
    }

    fn check(&self, operation: Operation, address: &str) -> Result<(), BackendError> {
        let mut faults = self.faults.lock();
        let Some(fault) = faults.iter_mut().find(|f| {
            f.operation == operation && f.remaining > 0 && address.starts_with(&f.address_prefix)
        }) else {
            return Ok(());
        };
        fault.remaining -= 1;
        let transient = fault.transient;
        faults.retain(|f| f.remaining > 0);
        *self.injected.lock() += 1;
        if transient {
            Err(BackendError::Contention(address.to_string()))
        } else {
            Err(BackendError::Io(format!("injected {operation:?} failure on {address}")))
        }
    }
}

#[async_trait]
impl<B: Backend> Backend for FaultInjectingBackend<B> {
    async fn create(&self, address: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        self.check(Operation::Create, address)?;
        self.inner.create(address, bytes).await
    }

    async fn fetch(&self, address: &str) -> Result<VersionedBlob, BackendError> {
        self.check(Operation::Fetch, address)?;
        self.inner.fetch(address).await
    }

    async fn locked_fetch(
        &self,
        address: &str,
        timeout: std::time::Duration,
    ) -> Result<(LockToken, VersionedBlob), BackendError> {
        self.check(Operation::LockedFetch, address)?;
        self.inner.locked_fetch(address, timeout).await
    }

    async fn update(
        &self,
        address: &str,
        lock: &LockToken,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError> {
        self.check(Operation::Update, address)?;
        self.inner.update(address, lock, bytes).await
    }

    async fn release(&self, address: &str, lock: LockToken) -> Result<(), BackendError> {
        self.inner.release(address, lock).await
    }

    async fn delete(&self, address: &str, lock: LockToken) -> Result<(), BackendError> {
        self.check(Operation::Delete, address)?;
        self.inner.delete(address, lock).await
    }

    async fn exists(&self, address: &str) -> Result<bool, BackendError> {
        self.inner.exists(address).await
    }

    async fn list(&self) -> Result<Vec<String>, BackendError> {
        self.inner.list().await
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }
}
