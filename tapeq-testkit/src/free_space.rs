use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tapeq::{DiskSystem, FreeSpaceSource};

/// Free-space source answering from a table.
///
/// Disk systems missing from the table report unknown free space.
#[derive(Clone, Debug, Default)]
pub struct StaticFreeSpace {
    free: Arc<Mutex<HashMap<String, u64>>>,
    failing: Arc<Mutex<Vec<String>>>,
    queries: Arc<Mutex<HashMap<String, usize>>>,
}

impl StaticFreeSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(disk_system: &str, free: u64) -> Self {
        let source = Self::default();
        source.set(disk_system, free);
        source
    }

    pub fn set(&self, disk_system: &str, free: u64) {
        self.free.lock().insert(disk_system.to_string(), free);
    }

    /// Make queries for `disk_system` return an error.
    pub fn fail(&self, disk_system: &str) {
        self.failing.lock().push(disk_system.to_string());
    }

    /// How many times `disk_system` was queried.
    pub fn queries(&self, disk_system: &str) -> usize {
        self.queries.lock().get(disk_system).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FreeSpaceSource for StaticFreeSpace {
    async fn free_space(&self, disk_system: &DiskSystem) -> anyhow::Result<Option<u64>> {
        *self
            .queries
            .lock()
            .entry(disk_system.name.clone())
            .or_default() += 1;
        if self.failing.lock().contains(&disk_system.name) {
            anyhow::bail!("free space query for {} failed", disk_system.name);
        }
        Ok(self.free.lock().get(&disk_system.name).copied())
    }
}
