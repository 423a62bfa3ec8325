use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tapeq::{Catalogue, DiskSystem, TapeFileLocation};

#[derive(Debug, Default)]
struct CatalogueState {
    disk_systems: Vec<DiskSystem>,
    files: HashMap<(u64, u32), TapeFileLocation>,
    mounts: Vec<(String, String)>,
    fail_disk_systems: bool,
    fail_mount_record: bool,
}

/// In-memory catalogue whose content is set by the test.
///
/// With a default VID, files not registered through
/// [`set_file`](Self::set_file) are reported where [`request_fixture`]
/// (crate::request_fixture) puts them, until forgotten.
#[derive(Clone, Debug, Default)]
pub struct MockCatalogue {
    state: Arc<Mutex<CatalogueState>>,
    forgotten: Arc<Mutex<Vec<(u64, u32)>>>,
    default_vid: Arc<Mutex<Option<String>>>,
}

impl MockCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every unregistered file on `vid` at `fseq == block_id ==
    /// archive_file_id`.
    pub fn with_default_vid(vid: impl Into<String>) -> Self {
        let catalogue = Self::default();
        *catalogue.default_vid.lock() = Some(vid.into());
        catalogue
    }

    pub fn add_disk_system(&self, disk_system: DiskSystem) {
        self.state.lock().disk_systems.push(disk_system);
    }

    pub fn set_file(&self, archive_file_id: u64, copy_nb: u32, location: TapeFileLocation) {
        self.state
            .lock()
            .files
            .insert((archive_file_id, copy_nb), location);
    }

    /// Make the file unknown to the catalogue.
    pub fn forget_file(&self, archive_file_id: u64, copy_nb: u32) {
        self.state.lock().files.remove(&(archive_file_id, copy_nb));
        self.forgotten.lock().push((archive_file_id, copy_nb));
    }

    pub fn fail_disk_systems(&self, fail: bool) {
        self.state.lock().fail_disk_systems = fail;
    }

    pub fn fail_mount_record(&self, fail: bool) {
        self.state.lock().fail_mount_record = fail;
    }

    /// `(vid, drive)` pairs recorded by `tape_mounted_for_retrieve`.
    pub fn recorded_mounts(&self) -> Vec<(String, String)> {
        self.state.lock().mounts.clone()
    }
}

#[async_trait]
impl Catalogue for MockCatalogue {
    async fn get_all_disk_systems(&self) -> anyhow::Result<Vec<DiskSystem>> {
        let state = self.state.lock();
        if state.fail_disk_systems {
            anyhow::bail!("catalogue unavailable");
        }
        Ok(state.disk_systems.clone())
    }

    async fn tape_mounted_for_retrieve(&self, vid: &str, drive: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.fail_mount_record {
            anyhow::bail!("catalogue unavailable");
        }
        state.mounts.push((vid.to_string(), drive.to_string()));
        Ok(())
    }

    async fn get_tape_file(
        &self,
        archive_file_id: u64,
        copy_nb: u32,
    ) -> anyhow::Result<Option<TapeFileLocation>> {
        if let Some(location) = self.state.lock().files.get(&(archive_file_id, copy_nb)) {
            return Ok(Some(location.clone()));
        }
        if self.forgotten.lock().contains(&(archive_file_id, copy_nb)) {
            return Ok(None);
        }
        Ok(self.default_vid.lock().clone().map(|vid| TapeFileLocation {
            vid,
            fseq: archive_file_id,
            block_id: archive_file_id,
        }))
    }
}
