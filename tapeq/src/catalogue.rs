use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A disk buffer system retrieved files are written to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiskSystem {
    pub name: String,
    /// Where the free-space source reads this system's free space from.
    pub free_space_query_url: String,
    /// Seconds a free-space reading stays valid.
    pub refresh_interval_secs: u64,
    /// Bytes that must remain free after all admitted retrieves land.
    pub targeted_free_space: u64,
    /// Seconds a queue should back off after the system was found full.
    pub sleep_time_secs: u64,
}

/// Current location of a tape file copy.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TapeFileLocation {
    pub vid: String,
    pub fseq: u64,
    pub block_id: u64,
}

/// Catalogue operations the scheduler depends on.
///
/// Errors from the catalogue are opaque and surfaced as
/// [`SchedulerError::Catalogue`](crate::SchedulerError::Catalogue).
#[async_trait]
pub trait Catalogue: Send + Sync {
    /// All configured disk systems.
    async fn get_all_disk_systems(&self) -> anyhow::Result<Vec<DiskSystem>>;

    /// Record that `vid` was mounted in `drive` for retrieval.
    async fn tape_mounted_for_retrieve(
        &self,
        vid: &str,
        drive: &str,
    ) -> anyhow::Result<()>;

    /// Where a copy of an archive file currently lives, if anywhere.
    async fn get_tape_file(
        &self,
        archive_file_id: u64,
        copy_nb: u32,
    ) -> anyhow::Result<Option<TapeFileLocation>>;
}
