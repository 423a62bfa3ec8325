use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a retrieve job, shared with its retrieve request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fair-share activity a retrieve was submitted under.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ActivityDescription {
    pub disk_instance: String,
    pub activity: String,
}

/// One queued retrieve of a tape file copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    /// Address of the retrieve request object backing this job.
    pub address: String,
    pub archive_file_id: u64,
    pub copy_nb: u32,
    /// File sequence number on tape; unique within one queue.
    pub fseq: u64,
    pub block_id: u64,
    /// File size in bytes.
    pub size: u64,
    pub priority: u64,
    /// Minimum age in seconds before the request justifies a mount.
    pub min_retrieve_request_age: u64,
    pub mount_policy_name: String,
    pub activity: Option<ActivityDescription>,
    pub disk_system_name: Option<String>,
    pub start_time: DateTime<Utc>,
}

/// How the drive locates a file on tape.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PositioningMethod {
    ByBlock,
    ByFseq,
}
