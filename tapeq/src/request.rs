//! Retrieve requests: the durable record behind every queued job.
//!
//! The request object's owner says who is responsible for the job: the
//! queue address while it waits in a shard, an agent address while a mount
//! holds it.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::agent::AgentHandle;
use crate::backend::Backend;
use crate::catalogue::{Catalogue, TapeFileLocation};
use crate::config::QueueConfig;
use crate::error::{Result, SchedulerError};
use crate::job::{ActivityDescription, JobId, JobInfo};
use crate::object::{ObjectPayload, ObjectStore, ObjectType};
use crate::queue::{RetrieveQueue, queue_address};

pub fn request_address(job_id: &JobId) -> String {
    format!("RetrieveRequest-{job_id}")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RequestStatus {
    Queued,
    InFlight,
    /// Given up on; about to be deleted.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveRequestContent {
    pub job: JobInfo,
    pub vid: String,
    pub dst_url: String,
    pub status: RequestStatus,
    pub retries_within_mount: u32,
    pub total_retries: u32,
    pub last_mount_id: Option<u64>,
    pub failure_log: Vec<String>,
}

impl ObjectPayload for RetrieveRequestContent {
    const TYPE: ObjectType = ObjectType::RetrieveRequest;
}

/// A retrieve to be queued on the tape holding the file copy.
#[derive(Clone, Debug)]
pub struct NewRetrieveRequest {
    pub archive_file_id: u64,
    pub copy_nb: u32,
    pub fseq: u64,
    pub block_id: u64,
    pub size: u64,
    pub priority: u64,
    pub min_retrieve_request_age: u64,
    pub mount_policy_name: String,
    pub activity: Option<ActivityDescription>,
    pub disk_system_name: Option<String>,
    pub dst_url: String,
}

impl NewRetrieveRequest {
    fn into_content(self, vid: &str) -> RetrieveRequestContent {
        let job_id = JobId::new();
        RetrieveRequestContent {
            job: JobInfo {
                job_id,
                address: request_address(&job_id),
                archive_file_id: self.archive_file_id,
                copy_nb: self.copy_nb,
                fseq: self.fseq,
                block_id: self.block_id,
                size: self.size,
                priority: self.priority,
                min_retrieve_request_age: self.min_retrieve_request_age,
                mount_policy_name: self.mount_policy_name,
                activity: self.activity,
                disk_system_name: self.disk_system_name,
                start_time: Utc::now(),
            },
            vid: vid.to_string(),
            dst_url: self.dst_url,
            status: RequestStatus::Queued,
            retries_within_mount: 0,
            total_retries: 0,
            last_mount_id: None,
            failure_log: Vec::new(),
        }
    }
}

/// Create request objects and queue their jobs.
///
/// On `DuplicateFseq` the created requests are deleted again and nothing is
/// queued.
pub async fn queue_retrieve_requests<B: Backend>(
    queue: &RetrieveQueue<B>,
    agent: &AgentHandle<B>,
    requests: Vec<NewRetrieveRequest>,
) -> Result<Vec<JobId>> {
    let store = queue.store();
    let contents: Vec<RetrieveRequestContent> = requests
        .into_iter()
        .map(|request| request.into_content(queue.vid()))
        .collect();
    let addresses: Vec<String> =
        contents.iter().map(|c| c.job.address.clone()).collect();

    agent.add_to_ownership(addresses.iter().cloned()).await?;
    for content in &contents {
        store
            .insert(&content.job.address, agent.address(), content)
            .await?;
    }

    let jobs = contents.iter().map(|c| c.job.clone()).collect();
    if let Err(err) = queue.add_jobs(jobs, agent).await {
        for address in &addresses {
            delete_request(store, address).await?;
        }
        agent.remove_from_ownership(&addresses).await?;
        return Err(err);
    }

    for address in &addresses {
        let mut request = store.lock::<RetrieveRequestContent>(address).await?;
        request.set_owner(queue.address());
        store.commit_and_release(request).await?;
    }
    agent.remove_from_ownership(&addresses).await?;

    Ok(contents.iter().map(|c| c.job.job_id).collect())
}

/// Delete a request. Returns `false` if it was already gone.
pub(crate) async fn delete_request<B: Backend>(
    store: &ObjectStore<B>,
    address: &str,
) -> Result<bool> {
    match store.lock::<RetrieveRequestContent>(address).await {
        Ok(request) => {
            store.remove(request).await?;
            Ok(true)
        }
        Err(err) if err.is_no_such_object() => Ok(false),
        Err(err) => Err(err),
    }
}

/// Point a request at the tape file's current location.
pub(crate) async fn repair_location<B: Backend>(
    store: &ObjectStore<B>,
    address: &str,
    location: &TapeFileLocation,
) -> Result<()> {
    let mut request = store.lock::<RetrieveRequestContent>(address).await?;
    apply_location(&mut request.payload, location);
    store.commit_and_release(request).await
}

fn apply_location(
    request: &mut RetrieveRequestContent,
    location: &TapeFileLocation,
) {
    tracing::info!(
        request = %request.job.address,
        from_vid = %request.vid,
        to_vid = %location.vid,
        fseq = location.fseq,
        "retrieve request location repaired"
    );
    request.vid = location.vid.clone();
    request.job.fseq = location.fseq;
    request.job.block_id = location.block_id;
}

/// What the collector did with an orphaned request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestGcOutcome {
    AlreadyGone,
    /// Owned by someone alive, or queued where it belongs.
    Skipped,
    /// Job put back in its queue.
    Requeued,
    /// Job already queued; only the owner was fixed.
    Relabelled,
    /// Tape file gone, failed, or fSeq taken: request deleted.
    Deleted,
}

/// Collect a request found in a dead agent's ownership.
///
/// The request is recovered when `presumed_owner` still owns it, or when its
/// queue owns it but no longer holds its job. Recovery checks the tape file
/// in the catalogue, then makes sure the job is queued and the queue owns the
/// request. Running it twice is harmless.
pub async fn garbage_collect_request<B: Backend>(
    store: &ObjectStore<B>,
    config: &QueueConfig,
    address: &str,
    presumed_owner: &str,
    collector: &AgentHandle<B>,
    catalogue: &dyn Catalogue,
) -> Result<RequestGcOutcome> {
    let mut request = match store.lock::<RetrieveRequestContent>(address).await {
        Ok(request) => request,
        Err(err) if err.is_no_such_object() => {
            return Ok(RequestGcOutcome::AlreadyGone);
        }
        Err(err) => return Err(err),
    };

    let owned_by_presumed = request.owner() == presumed_owner;
    if !owned_by_presumed {
        let owner_queue = queue_address(&request.payload.vid);
        let lost_by_queue = if request.owner() == owner_queue {
            let queue = RetrieveQueue::open_or_create(
                store.clone(),
                &request.payload.vid,
                config.clone(),
            )
            .await;
            match queue {
                Ok(queue) => match queue.contains(&request.payload.job.job_id).await {
                    Ok(contains) => !contains,
                    Err(err) => {
                        store.release(request).await?;
                        return Err(err);
                    }
                },
                Err(err) => {
                    store.release(request).await?;
                    return Err(err);
                }
            }
        } else {
            false
        };
        if !lost_by_queue {
            store.release(request).await?;
            return Ok(RequestGcOutcome::Skipped);
        }
    }

    if request.payload.status == RequestStatus::Failed {
        tracing::warn!(request = %address, "deleting failed retrieve request");
        store.remove(request).await?;
        return Ok(RequestGcOutcome::Deleted);
    }

    let location = match catalogue
        .get_tape_file(request.payload.job.archive_file_id, request.payload.job.copy_nb)
        .await
    {
        Ok(location) => location,
        Err(err) => {
            store.release(request).await?;
            return Err(SchedulerError::Catalogue(err));
        }
    };
    let Some(location) = location else {
        tracing::warn!(
            request = %address,
            archive_file_id = request.payload.job.archive_file_id,
            "tape file no longer exists, deleting retrieve request"
        );
        store.remove(request).await?;
        return Ok(RequestGcOutcome::Deleted);
    };
    if location.vid != request.payload.vid
        || location.fseq != request.payload.job.fseq
        || location.block_id != request.payload.job.block_id
    {
        apply_location(&mut request.payload, &location);
    }

    let requeued = requeue_locked(store, config, &request.payload, collector).await;
    let outcome = match requeued {
        Ok(outcome) => outcome,
        Err(err) => {
            store.release(request).await?;
            return Err(err);
        }
    };
    if outcome == RequestGcOutcome::Deleted {
        store.remove(request).await?;
        return Ok(outcome);
    }

    request.set_owner(queue_address(&request.payload.vid));
    request.payload.status = RequestStatus::Queued;
    store.commit_and_release(request).await?;
    Ok(outcome)
}

async fn requeue_locked<B: Backend>(
    store: &ObjectStore<B>,
    config: &QueueConfig,
    request: &RetrieveRequestContent,
    collector: &AgentHandle<B>,
) -> Result<RequestGcOutcome> {
    let queue =
        RetrieveQueue::open_or_create(store.clone(), &request.vid, config.clone())
            .await?;
    if queue.contains(&request.job.job_id).await? {
        return Ok(RequestGcOutcome::Relabelled);
    }
    match queue.add_jobs(vec![request.job.clone()], collector).await {
        Ok(()) => Ok(RequestGcOutcome::Requeued),
        Err(SchedulerError::DuplicateFseq { vid, fseq }) => {
            tracing::error!(
                vid = %vid,
                fseq,
                request = %request.job.address,
                "fSeq already taken by another job, dropping request"
            );
            Ok(RequestGcOutcome::Deleted)
        }
        Err(err) => Err(err),
    }
}
