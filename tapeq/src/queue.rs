//! Logical retrieve queue: one object per tape pointing at an ordered list of
//! shards.
//!
//! Shards are ordered by fSeq: every fSeq of shard `i` is lower than every
//! fSeq of shard `i + 1`. A job lives in exactly one shard. Structural
//! changes (adding jobs, splitting, merging, refreshing pointers) hold the
//! queue lock; popping only locks the shards it touches, one at a time.
//!
//! Shards are split and merged through copy. The new shards are created owned
//! by the acting agent, the queue pointers are swapped in a single commit, the
//! old shards are deleted and only then are the new shards handed to the
//! queue. A crash at any point leaves either the old or the new shards
//! referenced, never both, and the agent's ownership tells the collector what
//! to finish.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::AgentHandle;
use crate::backend::Backend;
use crate::catalogue::Catalogue;
use crate::config::QueueConfig;
use crate::error::{Result, SchedulerError};
use crate::job::{JobId, JobInfo};
use crate::object::{Locked, ObjectPayload, ObjectStore, ObjectType};
use crate::request::{self, RequestStatus, RetrieveRequestContent};
use crate::shard::{InsertStrategy, JobsSummary, RetrieveQueueShard};
use crate::telemetry;

/// Owner label of every retrieve queue object.
pub const ROOT_ENTRY_ADDRESS: &str = "RootEntry";

pub fn queue_address(vid: &str) -> String {
    format!("RetrieveQueueToTransfer-{vid}")
}

fn new_shard_address(vid: &str) -> String {
    format!("RetrieveQueueShard-{vid}-{}", Uuid::new_v4())
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardPointer {
    pub address: String,
    pub summary: JobsSummary,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetrieveQueueContent {
    pub vid: String,
    pub shards: Vec<ShardPointer>,
}

impl ObjectPayload for RetrieveQueueContent {
    const TYPE: ObjectType = ObjectType::RetrieveQueue;
}

impl RetrieveQueueContent {
    /// Aggregate of the pointer summaries.
    pub fn summary(&self) -> JobsSummary {
        let mut total = JobsSummary::default();
        for pointer in self.shards.iter().filter(|p| p.summary.jobs > 0) {
            if total.jobs == 0 {
                total.min_fseq = pointer.summary.min_fseq;
            }
            total.jobs += pointer.summary.jobs;
            total.bytes += pointer.summary.bytes;
            total.max_fseq = pointer.summary.max_fseq;
        }
        total
    }

    fn references(&self, shard_address: &str) -> bool {
        self.shards.iter().any(|p| p.address == shard_address)
    }
}

/// A candidate job together with the shard it was read from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueCandidate {
    pub shard_address: String,
    pub job: JobInfo,
}

/// Queue-wide candidate selection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueueCandidateList {
    pub candidates: Vec<QueueCandidate>,
    pub candidate_files: u64,
    pub candidate_bytes: u64,
    pub remaining_files: u64,
    pub remaining_bytes: u64,
    pub hit_quota: bool,
}

/// A job removed from the queue and now owned by an agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoppedJob {
    pub job: JobInfo,
    pub dst_url: String,
}

/// Thresholds deciding whether a queue is worth a mount.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MountCriteria {
    pub min_bytes: u64,
    pub min_files: u64,
    /// Age in seconds of the oldest job that justifies a mount on its own.
    pub max_age_secs: u64,
}

/// Aggregate view of a queue's jobs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub jobs: u64,
    pub bytes: u64,
    pub oldest_job_start_time: Option<DateTime<Utc>>,
    pub highest_priority: u64,
    pub min_retrieve_request_age: u64,
    pub jobs_per_mount_policy: BTreeMap<String, u64>,
}

impl QueueStatistics {
    pub fn justifies_mount(
        &self,
        criteria: &MountCriteria,
        now: DateTime<Utc>,
    ) -> bool {
        if self.jobs == 0 {
            return false;
        }
        let oldest_age = self
            .oldest_job_start_time
            .map_or(0, |start| (now - start).num_seconds().max(0) as u64);
        self.bytes >= criteria.min_bytes
            || self.jobs >= criteria.min_files
            || oldest_age >= criteria.max_age_secs
    }
}

/// What the collector did with an orphaned shard.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShardGcOutcome {
    AlreadyGone,
    /// Owned by someone else and still referenced.
    Skipped,
    /// Still referenced by its queue; handed back to it.
    Relinked,
    /// Unreferenced; surviving jobs moved to their queues, shard deleted.
    Collected { requeued: usize, dropped: usize },
}

/// Handle on the retrieve queue of one tape.
pub struct RetrieveQueue<B> {
    store: ObjectStore<B>,
    vid: String,
    address: String,
    config: QueueConfig,
}

impl<B> Clone for RetrieveQueue<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            vid: self.vid.clone(),
            address: self.address.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B> std::fmt::Debug for RetrieveQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrieveQueue")
            .field("vid", &self.vid)
            .field("address", &self.address)
            .field("config", &self.config)
            .finish()
    }
}

impl<B: Backend> RetrieveQueue<B> {
    /// Handle on the queue of `vid`, creating the queue object if needed.
    pub async fn open_or_create(
        store: ObjectStore<B>,
        vid: &str,
        config: QueueConfig,
    ) -> Result<Self> {
        let address = queue_address(vid);
        if !store.exists(&address).await? {
            let content = RetrieveQueueContent {
                vid: vid.to_string(),
                shards: Vec::new(),
            };
            match store.insert(&address, ROOT_ENTRY_ADDRESS, &content).await {
                Ok(()) => tracing::debug!(vid, "retrieve queue created"),
                Err(SchedulerError::Backend(
                    crate::error::BackendError::AlreadyExists(_),
                )) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(Self {
            store,
            vid: vid.to_string(),
            address,
            config,
        })
    }

    pub fn vid(&self) -> &str {
        &self.vid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &ObjectStore<B> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current queue content, read without locking.
    pub async fn content(&self) -> Result<RetrieveQueueContent> {
        Ok(self
            .store
            .fetch::<RetrieveQueueContent>(&self.address)
            .await?
            .payload)
    }

    async fn lock_shard(
        &self,
        address: &str,
    ) -> Result<Locked<RetrieveQueueShard>> {
        let mut shard = self.store.lock::<RetrieveQueueShard>(address).await?;
        if shard.payload.rebuild() {
            tracing::warn!(
                vid = %self.vid,
                shard = %address,
                "shard summary drift repaired"
            );
        }
        Ok(shard)
    }

    /// Add jobs to the queue.
    ///
    /// Fails with `DuplicateFseq`, changing nothing, if any fSeq is already
    /// queued or repeated in `jobs`.
    pub async fn add_jobs(
        &self,
        jobs: Vec<JobInfo>,
        agent: &AgentHandle<B>,
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let count = jobs.len();
        let span = telemetry::enqueue_span(&self.vid, count);
        async move {
            let mut queue = self
                .store
                .lock::<RetrieveQueueContent>(&self.address)
                .await?;
            if let Err(err) = self.check_duplicates(&queue.payload, &jobs).await {
                self.store.release(queue).await?;
                return Err(err);
            }

            let inserted = self.insert_locked(&mut queue, jobs, agent).await;
            let depth = queue.payload.summary().jobs;
            self.store.commit_and_release(queue).await?;
            inserted?;

            telemetry::record_jobs_queued(&self.vid, count);
            telemetry::set_queue_depth(&self.vid, depth);
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn check_duplicates(
        &self,
        content: &RetrieveQueueContent,
        jobs: &[JobInfo],
    ) -> Result<()> {
        let mut seen = HashSet::with_capacity(jobs.len());
        for job in jobs {
            if !seen.insert(job.fseq) {
                return Err(self.duplicate(job.fseq));
            }
        }
        let lowest = jobs.iter().map(|j| j.fseq).min().unwrap_or(0);
        let highest = jobs.iter().map(|j| j.fseq).max().unwrap_or(0);

        // Pointer ranges only ever widen relative to shard content, so a
        // shard whose pointer range misses the batch cannot hold a duplicate.
        for pointer in &content.shards {
            let summary = pointer.summary;
            if summary.jobs == 0
                || summary.max_fseq < lowest
                || summary.min_fseq > highest
            {
                continue;
            }
            let shard = match self
                .store
                .fetch::<RetrieveQueueShard>(&pointer.address)
                .await
            {
                Ok(shard) => shard,
                Err(err) if err.is_no_such_object() => continue,
                Err(err) => return Err(err),
            };
            if let Some(job) =
                jobs.iter().find(|j| shard.payload.contains_fseq(j.fseq))
            {
                return Err(self.duplicate(job.fseq));
            }
        }
        Ok(())
    }

    fn duplicate(&self, fseq: u64) -> SchedulerError {
        SchedulerError::DuplicateFseq {
            vid: self.vid.clone(),
            fseq,
        }
    }

    async fn insert_locked(
        &self,
        queue: &mut Locked<RetrieveQueueContent>,
        jobs: Vec<JobInfo>,
        agent: &AgentHandle<B>,
    ) -> Result<()> {
        if queue.payload.shards.is_empty() {
            let mut shard = RetrieveQueueShard::new(&self.vid);
            shard.add_jobs_batch(jobs, InsertStrategy::ThroughCopy)?;
            let parts = shard.split(self.config.max_shard_size);
            return self
                .replace_through_copy(queue, 0..0, Vec::new(), parts, agent)
                .await;
        }

        let mut groups: BTreeMap<usize, Vec<JobInfo>> = BTreeMap::new();
        for job in jobs {
            let index = route(&queue.payload.shards, job.fseq);
            groups.entry(index).or_default().push(job);
        }

        // Highest index first so splices do not shift pending indices.
        for (index, group) in groups.into_iter().rev() {
            let address = queue.payload.shards[index].address.clone();
            let mut shard = self.lock_shard(&address).await?;
            let fits = (shard.payload.len() + group.len()) as u64
                <= self.config.max_shard_size;

            if fits {
                if let Err(err) = shard
                    .payload
                    .add_jobs_batch(group, self.config.insert_strategy)
                {
                    self.store.release(shard).await?;
                    return Err(err);
                }
                let summary = shard.payload.summary();
                self.store.commit_and_release(shard).await?;
                queue.payload.shards[index].summary = summary;
                continue;
            }

            let mut combined = shard.payload.clone();
            if let Err(err) =
                combined.add_jobs_batch(group, InsertStrategy::ThroughCopy)
            {
                self.store.release(shard).await?;
                return Err(err);
            }
            let parts = combined.split(self.config.max_shard_size);
            tracing::info!(
                vid = %self.vid,
                shard = %address,
                parts = parts.len(),
                "splitting shard"
            );
            self.replace_through_copy(
                queue,
                index..index + 1,
                vec![shard],
                parts,
                agent,
            )
            .await?;
        }
        Ok(())
    }

    /// Replace the shards at `range` (locked in `old`) with `parts`.
    async fn replace_through_copy(
        &self,
        queue: &mut Locked<RetrieveQueueContent>,
        range: Range<usize>,
        old: Vec<Locked<RetrieveQueueShard>>,
        parts: Vec<RetrieveQueueShard>,
        agent: &AgentHandle<B>,
    ) -> Result<()> {
        let new_addresses: Vec<String> =
            parts.iter().map(|_| new_shard_address(&self.vid)).collect();
        let mut owned = new_addresses.clone();
        owned.extend(old.iter().map(|shard| shard.address().to_string()));

        let created = async {
            agent.add_to_ownership(owned.iter().cloned()).await?;
            let mut pointers = Vec::with_capacity(parts.len());
            for (address, part) in new_addresses.iter().zip(&parts) {
                self.store.insert(address, agent.address(), part).await?;
                pointers.push(ShardPointer {
                    address: address.clone(),
                    summary: part.summary(),
                });
            }
            Ok::<_, SchedulerError>(pointers)
        }
        .await;
        let pointers = match created {
            Ok(pointers) => pointers,
            Err(err) => {
                self.release_all(old).await;
                return Err(err);
            }
        };

        queue.payload.shards.splice(range.clone(), pointers);
        if let Err(err) = self.store.commit(queue).await {
            // Restore the in-memory pointers; the caller commits them again.
            let restored: Vec<ShardPointer> = old
                .iter()
                .map(|shard| ShardPointer {
                    address: shard.address().to_string(),
                    summary: shard.payload.summary(),
                })
                .collect();
            queue
                .payload
                .shards
                .splice(range.start..range.start + parts.len(), restored);
            self.release_all(old).await;
            return Err(err);
        }

        let mut old = old.into_iter();
        while let Some(shard) = old.next() {
            if let Err(err) = self.store.remove(shard).await {
                self.release_all(old.collect()).await;
                return Err(err);
            }
        }
        for address in &new_addresses {
            let mut shard =
                self.store.lock::<RetrieveQueueShard>(address).await?;
            shard.set_owner(&self.address);
            self.store.commit_and_release(shard).await?;
        }
        agent.remove_from_ownership(&owned).await
    }

    async fn release_all(&self, shards: Vec<Locked<RetrieveQueueShard>>) {
        for shard in shards {
            let address = shard.address().to_string();
            if let Err(err) = self.store.release(shard).await {
                tracing::error!(shard = %address, error = %err, "failed to release shard lock");
            }
        }
    }

    /// Select the fSeq-ordered prefix of the queue fitting the quota.
    ///
    /// Shards are read without locks. Unreadable shards are skipped.
    pub async fn candidate_job_list(
        &self,
        max_bytes: u64,
        max_files: u64,
        skip_request_ids: &HashSet<JobId>,
        skip_disk_systems: &HashSet<String>,
    ) -> Result<QueueCandidateList> {
        let content = match self.content().await {
            Ok(content) => content,
            Err(err) if err.is_no_such_object() => {
                return Ok(QueueCandidateList::default());
            }
            Err(err) => return Err(err),
        };

        let mut list = QueueCandidateList::default();
        for pointer in &content.shards {
            if pointer.summary.jobs == 0 {
                continue;
            }
            let shard = match self
                .store
                .fetch::<RetrieveQueueShard>(&pointer.address)
                .await
            {
                Ok(shard) => shard,
                Err(err) => {
                    tracing::warn!(
                        vid = %self.vid,
                        shard = %pointer.address,
                        error = %err,
                        "skipping unreadable shard"
                    );
                    continue;
                }
            };
            let part = shard.payload.candidate_job_list(
                max_bytes - list.candidate_bytes,
                max_files - list.candidate_files,
                skip_request_ids,
                skip_disk_systems,
            );
            list.candidate_files += part.candidate_files;
            list.candidate_bytes += part.candidate_bytes;
            list.candidates.extend(part.candidates.into_iter().map(|job| {
                QueueCandidate {
                    shard_address: pointer.address.clone(),
                    job,
                }
            }));
            if part.hit_quota {
                list.hit_quota = true;
                break;
            }
        }

        let total = content.summary();
        list.remaining_files = total.jobs.saturating_sub(list.candidate_files);
        list.remaining_bytes = total.bytes.saturating_sub(list.candidate_bytes);
        Ok(list)
    }

    /// Move candidates from the queue to `agent`.
    ///
    /// Returns the jobs actually obtained, in fSeq order. Candidates popped
    /// meanwhile by someone else are silently left out.
    pub async fn transfer_to_agent(
        &self,
        candidates: &[QueueCandidate],
        agent: &AgentHandle<B>,
    ) -> Result<Vec<PoppedJob>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let already_owned: HashSet<String> =
            agent.owned_objects().await?.into_iter().collect();
        agent
            .add_to_ownership(candidates.iter().map(|c| c.job.address.clone()))
            .await?;

        let mut groups: Vec<(&str, Vec<&JobInfo>)> = Vec::new();
        for candidate in candidates {
            match groups.last_mut() {
                Some((address, jobs)) if *address == candidate.shard_address.as_str() => {
                    jobs.push(&candidate.job);
                }
                _ => groups.push((candidate.shard_address.as_str(), vec![&candidate.job])),
            }
        }

        let mut popped = Vec::new();
        let mut touched = HashSet::new();
        let mut settled: Vec<&str> = Vec::new();
        for (shard_address, jobs) in groups {
            match self.pop_from_shard(shard_address, &jobs, agent).await {
                Ok(mut obtained) => {
                    popped.append(&mut obtained);
                    touched.insert(shard_address.to_string());
                    settled.extend(jobs.iter().map(|job| job.address.as_str()));
                }
                Err(err) if err.is_no_such_object() => {
                    tracing::debug!(
                        vid = %self.vid,
                        shard = %shard_address,
                        "shard vanished before pop"
                    );
                    settled.extend(jobs.iter().map(|job| job.address.as_str()));
                }
                // Ownership entries stay so a collector can sort them out.
                Err(err) => tracing::warn!(
                    vid = %self.vid,
                    shard = %shard_address,
                    error = %err,
                    "failed to pop from shard"
                ),
            }
        }

        let obtained: HashSet<&str> =
            popped.iter().map(|p| p.job.address.as_str()).collect();
        let not_obtained: Vec<&str> = settled
            .into_iter()
            .filter(|address| {
                !obtained.contains(address) && !already_owned.contains(*address)
            })
            .collect();
        if !not_obtained.is_empty()
            && let Err(err) = agent.remove_from_ownership(&not_obtained).await
        {
            tracing::warn!(
                agent = %agent.address(),
                error = %err,
                "failed to drop ownership of jobs not obtained"
            );
        }

        if let Err(err) = self.refresh_pointers(Some(&touched)).await {
            tracing::warn!(vid = %self.vid, error = %err, "failed to refresh shard pointers");
        }

        popped.sort_by_key(|p| p.job.fseq);
        telemetry::record_jobs_popped(&self.vid, popped.len());
        Ok(popped)
    }

    async fn pop_from_shard(
        &self,
        shard_address: &str,
        jobs: &[&JobInfo],
        agent: &AgentHandle<B>,
    ) -> Result<Vec<PoppedJob>> {
        let mut shard = self.lock_shard(shard_address).await?;
        let mut removed = HashSet::new();
        let mut popped = Vec::new();

        // Requests are relabelled before their jobs leave the shard, so a
        // job is always reachable from either its queue or its owner.
        for job in jobs {
            if !shard.payload.contains(&job.job_id) {
                continue;
            }
            match self.claim_request(&job.address, agent).await {
                Ok(Some(dst_url)) => {
                    removed.insert(job.job_id);
                    popped.push(PoppedJob {
                        job: (*job).clone(),
                        dst_url,
                    });
                }
                Ok(None) => {}
                Err(err) if err.is_no_such_object() => {
                    tracing::warn!(
                        vid = %self.vid,
                        request = %job.address,
                        "retrieve request vanished, dropping its job"
                    );
                    removed.insert(job.job_id);
                }
                Err(err) => {
                    tracing::warn!(
                        vid = %self.vid,
                        request = %job.address,
                        error = %err,
                        "failed to claim retrieve request"
                    );
                    break;
                }
            }
        }

        shard.payload.remove_jobs(&removed);
        self.store.commit_and_release(shard).await?;
        Ok(popped)
    }

    async fn claim_request(
        &self,
        address: &str,
        agent: &AgentHandle<B>,
    ) -> Result<Option<String>> {
        let mut request =
            self.store.lock::<RetrieveRequestContent>(address).await?;
        if request.owner() != self.address {
            self.store.release(request).await?;
            return Ok(None);
        }
        request.set_owner(agent.address());
        request.payload.status = RequestStatus::InFlight;
        let dst_url = request.payload.dst_url.clone();
        self.store.commit_and_release(request).await?;
        Ok(Some(dst_url))
    }

    /// Remove jobs wherever they are in the queue. Absent ids are ignored.
    pub async fn remove_jobs(&self, ids: &[JobId]) -> Result<Vec<JobInfo>> {
        let wanted: HashSet<JobId> = ids.iter().copied().collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let content = match self.content().await {
            Ok(content) => content,
            Err(err) if err.is_no_such_object() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut removed = Vec::new();
        let mut touched = HashSet::new();
        for pointer in &content.shards {
            if pointer.summary.jobs == 0 {
                continue;
            }
            let shard = match self
                .store
                .fetch::<RetrieveQueueShard>(&pointer.address)
                .await
            {
                Ok(shard) => shard,
                Err(err) if err.is_no_such_object() => continue,
                Err(err) => return Err(err),
            };
            if !wanted.iter().any(|id| shard.payload.contains(id)) {
                continue;
            }
            let mut locked = match self.lock_shard(&pointer.address).await {
                Ok(locked) => locked,
                Err(err) if err.is_no_such_object() => continue,
                Err(err) => return Err(err),
            };
            let result = locked.payload.remove_jobs(&wanted);
            self.store.commit_and_release(locked).await?;
            removed.extend(result.removed_jobs);
            touched.insert(pointer.address.clone());
        }

        if !touched.is_empty()
            && let Err(err) = self.refresh_pointers(Some(&touched)).await
        {
            tracing::warn!(vid = %self.vid, error = %err, "failed to refresh shard pointers");
        }
        Ok(removed)
    }

    pub async fn contains(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.job_ids().await?.contains(job_id))
    }

    /// Ids of every job currently queued.
    pub async fn job_ids(&self) -> Result<HashSet<JobId>> {
        let content = match self.content().await {
            Ok(content) => content,
            Err(err) if err.is_no_such_object() => return Ok(HashSet::new()),
            Err(err) => return Err(err),
        };
        let mut ids = HashSet::new();
        for pointer in &content.shards {
            match self
                .store
                .fetch::<RetrieveQueueShard>(&pointer.address)
                .await
            {
                Ok(shard) => {
                    ids.extend(shard.payload.jobs().iter().map(|j| j.job_id))
                }
                Err(err) if err.is_no_such_object() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(ids)
    }

    /// Re-read every shard's summary into its pointer and drop empty shards.
    ///
    /// Returns the number of shards deleted.
    pub async fn refresh_summary(&self) -> Result<usize> {
        self.refresh_pointers(None).await
    }

    async fn refresh_pointers(
        &self,
        only: Option<&HashSet<String>>,
    ) -> Result<usize> {
        let mut queue = self
            .store
            .lock::<RetrieveQueueContent>(&self.address)
            .await?;
        let refreshed = self.refresh_locked(&mut queue, only).await;
        let depth = queue.payload.summary().jobs;
        self.store.commit_and_release(queue).await?;
        telemetry::set_queue_depth(&self.vid, depth);
        refreshed
    }

    async fn refresh_locked(
        &self,
        queue: &mut Locked<RetrieveQueueContent>,
        only: Option<&HashSet<String>>,
    ) -> Result<usize> {
        let mut deleted = 0;
        let mut index = 0;
        while index < queue.payload.shards.len() {
            let address = queue.payload.shards[index].address.clone();
            if only.is_some_and(|set| !set.contains(&address)) {
                index += 1;
                continue;
            }
            let shard = match self.lock_shard(&address).await {
                Ok(shard) => shard,
                Err(err) if err.is_no_such_object() => {
                    tracing::warn!(
                        vid = %self.vid,
                        shard = %address,
                        "dropping pointer to missing shard"
                    );
                    queue.payload.shards.remove(index);
                    continue;
                }
                Err(err) => return Err(err),
            };

            if shard.payload.is_empty() {
                queue.payload.shards.remove(index);
                if let Err(err) = self.store.commit(queue).await {
                    self.store.release(shard).await?;
                    return Err(err);
                }
                self.store.remove(shard).await?;
                tracing::debug!(vid = %self.vid, shard = %address, "empty shard deleted");
                deleted += 1;
                continue;
            }

            queue.payload.shards[index].summary = shard.payload.summary();
            self.store.commit_and_release(shard).await?;
            index += 1;
        }
        Ok(deleted)
    }

    /// Merge adjacent shards whose combined size is at most
    /// `merge_threshold`. Returns the number of merges performed.
    pub async fn merge_shards(&self, agent: &AgentHandle<B>) -> Result<usize> {
        let mut queue = self
            .store
            .lock::<RetrieveQueueContent>(&self.address)
            .await?;
        let merged = self.merge_locked(&mut queue, agent).await;
        self.store.commit_and_release(queue).await?;
        merged
    }

    async fn merge_locked(
        &self,
        queue: &mut Locked<RetrieveQueueContent>,
        agent: &AgentHandle<B>,
    ) -> Result<usize> {
        let threshold = self.config.merge_threshold;
        let mut merges = 0;
        let mut index = 0;
        while index + 1 < queue.payload.shards.len() {
            let low_pointer = &queue.payload.shards[index];
            let high_pointer = &queue.payload.shards[index + 1];
            if low_pointer.summary.jobs + high_pointer.summary.jobs > threshold {
                index += 1;
                continue;
            }
            let (low_address, high_address) =
                (low_pointer.address.clone(), high_pointer.address.clone());

            let low = self.lock_shard(&low_address).await?;
            let high = match self.lock_shard(&high_address).await {
                Ok(high) => high,
                Err(err) => {
                    self.store.commit_and_release(low).await?;
                    return Err(err);
                }
            };
            if (low.payload.len() + high.payload.len()) as u64 > threshold {
                self.store.commit_and_release(low).await?;
                self.store.commit_and_release(high).await?;
                index += 1;
                continue;
            }

            let merged = low.payload.clone().merge(high.payload.clone());
            self.replace_through_copy(
                queue,
                index..index + 2,
                vec![low, high],
                vec![merged],
                agent,
            )
            .await?;
            merges += 1;
        }
        if merges > 0 {
            tracing::info!(vid = %self.vid, merges, "shards merged");
        }
        Ok(merges)
    }

    /// Aggregate statistics over every queued job.
    pub async fn statistics(&self) -> Result<QueueStatistics> {
        let content = match self.content().await {
            Ok(content) => content,
            Err(err) if err.is_no_such_object() => {
                return Ok(QueueStatistics::default());
            }
            Err(err) => return Err(err),
        };

        let mut stats = QueueStatistics::default();
        let mut min_age: Option<u64> = None;
        for pointer in &content.shards {
            let shard = match self
                .store
                .fetch::<RetrieveQueueShard>(&pointer.address)
                .await
            {
                Ok(shard) => shard,
                Err(err) if err.is_no_such_object() => continue,
                Err(err) => return Err(err),
            };
            for job in shard.payload.jobs() {
                stats.jobs += 1;
                stats.bytes += job.size;
                stats.highest_priority = stats.highest_priority.max(job.priority);
                min_age = Some(min_age.map_or(job.min_retrieve_request_age, |age| {
                    age.min(job.min_retrieve_request_age)
                }));
                stats.oldest_job_start_time = Some(
                    stats
                        .oldest_job_start_time
                        .map_or(job.start_time, |t| t.min(job.start_time)),
                );
                *stats
                    .jobs_per_mount_policy
                    .entry(job.mount_policy_name.clone())
                    .or_default() += 1;
            }
        }
        stats.min_retrieve_request_age = min_age.unwrap_or(0);
        Ok(stats)
    }
}

/// Index of the shard a new job with `fseq` belongs to.
fn route(shards: &[ShardPointer], fseq: u64) -> usize {
    shards
        .iter()
        .position(|p| p.summary.jobs > 0 && p.summary.max_fseq >= fseq)
        .unwrap_or(shards.len().saturating_sub(1))
}

/// Collect a shard found in a dead agent's ownership.
///
/// A shard still referenced by its queue is handed back to the queue. An
/// unreferenced one is the leftover of an interrupted split or merge: jobs
/// not found in any queue are verified against the catalogue and re-queued,
/// then the shard is deleted. Running it twice is harmless.
pub async fn garbage_collect_shard<B: Backend>(
    store: &ObjectStore<B>,
    config: &QueueConfig,
    address: &str,
    presumed_owner: &str,
    collector: &AgentHandle<B>,
    catalogue: &dyn Catalogue,
) -> Result<ShardGcOutcome> {
    let mut shard = match store.lock::<RetrieveQueueShard>(address).await {
        Ok(shard) => shard,
        Err(err) if err.is_no_such_object() => {
            return Ok(ShardGcOutcome::AlreadyGone);
        }
        Err(err) => return Err(err),
    };
    let vid = shard.payload.vid.clone();
    let queue =
        match RetrieveQueue::open_or_create(store.clone(), &vid, config.clone())
            .await
        {
            Ok(queue) => queue,
            Err(err) => {
                store.release(shard).await?;
                return Err(err);
            }
        };
    let referenced = match queue.content().await {
        Ok(content) => content.references(address),
        Err(err) => {
            store.release(shard).await?;
            return Err(err);
        }
    };

    if referenced && shard.owner() != presumed_owner {
        store.release(shard).await?;
        return Ok(ShardGcOutcome::Skipped);
    }

    shard.set_owner(collector.address());
    if let Err(err) = store.commit(&shard).await {
        store.release(shard).await?;
        return Err(err);
    }

    if referenced {
        shard.set_owner(queue.address());
        if shard.payload.rebuild() {
            tracing::warn!(shard = %address, "shard summary drift repaired");
        }
        store.commit_and_release(shard).await?;
        return Ok(ShardGcOutcome::Relinked);
    }

    let salvaged = salvage_jobs(
        store,
        &queue,
        shard.payload.jobs(),
        presumed_owner,
        catalogue,
    )
    .await;
    let (by_vid, mut dropped) = match salvaged {
        Ok(salvaged) => salvaged,
        Err(err) => {
            store.release(shard).await?;
            return Err(err);
        }
    };

    let requeued = async {
        let mut requeued = 0;
        for (target_vid, jobs) in by_vid {
            let target = RetrieveQueue::open_or_create(
                store.clone(),
                &target_vid,
                config.clone(),
            )
            .await?;
            let (added, conflicts) =
                add_tolerating_duplicates(&target, jobs, collector).await?;
            requeued += added;
            dropped += conflicts;
        }
        Ok::<_, SchedulerError>(requeued)
    }
    .await;
    let requeued = match requeued {
        Ok(requeued) => requeued,
        Err(err) => {
            store.release(shard).await?;
            return Err(err);
        }
    };

    store.remove(shard).await?;
    Ok(ShardGcOutcome::Collected { requeued, dropped })
}

/// Jobs of an orphaned shard that are not queued anywhere, grouped by the
/// tape the catalogue says they are on now, plus the count of stale jobs
/// whose requests were deleted.
///
/// A job missing from the queue may have been popped by a live mount from
/// the shard that replaced this one. Only jobs whose request is still
/// `Queued` and owned by its queue or by `presumed_owner` are salvaged.
async fn salvage_jobs<B: Backend>(
    store: &ObjectStore<B>,
    queue: &RetrieveQueue<B>,
    jobs: &[JobInfo],
    presumed_owner: &str,
    catalogue: &dyn Catalogue,
) -> Result<(BTreeMap<String, Vec<JobInfo>>, usize)> {
    let queued = queue.job_ids().await?;
    let mut by_vid: BTreeMap<String, Vec<JobInfo>> = BTreeMap::new();
    let mut dropped = 0;
    for job in jobs.iter().filter(|job| !queued.contains(&job.job_id)) {
        if !awaiting_queue(store, job, presumed_owner).await? {
            tracing::debug!(
                request = %job.address,
                fseq = job.fseq,
                "orphaned shard job is held elsewhere, not salvaging"
            );
            continue;
        }
        let location = catalogue
            .get_tape_file(job.archive_file_id, job.copy_nb)
            .await
            .map_err(SchedulerError::Catalogue)?;
        match location {
            None => {
                tracing::warn!(
                    request = %job.address,
                    archive_file_id = job.archive_file_id,
                    "tape file no longer exists, dropping job"
                );
                request::delete_request(store, &job.address).await?;
                dropped += 1;
            }
            Some(location) => {
                let mut job = job.clone();
                if location.vid != queue.vid()
                    || location.fseq != job.fseq
                    || location.block_id != job.block_id
                {
                    request::repair_location(store, &job.address, &location)
                        .await?;
                    job.fseq = location.fseq;
                    job.block_id = location.block_id;
                }
                by_vid.entry(location.vid).or_default().push(job);
            }
        }
    }
    Ok((by_vid, dropped))
}

/// Whether the request behind `job` still waits to be queued.
async fn awaiting_queue<B: Backend>(
    store: &ObjectStore<B>,
    job: &JobInfo,
    presumed_owner: &str,
) -> Result<bool> {
    let request = match store.lock::<RetrieveRequestContent>(&job.address).await {
        Ok(request) => request,
        Err(err) if err.is_no_such_object() => return Ok(false),
        Err(err) => return Err(err),
    };
    let owner = request.owner();
    let waiting = request.payload.status == RequestStatus::Queued
        && (owner == presumed_owner || owner == queue_address(&request.payload.vid));
    store.release(request).await?;
    Ok(waiting)
}

/// Add `jobs`, falling back to one at a time if the batch collides with
/// queued fSeqs. Colliding jobs are dropped with their requests.
pub(crate) async fn add_tolerating_duplicates<B: Backend>(
    queue: &RetrieveQueue<B>,
    jobs: Vec<JobInfo>,
    agent: &AgentHandle<B>,
) -> Result<(usize, usize)> {
    let count = jobs.len();
    match queue.add_jobs(jobs.clone(), agent).await {
        Ok(()) => return Ok((count, 0)),
        Err(SchedulerError::DuplicateFseq { .. }) => {}
        Err(err) => return Err(err),
    }

    let (mut added, mut conflicts) = (0, 0);
    for job in jobs {
        let address = job.address.clone();
        match queue.add_jobs(vec![job], agent).await {
            Ok(()) => added += 1,
            Err(SchedulerError::DuplicateFseq { vid, fseq }) => {
                tracing::error!(
                    vid = %vid,
                    fseq,
                    request = %address,
                    "fSeq already taken by another job, dropping request"
                );
                request::delete_request(queue.store(), &address).await?;
                conflicts += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok((added, conflicts))
}
