//! Retrieve mount: drains one tape's queue for an active drive session.
//!
//! A mount pops batches of jobs in fSeq order, admitting each against the
//! free space of its destination disk system. A disk system found without
//! space is struck out for the rest of the mount. Popped jobs belong to the
//! mount's agent until they are reported done or failed; if the mount dies
//! first, the garbage collector puts them back.

mod builder;

pub use builder::RetrieveMountBuilder;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Instrument;

use crate::agent::{AgentHandle, RetireOutcome};
use crate::backend::Backend;
use crate::catalogue::Catalogue;
use crate::config::MountConfig;
use crate::disk_space::{Admission, DiskSystemFreeSpaceList, FreeSpaceSource};
use crate::error::{Result, SchedulerError};
use crate::job::{JobId, JobInfo, PositioningMethod};
use crate::queue::{QueueCandidate, RetrieveQueue};
use crate::rao::{RaoStrategy, is_permutation};
use crate::request::{self, RequestStatus, RetrieveRequestContent};
use crate::retry::{FailureDecision, decide_after_failure};
use crate::telemetry::{
    flush_span, pop_span, record_batch_end, record_batch_start, record_disk_system_full,
    record_job_finished,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    NotStarted,
    SessionRunning,
    /// Tape side done; disk writes may still be draining.
    TapeComplete,
    DiskComplete,
    BothComplete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriveStatus {
    Mounting,
    Transferring,
    DrainingToDisk,
    Unmounting,
}

/// Static description of the mounted tape and the drive holding it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MountInfo {
    pub vid: String,
    pub drive: String,
    pub mount_id: u64,
    pub tape_pool: String,
    pub vo: String,
    pub media_type: String,
    pub vendor: String,
    pub capacity_in_bytes: u64,
    pub activity: Option<String>,
    pub logical_library: String,
    pub nb_files_on_tape: u64,
}

/// A job handed to the tape-I/O layer, bound to one mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrieveJob {
    pub job: JobInfo,
    pub vid: String,
    pub mount_id: u64,
    pub dst_url: String,
    pub positioning_method: PositioningMethod,
}

/// Result of [`RetrieveMount::flush_async_success_reports`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushReport {
    pub succeeded: usize,
    /// Requests already deleted by someone else.
    pub already_gone: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct MountState {
    session: SessionState,
    drive: DriveStatus,
    full_disk_systems: BTreeSet<String>,
    in_flight: HashSet<JobId>,
    /// Jobs that exhausted their retries within this mount.
    skipped: HashSet<JobId>,
    /// Jobs someone else popped between selection and transfer.
    failed_to_pop: HashSet<JobId>,
}

impl MountState {
    fn excluded_jobs(&self) -> HashSet<JobId> {
        self.in_flight
            .iter()
            .chain(&self.skipped)
            .chain(&self.failed_to_pop)
            .copied()
            .collect()
    }
}

pub struct RetrieveMount<B> {
    info: MountInfo,
    config: MountConfig,
    queue: RetrieveQueue<B>,
    agent: AgentHandle<B>,
    catalogue: Arc<dyn Catalogue>,
    free_space: Arc<dyn FreeSpaceSource>,
    state: Mutex<MountState>,
}

impl<B> std::fmt::Debug for RetrieveMount<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrieveMount")
            .field("info", &self.info)
            .field("config", &self.config)
            .field("agent", &self.agent)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl<B: Backend> RetrieveMount<B> {
    pub fn builder() -> RetrieveMountBuilder<B> {
        RetrieveMountBuilder::new()
    }

    pub(crate) fn new(
        info: MountInfo,
        config: MountConfig,
        queue: RetrieveQueue<B>,
        agent: AgentHandle<B>,
        catalogue: Arc<dyn Catalogue>,
        free_space: Arc<dyn FreeSpaceSource>,
    ) -> Self {
        Self {
            info,
            config,
            queue,
            agent,
            catalogue,
            free_space,
            state: Mutex::new(MountState {
                session: SessionState::NotStarted,
                drive: DriveStatus::Mounting,
                full_disk_systems: BTreeSet::new(),
                in_flight: HashSet::new(),
                skipped: HashSet::new(),
                failed_to_pop: HashSet::new(),
            }),
        }
    }

    /// Enter `SessionRunning` and record the mount in the catalogue.
    ///
    /// A catalogue failure is logged and does not prevent the session.
    pub async fn start_session(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.session != SessionState::NotStarted {
                tracing::warn!(
                    vid = %self.info.vid,
                    state = ?state.session,
                    "session already started"
                );
                return Ok(());
            }
            state.session = SessionState::SessionRunning;
            state.drive = DriveStatus::Transferring;
        }
        if let Err(err) = self
            .catalogue
            .tape_mounted_for_retrieve(&self.info.vid, &self.info.drive)
            .await
        {
            tracing::warn!(
                vid = %self.info.vid,
                drive = %self.info.drive,
                error = %err,
                "failed to record tape mount in catalogue"
            );
        }
        tracing::info!(
            vid = %self.info.vid,
            drive = %self.info.drive,
            mount_id = self.info.mount_id,
            "retrieve session started"
        );
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state.lock().session {
            SessionState::SessionRunning => Ok(()),
            other => Err(SchedulerError::SessionNotRunning(format!(
                "mount {} on {} is {other:?}",
                self.info.mount_id, self.info.vid
            ))),
        }
    }

    /// Pop up to `files_requested` jobs totalling at most `bytes_requested`.
    ///
    /// An empty batch means nothing fits right now; it does not say whether
    /// the queue is drained.
    pub async fn get_next_job_batch(
        &self,
        files_requested: u64,
        bytes_requested: u64,
    ) -> Result<Vec<RetrieveJob>> {
        self.ensure_running()?;
        let span = pop_span(&self.info.vid, self.info.mount_id);
        async move {
            let timer = record_batch_start();
            let disk_systems = self
                .catalogue
                .get_all_disk_systems()
                .await
                .map_err(SchedulerError::Catalogue)?;
            let mut space = DiskSystemFreeSpaceList::new(disk_systems);
            let mut unknown_space = HashSet::new();
            let mut batch = Vec::new();
            let (mut files_left, mut bytes_left) = (files_requested, bytes_requested);

            for _ in 0..self.config.max_batch_rounds {
                if files_left == 0 || bytes_left == 0 {
                    break;
                }
                let (skip_jobs, mut skip_disk_systems) = {
                    let state = self.state.lock();
                    (state.excluded_jobs(), state.full_disk_systems.clone())
                };
                skip_disk_systems.extend(unknown_space.iter().cloned());
                let skip_disk_systems: HashSet<String> =
                    skip_disk_systems.into_iter().collect();

                let list = self
                    .queue
                    .candidate_job_list(bytes_left, files_left, &skip_jobs, &skip_disk_systems)
                    .await?;
                if list.candidates.is_empty() {
                    break;
                }

                let names: Vec<String> = list
                    .candidates
                    .iter()
                    .filter_map(|c| c.job.disk_system_name.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                space.fetch(&names, self.free_space.as_ref()).await;

                let mut admitted: Vec<QueueCandidate> = Vec::new();
                let mut rejected = false;
                for candidate in list.candidates {
                    match space.admit(&candidate.job) {
                        Admission::Admitted => admitted.push(candidate),
                        Admission::NoSpace => {
                            rejected = true;
                            if let Some(name) = candidate.job.disk_system_name
                                && self.state.lock().full_disk_systems.insert(name.clone())
                            {
                                record_disk_system_full(&self.info.vid, &name);
                            }
                        }
                        Admission::Unknown => {
                            rejected = true;
                            if let Some(name) = candidate.job.disk_system_name {
                                unknown_space.insert(name);
                            }
                        }
                    }
                }

                let popped = self.queue.transfer_to_agent(&admitted, &self.agent).await?;
                let obtained: HashSet<JobId> = popped.iter().map(|p| p.job.job_id).collect();
                let lost = admitted.len() - obtained.len();
                {
                    let mut state = self.state.lock();
                    for candidate in &admitted {
                        if !obtained.contains(&candidate.job.job_id) {
                            state.failed_to_pop.insert(candidate.job.job_id);
                        }
                    }
                    state.in_flight.extend(obtained.iter().copied());
                }
                for popped in popped {
                    files_left = files_left.saturating_sub(1);
                    bytes_left = bytes_left.saturating_sub(popped.job.size);
                    batch.push(RetrieveJob {
                        vid: self.info.vid.clone(),
                        mount_id: self.info.mount_id,
                        dst_url: popped.dst_url,
                        positioning_method: PositioningMethod::ByBlock,
                        job: popped.job,
                    });
                }

                if !rejected && lost == 0 {
                    break;
                }
            }

            record_batch_end(timer, &self.info.vid, batch.len());
            Ok(batch)
        }
        .instrument(span)
        .await
    }

    /// Finalise jobs whose tape and disk transfers both completed.
    ///
    /// Failures are isolated per job and reported in the returned counts.
    pub async fn flush_async_success_reports(
        &self,
        jobs: &[RetrieveJob],
    ) -> Result<FlushReport> {
        let span = flush_span(&self.info.vid, jobs.len());
        async move {
            let mut report = FlushReport::default();
            if jobs.is_empty() {
                return Ok(report);
            }

            let ids: Vec<JobId> = jobs.iter().map(|j| j.job.job_id).collect();
            if let Err(err) = self.queue.remove_jobs(&ids).await {
                tracing::error!(error = %err, "queue removal failed during flush");
            }

            let mut finished = Vec::new();
            for job in jobs {
                match request::delete_request(self.queue.store(), &job.job.address).await {
                    Ok(true) => {
                        report.succeeded += 1;
                        record_job_finished(&self.info.vid, "success");
                        finished.push(job);
                    }
                    Ok(false) => {
                        report.already_gone += 1;
                        tracing::warn!(
                            request = %job.job.address,
                            "request already gone at flush"
                        );
                        finished.push(job);
                    }
                    Err(err) => {
                        report.failed += 1;
                        tracing::error!(
                            request = %job.job.address,
                            error = %err,
                            "failed to finalise successful job"
                        );
                    }
                }
            }

            if !finished.is_empty() {
                if let Err(err) = self
                    .agent
                    .remove_from_ownership(finished.iter().map(|j| j.job.address.as_str()))
                    .await
                {
                    tracing::error!(
                        jobs = finished.len(),
                        error = %err,
                        "failed to drop finished jobs from agent ownership"
                    );
                }
                let mut state = self.state.lock();
                for job in &finished {
                    state.in_flight.remove(&job.job.job_id);
                }
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Count a failed transfer and requeue or give up on the job.
    ///
    /// Returns `None` when the request is gone or no longer ours.
    pub async fn report_job_failure(
        &self,
        job: &RetrieveJob,
        reason: &str,
    ) -> Result<Option<FailureDecision>> {
        let store = self.queue.store();
        let mut request = match store
            .lock::<RetrieveRequestContent>(&job.job.address)
            .await
        {
            Ok(request) => request,
            Err(err) if err.is_no_such_object() => {
                tracing::warn!(request = %job.job.address, "failed job's request is gone");
                self.forget(job).await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if request.owner() != self.agent.address() {
            tracing::warn!(
                request = %job.job.address,
                owner = %request.owner(),
                "failed job no longer owned by this mount"
            );
            store.release(request).await?;
            self.forget(job).await?;
            return Ok(None);
        }

        let payload = &mut request.payload;
        if payload.last_mount_id != Some(self.info.mount_id) {
            payload.last_mount_id = Some(self.info.mount_id);
            payload.retries_within_mount = 0;
        }
        payload.retries_within_mount += 1;
        payload.total_retries += 1;
        payload
            .failure_log
            .push(format!("mount {}: {reason}", self.info.mount_id));
        let decision = decide_after_failure(
            payload.retries_within_mount,
            payload.total_retries,
            self.config.max_retries_within_mount,
            self.config.max_total_retries,
        );

        if decision == FailureDecision::Fail {
            request.payload.status = RequestStatus::Failed;
            if let Err(err) = store.commit(&request).await {
                store.release(request).await?;
                return Err(err);
            }
            tracing::error!(
                request = %job.job.address,
                total_retries = request.payload.total_retries,
                reason,
                "retrieve failed permanently"
            );
            store.remove(request).await?;
            record_job_finished(&self.info.vid, "failed");
            self.forget(job).await?;
            return Ok(Some(decision));
        }

        let queue = if request.payload.vid == self.queue.vid() {
            self.queue.clone()
        } else {
            match RetrieveQueue::open_or_create(
                store.clone(),
                &request.payload.vid,
                self.queue.config().clone(),
            )
            .await
            {
                Ok(queue) => queue,
                Err(err) => {
                    store.release(request).await?;
                    return Err(err);
                }
            }
        };
        match queue.add_jobs(vec![request.payload.job.clone()], &self.agent).await {
            Ok(()) => {}
            Err(SchedulerError::DuplicateFseq { vid, fseq }) => {
                tracing::error!(
                    vid = %vid,
                    fseq,
                    request = %job.job.address,
                    "fSeq taken while job was in flight, dropping request"
                );
                store.remove(request).await?;
                record_job_finished(&self.info.vid, "failed");
                self.forget(job).await?;
                return Ok(Some(FailureDecision::Fail));
            }
            Err(err) => {
                store.release(request).await?;
                return Err(err);
            }
        }
        request.set_owner(queue.address());
        request.payload.status = RequestStatus::Queued;
        store.commit_and_release(request).await?;

        tracing::warn!(
            request = %job.job.address,
            decision = ?decision,
            reason,
            "retrieve failed, job requeued"
        );
        record_job_finished(&self.info.vid, "requeued");
        self.forget(job).await?;
        if decision == FailureDecision::RequeueElsewhere {
            self.state.lock().skipped.insert(job.job.job_id);
        }
        Ok(Some(decision))
    }

    async fn forget(&self, job: &RetrieveJob) -> Result<()> {
        self.agent
            .remove_from_ownership([job.job.address.as_str()])
            .await?;
        self.state.lock().in_flight.remove(&job.job.job_id);
        Ok(())
    }

    pub fn tape_complete(&self) {
        let mut state = self.state.lock();
        match state.session {
            SessionState::DiskComplete => {
                state.session = SessionState::BothComplete;
                state.drive = DriveStatus::Unmounting;
            }
            SessionState::BothComplete | SessionState::TapeComplete => {}
            _ => {
                state.session = SessionState::TapeComplete;
                state.drive = DriveStatus::DrainingToDisk;
            }
        }
        tracing::info!(vid = %self.info.vid, state = ?state.session, "tape side complete");
    }

    pub fn disk_complete(&self) {
        let mut state = self.state.lock();
        match state.session {
            SessionState::TapeComplete => {
                state.session = SessionState::BothComplete;
                state.drive = DriveStatus::Unmounting;
            }
            SessionState::BothComplete | SessionState::DiskComplete => {}
            _ => state.session = SessionState::DiskComplete,
        }
        tracing::info!(vid = %self.info.vid, state = ?state.session, "disk side complete");
    }

    /// Complete both sides at once. In-flight jobs are left to the garbage
    /// collector.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.session = SessionState::BothComplete;
        state.drive = DriveStatus::Unmounting;
        if !state.in_flight.is_empty() {
            self.agent.leave_non_empty_behind();
        }
        tracing::warn!(
            vid = %self.info.vid,
            mount_id = self.info.mount_id,
            in_flight = state.in_flight.len(),
            "retrieve mount aborted"
        );
    }

    pub fn both_sides_complete(&self) -> bool {
        self.state.lock().session == SessionState::BothComplete
    }

    /// Retire the mount's agent. Jobs never reported stay owned by it for
    /// the garbage collector.
    pub async fn finish(&self) -> Result<RetireOutcome> {
        if !self.state.lock().in_flight.is_empty() {
            self.agent.leave_non_empty_behind();
        }
        self.agent.retire().await
    }

    /// Reorder a batch by `strategy`. An invalid permutation leaves the
    /// batch as it is.
    pub fn apply_rao(
        &self,
        jobs: Vec<RetrieveJob>,
        strategy: &dyn RaoStrategy,
    ) -> Vec<RetrieveJob> {
        let order = strategy.perform_rao(&jobs);
        if !is_permutation(&order, jobs.len()) {
            tracing::warn!(
                strategy = strategy.name(),
                jobs = jobs.len(),
                "RAO returned an invalid permutation, keeping fSeq order"
            );
            return jobs;
        }
        let mut slots: Vec<Option<RetrieveJob>> = jobs.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }

    pub fn info(&self) -> &MountInfo {
        &self.info
    }

    pub fn vid(&self) -> &str {
        &self.info.vid
    }

    pub fn mount_transaction_id(&self) -> u64 {
        self.info.mount_id
    }

    pub fn drive(&self) -> &str {
        &self.info.drive
    }

    pub fn pool(&self) -> &str {
        &self.info.tape_pool
    }

    pub fn vo(&self) -> &str {
        &self.info.vo
    }

    pub fn media_type(&self) -> &str {
        &self.info.media_type
    }

    pub fn vendor(&self) -> &str {
        &self.info.vendor
    }

    pub fn capacity_in_bytes(&self) -> u64 {
        self.info.capacity_in_bytes
    }

    pub fn activity(&self) -> Option<&str> {
        self.info.activity.as_deref()
    }

    pub fn nb_files_currently_on_tape(&self) -> u64 {
        self.info.nb_files_on_tape
    }

    pub fn session_state(&self) -> SessionState {
        self.state.lock().session
    }

    pub fn drive_status(&self) -> DriveStatus {
        self.state.lock().drive
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Disk systems struck out of this mount.
    pub fn full_disk_systems(&self) -> Vec<String> {
        self.state.lock().full_disk_systems.iter().cloned().collect()
    }

    pub fn queue(&self) -> &RetrieveQueue<B> {
        &self.queue
    }

    pub fn agent(&self) -> &AgentHandle<B> {
        &self.agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::catalogue::{DiskSystem, TapeFileLocation};
    use crate::config::{AgentConfig, BackendConfig, QueueConfig};
    use crate::object::ObjectStore;
    use crate::rao::FseqOrder;
    use crate::request::{NewRetrieveRequest, queue_retrieve_requests};
    use async_trait::async_trait;

    struct NoDiskSystems;

    #[async_trait]
    impl Catalogue for NoDiskSystems {
        async fn get_all_disk_systems(&self) -> anyhow::Result<Vec<DiskSystem>> {
            Ok(Vec::new())
        }

        async fn tape_mounted_for_retrieve(&self, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("catalogue unavailable")
        }

        async fn get_tape_file(
            &self,
            _: u64,
            _: u32,
        ) -> anyhow::Result<Option<TapeFileLocation>> {
            Ok(None)
        }
    }

    struct Unlimited;

    #[async_trait]
    impl FreeSpaceSource for Unlimited {
        async fn free_space(&self, _: &DiskSystem) -> anyhow::Result<Option<u64>> {
            Ok(Some(u64::MAX))
        }
    }

    struct Reverse;

    impl RaoStrategy for Reverse {
        fn name(&self) -> &str {
            "reverse"
        }

        fn perform_rao(&self, jobs: &[RetrieveJob]) -> Vec<usize> {
            (0..jobs.len()).rev().collect()
        }
    }

    struct Broken;

    impl RaoStrategy for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn perform_rao(&self, jobs: &[RetrieveJob]) -> Vec<usize> {
            vec![0; jobs.len()]
        }
    }

    async fn mount_with_jobs(
        fseqs: &[u64],
        config: MountConfig,
    ) -> RetrieveMount<InMemoryBackend> {
        let store = ObjectStore::new(
            Arc::new(InMemoryBackend::new()),
            &BackendConfig::default(),
        );
        let queue =
            RetrieveQueue::open_or_create(store.clone(), "V1", QueueConfig::default())
                .await
                .unwrap();
        let frontend = AgentHandle::register(store.clone(), "Frontend", &AgentConfig::default())
            .await
            .unwrap();
        let requests = fseqs
            .iter()
            .map(|&fseq| NewRetrieveRequest {
                archive_file_id: fseq,
                copy_nb: 1,
                fseq,
                block_id: fseq * 10,
                size: 100,
                priority: 0,
                min_retrieve_request_age: 0,
                mount_policy_name: "default".into(),
                activity: None,
                disk_system_name: None,
                dst_url: format!("file:///buffer/{fseq}"),
            })
            .collect();
        queue_retrieve_requests(&queue, &frontend, requests)
            .await
            .unwrap();

        let agent = AgentHandle::register(store, "RetrieveMount", &AgentConfig::default())
            .await
            .unwrap();
        RetrieveMount::builder()
            .with_info(MountInfo {
                vid: "V1".into(),
                drive: "DRIVE0".into(),
                mount_id: 7,
                ..MountInfo::default()
            })
            .with_config(config)
            .with_queue(queue)
            .with_agent(agent)
            .with_catalogue(Arc::new(NoDiskSystems))
            .with_free_space(Arc::new(Unlimited))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_batch_requires_running_session() {
        let mount = mount_with_jobs(&[1], MountConfig::default()).await;
        let err = mount.get_next_job_batch(10, 1_000).await.unwrap_err();
        assert!(matches!(err, SchedulerError::SessionNotRunning(_)));

        mount.start_session().await.unwrap();
        assert_eq!(mount.session_state(), SessionState::SessionRunning);
        assert_eq!(mount.get_next_job_batch(10, 1_000).await.unwrap().len(), 1);

        mount.tape_complete();
        let err = mount.get_next_job_batch(10, 1_000).await.unwrap_err();
        assert!(matches!(err, SchedulerError::SessionNotRunning(_)));
    }

    #[tokio::test]
    async fn test_batches_follow_fseq_order_and_quota() {
        let mount = mount_with_jobs(&[5, 1, 3, 2, 4], MountConfig::default()).await;
        mount.start_session().await.unwrap();

        let first = mount.get_next_job_batch(2, u64::MAX).await.unwrap();
        let fseqs: Vec<u64> = first.iter().map(|j| j.job.fseq).collect();
        assert_eq!(fseqs, vec![1, 2]);
        assert!(first.iter().all(|j| j.mount_id == 7
            && j.positioning_method == PositioningMethod::ByBlock));

        let second = mount.get_next_job_batch(10, 250).await.unwrap();
        let fseqs: Vec<u64> = second.iter().map(|j| j.job.fseq).collect();
        assert_eq!(fseqs, vec![3, 4]);
        assert_eq!(mount.in_flight_count(), 4);
    }

    #[tokio::test]
    async fn test_flush_deletes_requests_and_ownership() {
        let mount = mount_with_jobs(&[1, 2], MountConfig::default()).await;
        mount.start_session().await.unwrap();
        let batch = mount.get_next_job_batch(10, u64::MAX).await.unwrap();

        let report = mount.flush_async_success_reports(&batch).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(mount.in_flight_count(), 0);
        assert!(mount.agent().owned_objects().await.unwrap().is_empty());
        for job in &batch {
            assert!(!mount.queue().store().exists(&job.job.address).await.unwrap());
        }

        let again = mount.flush_async_success_reports(&batch).await.unwrap();
        assert_eq!(again.already_gone, 2);
        assert_eq!(mount.finish().await.unwrap(), RetireOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_failures_requeue_then_skip_then_fail() {
        let config = MountConfig {
            max_retries_within_mount: 2,
            max_total_retries: 3,
            ..MountConfig::default()
        };
        let mount = mount_with_jobs(&[1], config).await;
        mount.start_session().await.unwrap();

        let batch = mount.get_next_job_batch(1, u64::MAX).await.unwrap();
        let decision = mount.report_job_failure(&batch[0], "read error").await.unwrap();
        assert_eq!(decision, Some(FailureDecision::Requeue));
        assert!(mount.queue().contains(&batch[0].job.job_id).await.unwrap());

        let batch = mount.get_next_job_batch(1, u64::MAX).await.unwrap();
        assert_eq!(batch.len(), 1);
        let decision = mount.report_job_failure(&batch[0], "read error").await.unwrap();
        assert_eq!(decision, Some(FailureDecision::RequeueElsewhere));

        // Still queued, but no longer offered to this mount.
        assert!(mount.queue().contains(&batch[0].job.job_id).await.unwrap());
        assert!(mount.get_next_job_batch(1, u64::MAX).await.unwrap().is_empty());

        let request = mount
            .queue()
            .store()
            .fetch::<RetrieveRequestContent>(&batch[0].job.address)
            .await
            .unwrap();
        assert_eq!(request.payload.total_retries, 2);
        assert_eq!(request.payload.failure_log.len(), 2);
        assert_eq!(request.header.owner, mount.queue().address());
    }

    #[tokio::test]
    async fn test_abort_leaves_in_flight_jobs_to_gc() {
        let mount = mount_with_jobs(&[1, 2], MountConfig::default()).await;
        mount.start_session().await.unwrap();
        let batch = mount.get_next_job_batch(10, u64::MAX).await.unwrap();
        assert_eq!(batch.len(), 2);

        mount.abort();
        assert!(mount.both_sides_complete());
        assert_eq!(
            mount.finish().await.unwrap(),
            RetireOutcome::LeftBehind { owned: 2 }
        );
    }

    #[tokio::test]
    async fn test_tape_then_disk_completion() {
        let mount = mount_with_jobs(&[], MountConfig::default()).await;
        mount.start_session().await.unwrap();

        mount.tape_complete();
        assert_eq!(mount.drive_status(), DriveStatus::DrainingToDisk);
        assert!(!mount.both_sides_complete());

        mount.disk_complete();
        assert!(mount.both_sides_complete());
    }

    #[tokio::test]
    async fn test_apply_rao() {
        let mount = mount_with_jobs(&[1, 2, 3], MountConfig::default()).await;
        mount.start_session().await.unwrap();
        let batch = mount.get_next_job_batch(10, u64::MAX).await.unwrap();

        let reversed = mount.apply_rao(batch.clone(), &Reverse);
        let fseqs: Vec<u64> = reversed.iter().map(|j| j.job.fseq).collect();
        assert_eq!(fseqs, vec![3, 2, 1]);

        assert_eq!(mount.apply_rao(batch.clone(), &Broken), batch);
        assert_eq!(mount.apply_rao(reversed, &FseqOrder), batch);
    }
}
