//! Queue shard: a bounded, fSeq-ordered slice of one tape's retrieve queue.
//!
//! A shard is pure data. Locking, persistence and the relationship with the
//! owning queue live in [`crate::queue`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::job::{JobId, JobInfo};
use crate::object::{ObjectPayload, ObjectType};

/// Cached aggregate of a shard's content.
///
/// An empty shard has `min_fseq == max_fseq == 0`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobsSummary {
    pub jobs: u64,
    pub bytes: u64,
    pub min_fseq: u64,
    pub max_fseq: u64,
}

impl JobsSummary {
    /// Summary of a slice of jobs already sorted by fSeq.
    fn of(jobs: &[JobInfo]) -> Self {
        Self {
            jobs: jobs.len() as u64,
            bytes: jobs.iter().map(|job| job.size).sum(),
            min_fseq: jobs.first().map_or(0, |job| job.fseq),
            max_fseq: jobs.last().map_or(0, |job| job.fseq),
        }
    }
}

/// How a batch is inserted into a shard.
///
/// Both strategies leave the shard in the same state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertStrategy {
    /// Insert each job at its position in the existing vector.
    #[default]
    InPlace,
    /// Merge the sorted batch with the existing jobs into a fresh vector.
    ThroughCopy,
}

/// Outcome of [`RetrieveQueueShard::remove_jobs`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemovalResult {
    pub jobs_removed: u64,
    pub jobs_after: u64,
    pub bytes_removed: u64,
    pub bytes_after: u64,
    pub removed_jobs: Vec<JobInfo>,
}

/// Ordered prefix of a shard selected for a mount.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CandidateJobList {
    pub candidates: Vec<JobInfo>,
    pub candidate_files: u64,
    pub candidate_bytes: u64,
    pub remaining_files: u64,
    pub remaining_bytes: u64,
    /// Selection stopped on a job that did not fit the quota.
    pub hit_quota: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetrieveQueueShard {
    pub vid: String,
    jobs: Vec<JobInfo>,
    summary: JobsSummary,
}

impl ObjectPayload for RetrieveQueueShard {
    const TYPE: ObjectType = ObjectType::RetrieveQueueShard;
}

impl RetrieveQueueShard {
    pub fn new(vid: impl Into<String>) -> Self {
        Self {
            vid: vid.into(),
            jobs: Vec::new(),
            summary: JobsSummary::default(),
        }
    }

    fn from_sorted(vid: String, jobs: Vec<JobInfo>) -> Self {
        let summary = JobsSummary::of(&jobs);
        Self { vid, jobs, summary }
    }

    pub fn jobs(&self) -> &[JobInfo] {
        &self.jobs
    }

    pub fn summary(&self) -> JobsSummary {
        self.summary
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs.iter().any(|job| job.job_id == *job_id)
    }

    pub fn contains_fseq(&self, fseq: u64) -> bool {
        self.jobs.binary_search_by_key(&fseq, |job| job.fseq).is_ok()
    }

    pub fn into_jobs(self) -> Vec<JobInfo> {
        self.jobs
    }

    /// Add a batch of jobs.
    ///
    /// Fails with `DuplicateFseq`, leaving the shard untouched, when an fSeq
    /// is already present or repeated within the batch.
    pub fn add_jobs_batch(
        &mut self,
        mut jobs: Vec<JobInfo>,
        strategy: InsertStrategy,
    ) -> Result<()> {
        let mut seen = HashSet::with_capacity(jobs.len());
        for job in &jobs {
            if !seen.insert(job.fseq) || self.contains_fseq(job.fseq) {
                return Err(SchedulerError::DuplicateFseq {
                    vid: self.vid.clone(),
                    fseq: job.fseq,
                });
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }

        let added_bytes: u64 = jobs.iter().map(|job| job.size).sum();
        let added_min = jobs.iter().map(|job| job.fseq).min().unwrap_or(0);
        let added_max = jobs.iter().map(|job| job.fseq).max().unwrap_or(0);

        match strategy {
            InsertStrategy::InPlace => {
                for job in jobs {
                    let at = self.jobs.partition_point(|j| j.fseq < job.fseq);
                    self.jobs.insert(at, job);
                }
            }
            InsertStrategy::ThroughCopy => {
                jobs.sort_by_key(|job| job.fseq);
                let existing = std::mem::take(&mut self.jobs);
                let mut merged = Vec::with_capacity(existing.len() + jobs.len());
                let mut left = existing.into_iter().peekable();
                let mut right = jobs.into_iter().peekable();
                loop {
                    let take_left = match (left.peek(), right.peek()) {
                        (Some(l), Some(r)) => l.fseq < r.fseq,
                        (Some(_), None) => true,
                        (None, Some(_)) => false,
                        (None, None) => break,
                    };
                    let next = if take_left { left.next() } else { right.next() };
                    merged.extend(next);
                }
                self.jobs = merged;
            }
        }

        let was_empty = self.summary.jobs == 0;
        self.summary.jobs += seen.len() as u64;
        self.summary.bytes += added_bytes;
        if was_empty {
            self.summary.min_fseq = added_min;
            self.summary.max_fseq = added_max;
        } else {
            self.summary.min_fseq = self.summary.min_fseq.min(added_min);
            self.summary.max_fseq = self.summary.max_fseq.max(added_max);
        }
        Ok(())
    }

    /// Remove jobs by id. Ids not present are ignored.
    pub fn remove_jobs(&mut self, ids: &HashSet<JobId>) -> RemovalResult {
        let mut removed_jobs = Vec::new();
        let mut kept = Vec::with_capacity(self.jobs.len());
        for job in std::mem::take(&mut self.jobs) {
            if ids.contains(&job.job_id) {
                removed_jobs.push(job);
            } else {
                kept.push(job);
            }
        }
        self.jobs = kept;

        let bytes_removed: u64 = removed_jobs.iter().map(|job| job.size).sum();
        self.summary.jobs -= removed_jobs.len() as u64;
        self.summary.bytes -= bytes_removed;
        self.summary.min_fseq = self.jobs.first().map_or(0, |job| job.fseq);
        self.summary.max_fseq = self.jobs.last().map_or(0, |job| job.fseq);

        RemovalResult {
            jobs_removed: removed_jobs.len() as u64,
            jobs_after: self.summary.jobs,
            bytes_removed,
            bytes_after: self.summary.bytes,
            removed_jobs,
        }
    }

    /// Select the longest fSeq-ordered prefix fitting the quota.
    ///
    /// Jobs in `skip_request_ids` or targeting a disk system in
    /// `skip_disk_systems` are passed over. Selection stops at the first
    /// remaining job that would exceed `max_bytes` or `max_files`.
    pub fn candidate_job_list(
        &self,
        max_bytes: u64,
        max_files: u64,
        skip_request_ids: &HashSet<JobId>,
        skip_disk_systems: &HashSet<String>,
    ) -> CandidateJobList {
        let mut list = CandidateJobList::default();
        for job in &self.jobs {
            if skip_request_ids.contains(&job.job_id) {
                continue;
            }
            if let Some(disk_system) = &job.disk_system_name
                && skip_disk_systems.contains(disk_system)
            {
                continue;
            }
            if list.candidate_files + 1 > max_files
                || list.candidate_bytes + job.size > max_bytes
            {
                list.hit_quota = true;
                break;
            }
            list.candidate_files += 1;
            list.candidate_bytes += job.size;
            list.candidates.push(job.clone());
        }
        list.remaining_files = self.summary.jobs.saturating_sub(list.candidate_files);
        list.remaining_bytes = self.summary.bytes.saturating_sub(list.candidate_bytes);
        list
    }

    /// Recompute the summary from content. Returns whether it had drifted.
    pub fn rebuild(&mut self) -> bool {
        self.jobs.sort_by_key(|job| job.fseq);
        let fresh = JobsSummary::of(&self.jobs);
        let drifted = fresh != self.summary;
        self.summary = fresh;
        drifted
    }

    /// Split into fSeq-ordered shards of at most `max_size` jobs each,
    /// halving at the median until every part fits.
    pub fn split(self, max_size: u64) -> Vec<RetrieveQueueShard> {
        let max_size = max_size.max(1);
        if self.jobs.len() as u64 <= max_size {
            return vec![self];
        }
        let Self { vid, mut jobs, .. } = self;
        let upper = jobs.split_off(jobs.len() / 2);
        let mut parts =
            Self::from_sorted(vid.clone(), jobs).split(max_size);
        parts.extend(Self::from_sorted(vid, upper).split(max_size));
        parts
    }

    /// Concatenate with a shard covering strictly higher fSeqs.
    pub fn merge(self, higher: RetrieveQueueShard) -> RetrieveQueueShard {
        let Self { vid, mut jobs, .. } = self;
        jobs.extend(higher.jobs);
        jobs.sort_by_key(|job| job.fseq);
        Self::from_sorted(vid, jobs)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_summary(&mut self, summary: JobsSummary) {
        self.summary = summary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(fseq: u64, size: u64) -> JobInfo {
        let job_id = JobId::new();
        JobInfo {
            job_id,
            address: format!("RetrieveRequest-{job_id}"),
            archive_file_id: fseq,
            copy_nb: 1,
            fseq,
            block_id: fseq * 10,
            size,
            priority: 1,
            min_retrieve_request_age: 0,
            mount_policy_name: "default".into(),
            activity: None,
            disk_system_name: None,
            start_time: Utc::now(),
        }
    }

    fn shard_with(fseqs: &[u64], size: u64) -> RetrieveQueueShard {
        let mut shard = RetrieveQueueShard::new("V00001");
        shard
            .add_jobs_batch(
                fseqs.iter().map(|f| job(*f, size)).collect(),
                InsertStrategy::InPlace,
            )
            .unwrap();
        shard
    }

    fn fseqs(jobs: &[JobInfo]) -> Vec<u64> {
        jobs.iter().map(|job| job.fseq).collect()
    }

    #[test]
    fn test_candidate_prefix_respects_byte_quota() {
        let shard = shard_with(&[10, 11, 12, 13], 100);

        let list = shard.candidate_job_list(250, 10, &HashSet::new(), &HashSet::new());

        assert_eq!(fseqs(&list.candidates), vec![10, 11]);
        assert_eq!(list.candidate_bytes, 200);
        assert_eq!(list.candidate_files, 2);
        assert_eq!(list.remaining_files, 2);
        assert_eq!(list.remaining_bytes, 200);
        assert!(list.hit_quota);
    }

    #[test]
    fn test_candidate_prefix_respects_file_quota() {
        let shard = shard_with(&[1, 2, 3], 1);
        let list = shard.candidate_job_list(u64::MAX, 2, &HashSet::new(), &HashSet::new());
        assert_eq!(fseqs(&list.candidates), vec![1, 2]);

        let none = shard.candidate_job_list(u64::MAX, 0, &HashSet::new(), &HashSet::new());
        assert!(none.candidates.is_empty());
        assert!(none.hit_quota);
    }

    #[test]
    fn test_candidate_oversized_head_blocks_selection() {
        let mut shard = RetrieveQueueShard::new("V00001");
        shard
            .add_jobs_batch(vec![job(1, 500), job(2, 10)], InsertStrategy::InPlace)
            .unwrap();

        let list = shard.candidate_job_list(100, 10, &HashSet::new(), &HashSet::new());
        assert!(list.candidates.is_empty());
        assert!(list.hit_quota);
    }

    #[test]
    fn test_candidate_skips_ids_and_disk_systems() {
        let mut shard = RetrieveQueueShard::new("V00001");
        let mut on_full = job(2, 100);
        on_full.disk_system_name = Some("full".into());
        let skipped = job(1, 100);
        let skip_ids: HashSet<JobId> = [skipped.job_id].into();
        shard
            .add_jobs_batch(
                vec![skipped, on_full, job(3, 100)],
                InsertStrategy::InPlace,
            )
            .unwrap();

        let skip_ds: HashSet<String> = ["full".to_string()].into();
        let list = shard.candidate_job_list(1_000, 10, &skip_ids, &skip_ds);

        assert_eq!(fseqs(&list.candidates), vec![3]);
        assert!(!list.hit_quota);
    }

    #[test]
    fn test_duplicate_fseq_leaves_shard_unchanged() {
        let mut shard = shard_with(&[5, 7], 10);
        let before = shard.summary();

        let err = shard
            .add_jobs_batch(vec![job(6, 10), job(7, 10)], InsertStrategy::InPlace)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateFseq { fseq: 7, .. }));
        assert_eq!(shard.summary(), before);
        assert_eq!(fseqs(shard.jobs()), vec![5, 7]);

        let err = shard
            .add_jobs_batch(vec![job(8, 10), job(8, 10)], InsertStrategy::ThroughCopy)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateFseq { fseq: 8, .. }));
        assert_eq!(shard.len(), 2);
    }

    #[test]
    fn test_insert_strategies_are_equivalent() {
        let batch: Vec<JobInfo> = [9, 3, 6, 1].iter().map(|f| job(*f, *f * 2)).collect();

        let mut in_place = shard_with(&[2, 5, 8], 4);
        let mut through_copy = in_place.clone();
        in_place
            .add_jobs_batch(batch.clone(), InsertStrategy::InPlace)
            .unwrap();
        through_copy
            .add_jobs_batch(batch, InsertStrategy::ThroughCopy)
            .unwrap();

        assert_eq!(in_place.jobs(), through_copy.jobs());
        assert_eq!(in_place.summary(), through_copy.summary());
        assert_eq!(fseqs(in_place.jobs()), vec![1, 2, 3, 5, 6, 8, 9]);
        assert_eq!(
            in_place.summary(),
            JobsSummary {
                jobs: 7,
                bytes: 12 + 38,
                min_fseq: 1,
                max_fseq: 9,
            }
        );
        assert!(!in_place.rebuild());
    }

    #[test]
    fn test_remove_absent_id_is_noop() {
        let mut shard = shard_with(&[1, 2], 50);
        let result = shard.remove_jobs(&[JobId::new()].into());

        assert_eq!(result.jobs_removed, 0);
        assert_eq!(result.bytes_removed, 0);
        assert_eq!(result.jobs_after, 2);
        assert_eq!(result.bytes_after, 100);
        assert!(result.removed_jobs.is_empty());
    }

    #[test]
    fn test_remove_updates_summary() {
        let mut shard = shard_with(&[1, 2, 3], 50);
        let first = shard.jobs()[0].job_id;
        let last = shard.jobs()[2].job_id;

        let result = shard.remove_jobs(&[first, last].into());
        assert_eq!(result.jobs_removed, 2);
        assert_eq!(result.bytes_after, 50);
        assert_eq!(
            shard.summary(),
            JobsSummary {
                jobs: 1,
                bytes: 50,
                min_fseq: 2,
                max_fseq: 2,
            }
        );

        let only = shard.jobs()[0].job_id;
        shard.remove_jobs(&[only].into());
        assert_eq!(shard.summary(), JobsSummary::default());
        assert!(!shard.rebuild());
    }

    #[test]
    fn test_rebuild_repairs_drift() {
        let mut shard = shard_with(&[4, 9], 10);
        shard.corrupt_summary(JobsSummary {
            jobs: 7,
            bytes: 1,
            min_fseq: 0,
            max_fseq: 0,
        });

        assert!(shard.rebuild());
        assert_eq!(
            shard.summary(),
            JobsSummary {
                jobs: 2,
                bytes: 20,
                min_fseq: 4,
                max_fseq: 9,
            }
        );
    }

    #[test]
    fn test_split_preserves_order_and_bounds() {
        let shard = shard_with(&(1..=10).collect::<Vec<_>>(), 1);
        let parts = shard.split(3);

        assert!(parts.iter().all(|p| p.len() <= 3));
        let all: Vec<u64> = parts.iter().flat_map(|p| fseqs(p.jobs())).collect();
        assert_eq!(all, (1..=10).collect::<Vec<_>>());
        for pair in parts.windows(2) {
            assert!(pair[0].summary().max_fseq < pair[1].summary().min_fseq);
        }
    }

    #[test]
    fn test_merge_concatenates() {
        let low = shard_with(&[1, 2], 5);
        let high = shard_with(&[7], 5);
        let merged = low.merge(high);
        assert_eq!(fseqs(merged.jobs()), vec![1, 2, 7]);
        assert_eq!(merged.summary().bytes, 15);
    }
}
