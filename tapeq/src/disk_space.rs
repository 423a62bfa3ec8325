//! Per-batch disk space admission.
//!
//! A [`DiskSystemFreeSpaceList`] is built for one `get_next_job_batch` call.
//! It reads each disk system's free space at most once and reserves the bytes
//! of every admitted job, so a batch never commits more than
//! `free - targeted_free_space` bytes to one disk system.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::catalogue::DiskSystem;
use crate::job::JobInfo;

/// Source of free-space readings for disk systems.
#[async_trait]
pub trait FreeSpaceSource: Send + Sync {
    /// Free bytes on `disk_system`, or `None` when it cannot be determined.
    async fn free_space(
        &self,
        disk_system: &DiskSystem,
    ) -> anyhow::Result<Option<u64>>;
}

/// Verdict for one candidate job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// Space was reserved, or the job needs no disk system check.
    Admitted,
    /// The job's disk system cannot take it.
    NoSpace,
    /// The job's disk system free space is unknown for this batch.
    Unknown,
}

#[derive(Debug, Default)]
pub struct DiskSystemFreeSpaceList {
    systems: HashMap<String, DiskSystem>,
    free: HashMap<String, Option<u64>>,
    reserved: HashMap<String, u64>,
}

impl DiskSystemFreeSpaceList {
    pub fn new(systems: Vec<DiskSystem>) -> Self {
        Self {
            systems: systems
                .into_iter()
                .map(|ds| (ds.name.clone(), ds))
                .collect(),
            free: HashMap::new(),
            reserved: HashMap::new(),
        }
    }

    /// Whether the catalogue knows this disk system.
    pub fn knows(&self, name: &str) -> bool {
        self.systems.contains_key(name)
    }

    pub fn disk_system(&self, name: &str) -> Option<&DiskSystem> {
        self.systems.get(name)
    }

    /// Read free space for the named systems not read yet in this batch.
    ///
    /// A failed reading counts as unknown.
    pub async fn fetch<S>(&mut self, names: &[String], source: &S)
    where
        S: FreeSpaceSource + ?Sized,
    {
        for name in names {
            if self.free.contains_key(name) {
                continue;
            }
            let Some(disk_system) = self.systems.get(name) else {
                continue;
            };
            let reading = match source.free_space(disk_system).await {
                Ok(reading) => reading,
                Err(err) => {
                    tracing::warn!(
                        disk_system = %name,
                        error = %err,
                        "failed to query disk system free space"
                    );
                    None
                }
            };
            if reading.is_none() {
                tracing::warn!(
                    disk_system = %name,
                    "free space unknown, skipping disk system for this batch"
                );
            }
            self.free.insert(name.clone(), reading);
        }
    }

    /// Decide whether `job` fits and reserve its bytes if it does.
    pub fn admit(&mut self, job: &JobInfo) -> Admission {
        let Some(name) = job.disk_system_name.as_deref() else {
            return Admission::Admitted;
        };
        let Some(disk_system) = self.systems.get(name) else {
            return Admission::Admitted;
        };
        let Some(Some(free)) = self.free.get(name).copied() else {
            return Admission::Unknown;
        };

        let reserved = self.reserved.entry(name.to_string()).or_default();
        let available = free
            .saturating_sub(disk_system.targeted_free_space)
            .saturating_sub(*reserved);
        if job.size <= available {
            *reserved += job.size;
            Admission::Admitted
        } else {
            Admission::NoSpace
        }
    }

    /// Bytes reserved so far on a disk system.
    pub fn reserved(&self, name: &str) -> u64 {
        self.reserved.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use chrono::Utc;

    struct Fixed(Option<u64>);

    #[async_trait]
    impl FreeSpaceSource for Fixed {
        async fn free_space(&self, _: &DiskSystem) -> anyhow::Result<Option<u64>> {
            Ok(self.0)
        }
    }

    struct Failing;

    #[async_trait]
    impl FreeSpaceSource for Failing {
        async fn free_space(&self, _: &DiskSystem) -> anyhow::Result<Option<u64>> {
            anyhow::bail!("script exited with status 1")
        }
    }

    fn disk_system(name: &str, targeted: u64) -> DiskSystem {
        DiskSystem {
            name: name.into(),
            free_space_query_url: format!("eos:{name}"),
            refresh_interval_secs: 60,
            targeted_free_space: targeted,
            sleep_time_secs: 30,
        }
    }

    fn job(size: u64, disk_system: Option<&str>) -> JobInfo {
        JobInfo {
            job_id: JobId::new(),
            address: "RetrieveRequest-x".into(),
            archive_file_id: 1,
            copy_nb: 1,
            fseq: 1,
            block_id: 0,
            size,
            priority: 0,
            min_retrieve_request_age: 0,
            mount_policy_name: "default".into(),
            activity: None,
            disk_system_name: disk_system.map(str::to_string),
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reserves_until_target() {
        let mut list = DiskSystemFreeSpaceList::new(vec![disk_system("ds1", 100)]);
        list.fetch(&["ds1".to_string()], &Fixed(Some(400))).await;

        assert_eq!(list.admit(&job(200, Some("ds1"))), Admission::Admitted);
        assert_eq!(list.admit(&job(150, Some("ds1"))), Admission::NoSpace);
        assert_eq!(list.admit(&job(100, Some("ds1"))), Admission::Admitted);
        assert_eq!(list.reserved("ds1"), 300);
    }

    #[tokio::test]
    async fn test_unknown_free_space() {
        let mut list = DiskSystemFreeSpaceList::new(vec![
            disk_system("ds1", 0),
            disk_system("ds2", 0),
        ]);
        list.fetch(&["ds1".to_string()], &Fixed(None)).await;
        list.fetch(&["ds2".to_string()], &Failing).await;

        assert_eq!(list.admit(&job(1, Some("ds1"))), Admission::Unknown);
        assert_eq!(list.admit(&job(1, Some("ds2"))), Admission::Unknown);
    }

    #[test]
    fn test_jobs_without_known_disk_system_are_admitted() {
        let mut list = DiskSystemFreeSpaceList::new(vec![disk_system("ds1", 0)]);
        assert_eq!(list.admit(&job(u64::MAX, None)), Admission::Admitted);
        assert_eq!(list.admit(&job(u64::MAX, Some("other"))), Admission::Admitted);
        assert!(!list.knows("other"));
    }
}
