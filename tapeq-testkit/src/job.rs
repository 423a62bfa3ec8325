use std::sync::Arc;
use std::time::Duration;

use tapeq::{
    AgentConfig, AgentHandle, BackendConfig, DiskSystem, GarbageCollector, GcConfig,
    InMemoryBackend, JobId, MountConfig, MountInfo, NewRetrieveRequest, ObjectStore,
    QueueConfig, RetrieveMount, RetrieveQueue, queue_retrieve_requests,
};

use crate::{MockCatalogue, StaticFreeSpace};

/// A retrieve request for the file `archive_file_id == fseq`.
pub fn request_fixture(fseq: u64, size: u64) -> NewRetrieveRequest {
    NewRetrieveRequest {
        archive_file_id: fseq,
        copy_nb: 1,
        fseq,
        block_id: fseq,
        size,
        priority: 0,
        min_retrieve_request_age: 0,
        mount_policy_name: "default".to_string(),
        activity: None,
        disk_system_name: None,
        dst_url: format!("root://buffer//retrieve/{fseq}"),
    }
}

/// Requests for `fseqs`, all bound for `disk_system`.
pub fn requests_on_disk_system(
    fseqs: impl IntoIterator<Item = u64>,
    size: u64,
    disk_system: &str,
) -> Vec<NewRetrieveRequest> {
    fseqs
        .into_iter()
        .map(|fseq| NewRetrieveRequest {
            disk_system_name: Some(disk_system.to_string()),
            ..request_fixture(fseq, size)
        })
        .collect()
}

pub fn disk_system(name: &str, targeted_free_space: u64) -> DiskSystem {
    DiskSystem {
        name: name.to_string(),
        free_space_query_url: format!("eos:{name}:default"),
        refresh_interval_secs: 10,
        targeted_free_space,
        sleep_time_secs: 15,
    }
}

pub fn mount_info(vid: &str, mount_id: u64) -> MountInfo {
    MountInfo {
        vid: vid.to_string(),
        drive: format!("DRIVE{mount_id}"),
        mount_id,
        tape_pool: "pool".to_string(),
        vo: "vo".to_string(),
        media_type: "LTO9".to_string(),
        vendor: "vendor".to_string(),
        capacity_in_bytes: 18_000_000_000_000,
        activity: None,
        logical_library: "library".to_string(),
        nb_files_on_tape: 0,
    }
}

/// Shared in-memory store plus the external collaborators, wired together.
#[derive(Clone, Debug)]
pub struct TestEnv {
    pub store: ObjectStore<InMemoryBackend>,
    pub catalogue: MockCatalogue,
    pub free_space: StaticFreeSpace,
    pub queue_config: QueueConfig,
    pub agent_config: AgentConfig,
}

impl TestEnv {
    /// Files default to tape `vid` in the catalogue.
    pub fn new(vid: &str) -> Self {
        Self {
            store: ObjectStore::new(
                Arc::new(InMemoryBackend::new()),
                &BackendConfig::default(),
            ),
            catalogue: MockCatalogue::with_default_vid(vid),
            free_space: StaticFreeSpace::new(),
            queue_config: QueueConfig::default(),
            agent_config: AgentConfig::default(),
        }
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub async fn queue(&self, vid: &str) -> RetrieveQueue<InMemoryBackend> {
        RetrieveQueue::open_or_create(self.store.clone(), vid, self.queue_config.clone())
            .await
            .expect("queue creation")
    }

    pub async fn agent(&self, agent_type: &str) -> AgentHandle<InMemoryBackend> {
        AgentHandle::register(self.store.clone(), agent_type, &self.agent_config)
            .await
            .expect("agent registration")
    }

    /// Queue `requests` on `vid` through a short-lived front-end agent.
    pub async fn queue_requests(&self, vid: &str, requests: Vec<NewRetrieveRequest>) -> Vec<JobId> {
        let queue = self.queue(vid).await;
        let frontend = self.agent("Frontend").await;
        let ids = queue_retrieve_requests(&queue, &frontend, requests)
            .await
            .expect("queueing requests");
        frontend.retire().await.expect("front-end agent retirement");
        ids
    }

    pub async fn mount(
        &self,
        vid: &str,
        mount_id: u64,
        config: MountConfig,
    ) -> RetrieveMount<InMemoryBackend> {
        RetrieveMount::builder()
            .with_info(mount_info(vid, mount_id))
            .with_config(config)
            .with_queue(self.queue(vid).await)
            .with_agent(self.agent("RetrieveMount").await)
            .with_catalogue(Arc::new(self.catalogue.clone()))
            .with_free_space(Arc::new(self.free_space.clone()))
            .build()
            .expect("mount construction")
    }

    pub async fn collector(&self, default_timeout: Duration) -> GarbageCollector<InMemoryBackend> {
        GarbageCollector::new(
            self.agent("GarbageCollector").await,
            Arc::new(self.catalogue.clone()),
            self.queue_config.clone(),
            GcConfig::default(),
            default_timeout,
        )
    }
}
