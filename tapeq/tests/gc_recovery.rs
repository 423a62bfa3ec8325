//! Recovery of work left behind by dead agents.
//!
//! Each test kills an agent mid-flight (by aborting it, or by letting its
//! heartbeat go stale) and checks that a collector pass restores a state in
//! which every job is queued exactly once, and that a second pass changes
//! nothing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tapeq::{
    AgentConfig, AgentHandle, BackendConfig, GarbageCollector, GcConfig, InMemoryBackend,
    InsertStrategy, MountConfig, ObjectStore, QueueConfig, RequestStatus, RetireOutcome,
    RetrieveMount, RetrieveQueue, RetrieveQueueShard, RetrieveRequestContent, TapeFileLocation,
    queue_address, queue_retrieve_requests, request_address,
};
use tapeq_testkit::{
    FaultInjectingBackend, MockCatalogue, Operation, StaticFreeSpace, TestEnv, mount_info,
    request_fixture,
};

async fn queued_ids(queue: &RetrieveQueue<InMemoryBackend>) -> HashSet<tapeq::JobId> {
    queue.job_ids().await.unwrap()
}

#[tokio::test]
async fn aborted_mount_jobs_return_to_the_queue() {
    let env = TestEnv::new("V00001");
    let ids = env
        .queue_requests("V00001", (1..=4).map(|f| request_fixture(f, 100)).collect())
        .await;

    let mount = env.mount("V00001", 1, MountConfig::default()).await;
    mount.start_session().await.unwrap();
    let batch = mount.get_next_job_batch(3, u64::MAX).await.unwrap();
    assert_eq!(batch.len(), 3);
    mount.abort();
    assert_eq!(
        mount.finish().await.unwrap(),
        RetireOutcome::LeftBehind { owned: 3 }
    );

    let collector = env.collector(Duration::from_secs(60)).await;
    let report = collector.run_once().await.unwrap();
    assert_eq!(report.dead_agents, 1);
    assert_eq!(report.objects_collected, 3);
    assert_eq!(report.agents_removed, 1);

    let queue = env.queue("V00001").await;
    assert_eq!(queued_ids(&queue).await, ids.iter().copied().collect::<HashSet<_>>());
    for id in &ids {
        let request = env
            .store
            .fetch::<RetrieveRequestContent>(&request_address(id))
            .await
            .unwrap();
        assert_eq!(request.header.owner, queue.address());
        assert_eq!(request.payload.status, RequestStatus::Queued);
    }

    let again = collector.run_once().await.unwrap();
    assert_eq!(again.dead_agents, 0);
    assert_eq!(queued_ids(&queue).await.len(), 4);

    // The requeued jobs are served again by the next mount.
    let next = env.mount("V00001", 2, MountConfig::default()).await;
    next.start_session().await.unwrap();
    let batch = next.get_next_job_batch(10, u64::MAX).await.unwrap();
    let fseqs: Vec<u64> = batch.iter().map(|j| j.job.fseq).collect();
    assert_eq!(fseqs, vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn silent_agent_is_declared_dead_after_its_timeout() {
    let mut env = TestEnv::new("V00001");
    env.agent_config = AgentConfig {
        heartbeat_timeout_ms: 5_000,
        ..AgentConfig::default()
    };
    env.queue_requests("V00001", vec![request_fixture(1, 100)]).await;

    let mount = env.mount("V00001", 1, MountConfig::default()).await;
    mount.start_session().await.unwrap();
    let batch = mount.get_next_job_batch(10, u64::MAX).await.unwrap();
    assert_eq!(batch.len(), 1);

    let collector = env.collector(Duration::from_secs(5)).await;
    assert_eq!(collector.run_once().await.unwrap().dead_agents, 0);

    tokio::time::advance(Duration::from_secs(3)).await;
    mount.agent().heartbeat().await.unwrap();
    assert_eq!(collector.run_once().await.unwrap().dead_agents, 0);

    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(collector.run_once().await.unwrap().dead_agents, 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    let report = collector.run_once().await.unwrap();
    assert_eq!(report.dead_agents, 1);
    assert_eq!(report.objects_collected, 1);
    assert!(env.queue("V00001").await.contains(&batch[0].job.job_id).await.unwrap());
}

#[tokio::test]
async fn moved_and_deleted_files_are_verified_against_the_catalogue() {
    let env = TestEnv::new("V00001");
    let ids = env
        .queue_requests("V00001", (1..=2).map(|f| request_fixture(f, 100)).collect())
        .await;

    let mount = env.mount("V00001", 1, MountConfig::default()).await;
    mount.start_session().await.unwrap();
    mount.get_next_job_batch(10, u64::MAX).await.unwrap();
    mount.abort();
    mount.finish().await.unwrap();

    // File 1 was repacked to another tape; file 2 was deleted.
    env.catalogue.set_file(
        1,
        1,
        TapeFileLocation {
            vid: "V00002".into(),
            fseq: 9,
            block_id: 900,
        },
    );
    env.catalogue.forget_file(2, 1);

    let collector = env.collector(Duration::from_secs(60)).await;
    let report = collector.run_once().await.unwrap();
    assert_eq!(report.objects_collected, 2);

    assert!(queued_ids(&env.queue("V00001").await).await.is_empty());
    let moved_queue = env.queue("V00002").await;
    assert!(moved_queue.contains(&ids[0]).await.unwrap());
    let moved = env
        .store
        .fetch::<RetrieveRequestContent>(&request_address(&ids[0]))
        .await
        .unwrap();
    assert_eq!(moved.header.owner, queue_address("V00002"));
    assert_eq!(moved.payload.vid, "V00002");
    assert_eq!(moved.payload.job.fseq, 9);
    assert!(!env.store.exists(&request_address(&ids[1])).await.unwrap());
}

#[tokio::test]
async fn orphaned_shard_from_interrupted_split_is_salvaged() {
    let env = TestEnv::new("V00001");
    let ids = env
        .queue_requests("V00001", (1..=3).map(|f| request_fixture(f, 100)).collect())
        .await;
    let queue = env.queue("V00001").await;

    // A splitter copied jobs 2 and 3 into a new shard and died before the
    // pointer swap; job 3 also vanished from the old shard.
    let splitter = env.agent("Splitter").await;
    let orphan_address = "RetrieveQueueShard-V00001-orphan";
    splitter.add_to_ownership([orphan_address]).await.unwrap();
    let removed = queue.remove_jobs(&ids[2..]).await.unwrap();
    let mut jobs = queue
        .content()
        .await
        .unwrap()
        .shards
        .iter()
        .map(|p| p.address.clone())
        .collect::<Vec<_>>();
    assert_eq!(jobs.len(), 1);
    let old_shard = env
        .store
        .fetch::<RetrieveQueueShard>(&jobs.remove(0))
        .await
        .unwrap();
    let mut copied: Vec<_> = old_shard
        .payload
        .jobs()
        .iter()
        .filter(|j| j.job_id == ids[1])
        .cloned()
        .collect();
    copied.extend(removed);
    let mut orphan = RetrieveQueueShard::new("V00001");
    orphan.add_jobs_batch(copied, InsertStrategy::InPlace).unwrap();
    env.store
        .insert(orphan_address, splitter.address(), &orphan)
        .await
        .unwrap();
    splitter.leave_non_empty_behind();
    splitter.retire().await.unwrap();

    let collector = env.collector(Duration::from_secs(60)).await;
    let report = collector.run_once().await.unwrap();
    assert_eq!(report.objects_collected, 1);
    assert!(!env.store.exists(orphan_address).await.unwrap());
    assert_eq!(queued_ids(&queue).await, ids.iter().copied().collect::<HashSet<_>>());

    // Job 2 was already queued and is not duplicated.
    let stats = queue.statistics().await.unwrap();
    assert_eq!(stats.jobs, 3);

    let again = collector.run_once().await.unwrap();
    assert_eq!(again.objects_collected, 0);
}

#[tokio::test]
async fn orphaned_shard_salvage_leaves_jobs_popped_by_a_live_mount() {
    let env = TestEnv::new("V00001");
    let ids = env
        .queue_requests("V00001", (1..=3).map(|f| request_fixture(f, 100)).collect())
        .await;
    let queue = env.queue("V00001").await;

    // A splitter copied the whole shard and died after the pointer swap but
    // before deleting its copy.
    let splitter = env.agent("Splitter").await;
    let orphan_address = "RetrieveQueueShard-V00001-copy";
    splitter.add_to_ownership([orphan_address]).await.unwrap();
    let live_shard = queue.content().await.unwrap().shards[0].address.clone();
    let live = env
        .store
        .fetch::<RetrieveQueueShard>(&live_shard)
        .await
        .unwrap();
    env.store
        .insert(orphan_address, splitter.address(), &live.payload)
        .await
        .unwrap();
    splitter.leave_non_empty_behind();
    splitter.retire().await.unwrap();

    let mount = env.mount("V00001", 1, MountConfig::default()).await;
    mount.start_session().await.unwrap();
    let batch = mount.get_next_job_batch(1, u64::MAX).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].job.job_id, ids[0]);

    let collector = env.collector(Duration::from_secs(60)).await;
    let report = collector.run_once().await.unwrap();
    assert_eq!(report.objects_collected, 1);
    assert!(!env.store.exists(orphan_address).await.unwrap());
    assert!(!queue.contains(&ids[0]).await.unwrap());
    let request = env
        .store
        .fetch::<RetrieveRequestContent>(&request_address(&ids[0]))
        .await
        .unwrap();
    assert_eq!(request.header.owner, mount.agent().address());
    assert_eq!(request.payload.status, RequestStatus::InFlight);

    // The job still has retries left and goes back to the queue once.
    let decision = mount.report_job_failure(&batch[0], "read error").await.unwrap();
    assert_eq!(decision, Some(tapeq::FailureDecision::Requeue));
    assert!(env.store.exists(&request_address(&ids[0])).await.unwrap());
    assert_eq!(queued_ids(&queue).await, ids.iter().copied().collect::<HashSet<_>>());
    assert_eq!(queue.statistics().await.unwrap().jobs, 3);
}

#[tokio::test(start_paused = true)]
async fn transient_backend_errors_are_retried_during_collection() {
    let backend = Arc::new(FaultInjectingBackend::new(Arc::new(InMemoryBackend::new())));
    let store = ObjectStore::new(backend.clone(), &BackendConfig::default());
    let catalogue = MockCatalogue::with_default_vid("V00001");
    let queue = RetrieveQueue::open_or_create(store.clone(), "V00001", QueueConfig::default())
        .await
        .unwrap();
    let frontend = AgentHandle::register(store.clone(), "Frontend", &AgentConfig::default())
        .await
        .unwrap();
    let ids = queue_retrieve_requests(&queue, &frontend, vec![request_fixture(1, 100)])
        .await
        .unwrap();
    frontend.retire().await.unwrap();

    let mount = RetrieveMount::builder()
        .with_info(mount_info("V00001", 1))
        .with_queue(queue.clone())
        .with_agent(
            AgentHandle::register(store.clone(), "RetrieveMount", &AgentConfig::default())
                .await
                .unwrap(),
        )
        .with_catalogue(Arc::new(catalogue.clone()))
        .with_free_space(Arc::new(StaticFreeSpace::new()))
        .build()
        .unwrap();
    mount.start_session().await.unwrap();
    assert_eq!(mount.get_next_job_batch(1, u64::MAX).await.unwrap().len(), 1);
    mount.abort();
    mount.finish().await.unwrap();

    backend.fail_transiently(Operation::LockedFetch, "RetrieveRequest-", 2);
    let collector = GarbageCollector::new(
        AgentHandle::register(store.clone(), "GarbageCollector", &AgentConfig::default())
            .await
            .unwrap(),
        Arc::new(catalogue),
        QueueConfig::default(),
        GcConfig::default(),
        Duration::from_secs(60),
    );
    let report = collector.run_once().await.unwrap();
    assert_eq!(backend.injected(), 2);
    assert_eq!(report.objects_collected, 1);
    assert_eq!(report.objects_failed, 0);
    assert!(queue.contains(&ids[0]).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn hard_backend_errors_leave_the_object_for_a_later_pass() {
    let backend = Arc::new(FaultInjectingBackend::new(Arc::new(InMemoryBackend::new())));
    let store = ObjectStore::new(backend.clone(), &BackendConfig::default());
    let catalogue = MockCatalogue::with_default_vid("V00001");
    let queue = RetrieveQueue::open_or_create(store.clone(), "V00001", QueueConfig::default())
        .await
        .unwrap();
    let agent = AgentHandle::register(store.clone(), "RetrieveMount", &AgentConfig::default())
        .await
        .unwrap();
    let ids = queue_retrieve_requests(&queue, &agent, vec![request_fixture(1, 100)])
        .await
        .unwrap();
    let list = queue
        .candidate_job_list(u64::MAX, u64::MAX, &HashSet::new(), &HashSet::new())
        .await
        .unwrap();
    queue.transfer_to_agent(&list.candidates, &agent).await.unwrap();
    agent.leave_non_empty_behind();
    agent.retire().await.unwrap();

    backend.fail_hard(Operation::LockedFetch, "RetrieveRequest-", 1);
    let collector = GarbageCollector::new(
        AgentHandle::register(store.clone(), "GarbageCollector", &AgentConfig::default())
            .await
            .unwrap(),
        Arc::new(catalogue),
        QueueConfig::default(),
        GcConfig::default(),
        Duration::from_secs(60),
    );
    let first = collector.run_once().await.unwrap();
    assert_eq!(first.objects_failed, 1);
    assert_eq!(first.agents_removed, 0);
    assert!(store.exists(agent.address()).await.unwrap());

    let second = collector.run_once().await.unwrap();
    assert_eq!(second.objects_collected, 1);
    assert_eq!(second.agents_removed, 1);
    assert!(queue.contains(&ids[0]).await.unwrap());
}

#[tokio::test]
async fn mount_info_fixture_is_usable_for_a_mount_without_jobs() {
    let env = TestEnv::new("V00001");
    let mount = env.mount("V00001", 3, MountConfig::default()).await;
    mount.start_session().await.unwrap();
    assert!(mount.get_next_job_batch(10, u64::MAX).await.unwrap().is_empty());
    assert_eq!(env.catalogue.recorded_mounts(), vec![("V00001".to_string(), "DRIVE3".to_string())]);
    assert_eq!(mount.finish().await.unwrap(), RetireOutcome::Deleted);
}
