//! Concurrency properties: at-most-once delivery across mounts sharing a
//! queue, and queue consistency under concurrent inserts.

use std::collections::HashSet;
use std::sync::Arc;

use tapeq::{JobId, MountConfig, QueueConfig, RetrieveQueueShard, SchedulerError};
use tapeq_testkit::{TestEnv, request_fixture};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_mounts_never_receive_the_same_job() {
    let env = TestEnv::new("V00001").with_queue_config(QueueConfig {
        max_shard_size: 16,
        merge_threshold: 4,
        ..QueueConfig::default()
    });
    let ids = env
        .queue_requests("V00001", (1..=200).map(|f| request_fixture(f, 10)).collect())
        .await;

    let mut tasks = Vec::new();
    for mount_id in 1..=2 {
        let mount = Arc::new(env.mount("V00001", mount_id, MountConfig::default()).await);
        mount.start_session().await.unwrap();
        tasks.push(tokio::spawn(async move {
            let mut served: Vec<JobId> = Vec::new();
            loop {
                let batch = mount.get_next_job_batch(10, u64::MAX).await.unwrap();
                if batch.is_empty() {
                    let remaining = mount.queue().content().await.unwrap().summary().jobs;
                    if remaining == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                let fseqs: Vec<u64> = batch.iter().map(|j| j.job.fseq).collect();
                assert!(fseqs.windows(2).all(|w| w[0] < w[1]), "batch out of order: {fseqs:?}");
                mount.flush_async_success_reports(&batch).await.unwrap();
                served.extend(batch.iter().map(|j| j.job.job_id));
            }
            mount.finish().await.unwrap();
            served
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job {id} served twice");
        }
    }
    assert_eq!(seen, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_keep_shards_ordered_and_bounded() {
    let env = TestEnv::new("V00001").with_queue_config(QueueConfig {
        max_shard_size: 16,
        merge_threshold: 4,
        ..QueueConfig::default()
    });

    let mut tasks = Vec::new();
    for writer in 0..8u64 {
        let env = env.clone();
        tasks.push(tokio::spawn(async move {
            // Writers interleave: writer w owns fSeqs w, w + 8, w + 16, ...
            let requests = (0..50).map(|i| request_fixture(i * 8 + writer + 1, 10)).collect();
            env.queue_requests("V00001", requests).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().len(), 50);
    }

    let queue = env.queue("V00001").await;
    let content = queue.content().await.unwrap();
    assert_eq!(content.summary().jobs, 400);

    let mut previous_max = 0;
    let mut all_fseqs = Vec::new();
    for pointer in &content.shards {
        let shard = env
            .store
            .fetch::<RetrieveQueueShard>(&pointer.address)
            .await
            .unwrap();
        let summary = shard.payload.summary();
        assert!(summary.jobs <= 16, "shard over capacity: {}", summary.jobs);
        assert!(summary.min_fseq > previous_max, "shards overlap");
        assert!(pointer.summary.min_fseq <= summary.min_fseq);
        assert!(pointer.summary.max_fseq >= summary.max_fseq);
        previous_max = summary.max_fseq;
        all_fseqs.extend(shard.payload.jobs().iter().map(|j| j.fseq));
    }
    assert_eq!(all_fseqs, (1..=400).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_inserts_of_one_fseq_admit_exactly_one() {
    let env = TestEnv::new("V00001");
    let queue = env.queue("V00001").await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        let env = env.clone();
        tasks.push(tokio::spawn(async move {
            let agent = env.agent("Frontend").await;
            let result =
                tapeq::queue_retrieve_requests(&queue, &agent, vec![request_fixture(7, 10)]).await;
            agent.retire().await.unwrap();
            result
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(ids) => accepted += ids.len(),
            Err(SchedulerError::DuplicateFseq { fseq, .. }) => assert_eq!(fseq, 7),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(queue.statistics().await.unwrap().jobs, 1);

    let requests = env
        .store
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.starts_with("RetrieveRequest-"))
        .count();
    assert_eq!(requests, 1);
}
