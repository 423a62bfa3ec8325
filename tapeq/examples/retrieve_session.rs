//! Retrieve session example: queue requests, drain them through a mount, and
//! let a background collector recover a crashed mount's jobs.
//!
//! Uses the in-memory backend and the test doubles from tapeq-testkit.

use std::sync::Arc;
use std::time::Duration;

use tapeq::{MountConfig, ShutdownToken, spawn_collector, spawn_heartbeat};
use tapeq_testkit::{TestEnv, disk_system, request_fixture, requests_on_disk_system};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = TestEnv::new("V00001");
    env.catalogue.add_disk_system(disk_system("buffer", 1_000));
    env.free_space.set("buffer", 1_500);

    let mut requests = requests_on_disk_system(1..=6, 200, "buffer");
    requests.extend((7..=10).map(|fseq| request_fixture(fseq, 200)));
    env.queue_requests("V00001", requests).await;
    println!("[QUEUE] {:?}", env.queue("V00001").await.statistics().await?);

    // First mount: pops a batch and crashes without reporting.
    let crashed = env.mount("V00001", 1, MountConfig::default()).await;
    crashed.start_session().await?;
    let batch = crashed.get_next_job_batch(4, u64::MAX).await?;
    println!("[MOUNT 1] popped {} jobs, then crashed", batch.len());
    crashed.abort();
    crashed.finish().await?;

    // A collector running in the background puts the jobs back.
    let shutdown = ShutdownToken::new();
    let collector = Arc::new(env.collector(Duration::from_secs(60)).await);
    let heartbeat = spawn_heartbeat(
        collector.agent().clone(),
        Duration::from_millis(500),
        shutdown.clone(),
    );
    let (collector_task, mut reports) =
        spawn_collector(collector, Duration::from_millis(200), shutdown.clone());
    let report = reports
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("collector stopped"))??;
    println!("[GC] {report:?}");

    // Second mount drains the queue.
    let mount = env.mount("V00001", 2, MountConfig::default()).await;
    mount.start_session().await?;
    loop {
        let batch = mount.get_next_job_batch(3, 1_000).await?;
        if batch.is_empty() {
            break;
        }
        let fseqs: Vec<u64> = batch.iter().map(|j| j.job.fseq).collect();
        println!("[MOUNT 2] batch {fseqs:?}");
        let flushed = mount.flush_async_success_reports(&batch).await?;
        println!("[MOUNT 2] flushed {flushed:?}");
    }
    println!("[MOUNT 2] full disk systems: {:?}", mount.full_disk_systems());
    println!("[QUEUE] {:?}", mount.queue().statistics().await?);

    mount.tape_complete();
    mount.disk_complete();
    mount.finish().await?;

    shutdown.cancel();
    heartbeat.await?;
    collector_task.await?;
    Ok(())
}
