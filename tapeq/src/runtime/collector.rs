use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::error::SchedulerError;
use crate::gc::{GarbageCollector, GcPassReport};

use super::ShutdownToken;

/// Outcome of one collector pass, as delivered by [`spawn_collector`].
pub type GcPassResult = Result<GcPassReport, SchedulerError>;

/// Run `collector` every `interval` until `shutdown` fires.
///
/// Each pass is reported on the returned channel. Reports are dropped, not
/// queued, while the receiver lags behind.
pub fn spawn_collector<B: Backend>(
    collector: Arc<GarbageCollector<B>>,
    interval: Duration,
    shutdown: ShutdownToken,
) -> (JoinHandle<()>, mpsc::Receiver<GcPassResult>) {
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(agent = %collector.agent().address(), "collector shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let result = collector.run_once().await;
                    match &result {
                        Ok(report) if report.dead_agents > 0 => {
                            tracing::info!(
                                dead_agents = report.dead_agents,
                                objects_collected = report.objects_collected,
                                objects_failed = report.objects_failed,
                                "garbage collection pass"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "garbage collection pass failed"),
                    }
                    if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(result) {
                        tracing::debug!("collector report receiver dropped");
                    }
                }
            }
        }
    });
    (handle, rx)
}
