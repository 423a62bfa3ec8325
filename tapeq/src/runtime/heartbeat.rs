use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agent::AgentHandle;
use crate::backend::Backend;

use super::ShutdownToken;

/// Bump `agent`'s heartbeat every `interval` until `shutdown` fires.
///
/// Failed beats are logged; enough of them in a row and collectors will
/// declare the agent dead.
pub fn spawn_heartbeat<B: Backend>(
    agent: AgentHandle<B>,
    interval: Duration,
    shutdown: ShutdownToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(agent = %agent.address(), "heartbeat shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = agent.heartbeat().await {
                        tracing::warn!(agent = %agent.address(), error = %err, "heartbeat failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentContent;
    use crate::backend::InMemoryBackend;
    use crate::config::{AgentConfig, BackendConfig};
    use crate::object::ObjectStore;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_advances_until_shutdown() {
        let store = ObjectStore::new(
            Arc::new(InMemoryBackend::new()),
            &BackendConfig::default(),
        );
        let agent = AgentHandle::register(store.clone(), "Test", &AgentConfig::default())
            .await
            .unwrap();
        let shutdown = ShutdownToken::new();
        let handle = spawn_heartbeat(agent.clone(), Duration::from_secs(1), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let beats = store
            .fetch::<AgentContent>(agent.address())
            .await
            .unwrap()
            .payload
            .heartbeat;
        assert!(beats >= 3, "expected at least 3 beats, got {beats}");
    }
}
