use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::agent::AgentHandle;
use crate::backend::Backend;
use crate::catalogue::Catalogue;
use crate::config::MountConfig;
use crate::disk_space::FreeSpaceSource;
use crate::error::{Result, SchedulerError};
use crate::queue::RetrieveQueue;

use super::{MountInfo, RetrieveMount};

/// Builder for a [`RetrieveMount`] with explicit collaborators.
///
/// Every component except the configuration must be set before
/// [`build`](Self::build).
///
/// # Example
///
/// ```ignore
/// let mount = RetrieveMount::builder()
///     .with_info(info)
///     .with_queue(queue)
///     .with_agent(agent)
///     .with_catalogue(catalogue)
///     .with_free_space(free_space)
///     .build()?;
/// ```
pub struct RetrieveMountBuilder<B> {
    info: Option<MountInfo>,
    config: MountConfig,
    queue: Option<RetrieveQueue<B>>,
    agent: Option<AgentHandle<B>>,
    catalogue: Option<Arc<dyn Catalogue>>,
    free_space: Option<Arc<dyn FreeSpaceSource>>,
}

impl<B> fmt::Debug for RetrieveMountBuilder<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RetrieveMountBuilder");
        debug.field("info", &self.info);
        debug.field("config", &self.config);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("agent_set", &self.agent.is_some());
        debug.field("catalogue_set", &self.catalogue.is_some());
        debug.field("free_space_set", &self.free_space.is_some());

        if self.queue.is_some() {
            debug.field("backend_type", &type_name::<B>());
        }

        debug.finish()
    }
}

impl<B> Default for RetrieveMountBuilder<B> {
    fn default() -> Self {
        Self {
            info: None,
            config: MountConfig::default(),
            queue: None,
            agent: None,
            catalogue: None,
            free_space: None,
        }
    }
}

impl<B: Backend> RetrieveMountBuilder<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mounted tape and drive description.
    pub fn with_info(mut self, info: MountInfo) -> Self {
        self.info = Some(info);
        self
    }

    /// Override the default retry and batching limits.
    pub fn with_config(mut self, config: MountConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the queue of the mounted tape.
    pub fn with_queue(mut self, queue: RetrieveQueue<B>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the agent that will own popped jobs.
    pub fn with_agent(mut self, agent: AgentHandle<B>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_catalogue(mut self, catalogue: Arc<dyn Catalogue>) -> Self {
        self.catalogue = Some(catalogue);
        self
    }

    pub fn with_free_space(mut self, free_space: Arc<dyn FreeSpaceSource>) -> Self {
        self.free_space = Some(free_space);
        self
    }

    /// Build the mount.
    ///
    /// # Errors
    ///
    /// `MissingComponent` if a component was not set.
    pub fn build(self) -> Result<RetrieveMount<B>> {
        let info = self.info.ok_or(SchedulerError::MissingComponent("mount info"))?;
        let queue = self.queue.ok_or(SchedulerError::MissingComponent("queue"))?;
        let agent = self.agent.ok_or(SchedulerError::MissingComponent("agent"))?;
        let catalogue = self
            .catalogue
            .ok_or(SchedulerError::MissingComponent("catalogue"))?;
        let free_space = self
            .free_space
            .ok_or(SchedulerError::MissingComponent("free space source"))?;

        if queue.vid() != info.vid {
            tracing::warn!(
                mount_vid = %info.vid,
                queue_vid = %queue.vid(),
                "mount and queue disagree on the tape"
            );
        }

        Ok(RetrieveMount::new(
            info,
            self.config,
            queue,
            agent,
            catalogue,
            free_space,
        ))
    }
}
