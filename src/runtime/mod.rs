use crate::types::ContainerEvent;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime {
    /// Start monitoring the runtime for container lifecycle changes.
    /// Events should be sent to the provided channel.
    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> Result<()>;
}
