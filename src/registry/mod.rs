//! Registry backends and the dispatcher that routes events to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

use crate::config::Config;
use crate::error::{RegistryError, Result};
use crate::labels;
use crate::types::{Container, ContainerEvent, EventKind};

pub mod etcd;
pub mod file;

pub use etcd::EtcdRegistry;
pub use file::FileRegistry;

/// Selector of the file backend.
pub const APISIX_YAML: &str = "apisix-yaml";
/// Selector of the distributed backend.
pub const APISIX_ETCD: &str = "apisix-etcd";

#[async_trait]
pub trait Registry: Send + Sync {
    /// Initializes backend resources. Idempotent; cheap once initialized.
    async fn construct(&self) -> Result<()>;

    /// Inserts the container's route, or merges its nodes into the
    /// existing route of the same service.
    async fn register(&self, container: &Container) -> Result<()>;

    /// Removes the container's endpoints from its service's route,
    /// deleting the route once no endpoint is left.
    async fn deregister(&self, container: &Container) -> Result<()>;
}

/// Result of handing an event to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Registered,
    Deregistered,
    /// The container opted out: no selector, unknown selector, or missing
    /// gateway labels.
    Skipped,
}

/// Maps backend selectors to backend instances.
pub struct Dispatcher {
    registries: HashMap<String, Arc<dyn Registry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            registries: HashMap::new(),
        }
    }

    /// Dispatcher with both APISIX backends. Backends without a
    /// configuration section are still selectable and fail on construct.
    pub fn from_config(config: &Config) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.insert(
            APISIX_YAML,
            Arc::new(FileRegistry::new(config.apisix_yaml.clone())),
        );
        dispatcher.insert(
            APISIX_ETCD,
            Arc::new(EtcdRegistry::new(config.apisix_etcd.clone())),
        );
        dispatcher
    }

    pub fn insert(&mut self, selector: impl Into<String>, registry: Arc<dyn Registry>) {
        self.registries.insert(selector.into(), registry);
    }

    /// Constructs the backend behind `selector` ahead of the first event.
    pub async fn construct(&self, selector: &str) -> Result<()> {
        match self.registries.get(selector) {
            Some(registry) => registry.construct().await,
            None => Err(RegistryError::Config(format!(
                "unknown registry backend {}",
                selector
            ))),
        }
    }

    /// Applies a lifecycle event to the backend the container selects.
    pub async fn dispatch(&self, event: &ContainerEvent) -> Result<Outcome> {
        let container = &event.container;
        let Some(selector) = labels::registry_selector(container) else {
            warn!(
                "{} {} ({}): no {} label, skipping registration",
                event.kind.as_str(),
                container.name,
                container.id,
                labels::REGISTRY
            );
            return Ok(Outcome::Skipped);
        };
        let Some(registry) = self.registries.get(selector) else {
            warn!(
                "{} {} ({}): invalid turu registry {:?}, skipping registration",
                event.kind.as_str(),
                container.name,
                container.id,
                selector
            );
            return Ok(Outcome::Skipped);
        };

        registry.construct().await?;
        let result = match event.kind {
            EventKind::Started => registry.register(container).await,
            EventKind::Stopped => registry.deregister(container).await,
        };

        match result {
            Ok(()) => {
                let (outcome, verb) = match event.kind {
                    EventKind::Started => (Outcome::Registered, "registered"),
                    EventKind::Stopped => (Outcome::Deregistered, "deregistered"),
                };
                info!(
                    "{} {} ({}): container successfully {} via {}",
                    event.kind.as_str(),
                    container.name,
                    container.id,
                    verb,
                    selector
                );
                Ok(outcome)
            }
            Err(RegistryError::NotEnabled(name)) => {
                warn!(
                    "{} {} ({}): {} has no {} label, skipping registration",
                    event.kind.as_str(),
                    container.name,
                    container.id,
                    name,
                    labels::GATEWAY_HOST
                );
                Ok(Outcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
