use super::ContainerRuntime;
use crate::types::{Container, ContainerEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub struct DockerRuntime {
    sync_on_startup: bool,
}

impl DockerRuntime {
    pub fn new(sync_on_startup: bool) -> Self {
        Self { sync_on_startup }
    }

    async fn connect() -> Result<Docker> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux and DOCKER_HOST.
        Docker::connect_with_local_defaults().map_err(Into::into)
    }

    async fn inspect(docker: &Docker, id: &str) -> Result<Container> {
        let detail = docker.inspect_container(id, None).await?;
        Ok(container_from_inspect(detail))
    }

    /// Running containers, emitted as started events so routes missed while
    /// the registrator was down get registered.
    async fn get_initial_state(docker: &Docker) -> Result<Vec<Container>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = docker.list_containers(Some(opts)).await?;

        let mut running = Vec::with_capacity(containers.len());
        for c in containers {
            let Some(id) = c.id else {
                continue;
            };
            match Self::inspect(docker, &id).await {
                Ok(container) => running.push(container),
                Err(e) => warn!("Failed to inspect running container {}: {}", id, e),
            }
        }
        Ok(running)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> Result<()> {
        let mut synced = false;
        loop {
            let docker = match Self::connect().await {
                Ok(d) => d,
                Err(e) => {
                    error!("Failed to connect to Docker: {}. Retrying in 5s...", e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            // Initial scan
            if self.sync_on_startup && !synced {
                match Self::get_initial_state(&docker).await {
                    Ok(running) => {
                        info!("Initial scan found {} containers", running.len());
                        for container in running {
                            if event_tx.send(ContainerEvent::started(container)).await.is_err() {
                                return Err(anyhow!("Channel closed"));
                            }
                        }
                        synced = true;
                    }
                    Err(e) => {
                        error!("Failed initial scan: {}. Retrying...", e);
                        sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                }
            }

            // Event stream
            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["container"].as_slice()),
                    ("event", ["start", "kill"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = docker.events(Some(opts));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(event) => event,
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                };

                let Some(id) = event.actor.and_then(|actor| actor.id) else {
                    continue;
                };
                let action = event.action.unwrap_or_default();
                debug!("Container event: {} for {}", action, id);

                let wrap: fn(Container) -> ContainerEvent = match action.as_str() {
                    "start" => ContainerEvent::started,
                    "kill" => ContainerEvent::stopped,
                    _ => continue,
                };

                // Inspect to get labels and exposed ports
                match Self::inspect(&docker, &id).await {
                    Ok(container) => {
                        if event_tx.send(wrap(container)).await.is_err() {
                            error!("Failed to send {} event for {}", action, id);
                            return Err(anyhow!("Channel closed"));
                        }
                    }
                    Err(e) => {
                        error!("Failed to inspect container {} after {}: {}", id, action, e);
                    }
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

fn container_from_inspect(detail: ContainerInspectResponse) -> Container {
    let config = detail.config.unwrap_or_default();
    let mut exposed_ports: Vec<String> = config
        .exposed_ports
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    exposed_ports.sort();

    Container {
        id: detail.id.unwrap_or_default(),
        name: detail.name.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        exposed_ports,
    }
}
