//! File backend: routes in an APISIX standalone `apisix.yaml`.
//!
//! The whole document is read, modified and rewritten under one
//! process-wide lock, whichever service an operation targets.  The file is
//! rewritten in place unless `atomic_write` is enabled, in which case a
//! sibling temporary file is renamed over it.  A deregistration that
//! matches no endpoint leaves the file untouched.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::Registry;
use crate::config::ApisixYamlConfig;
use crate::error::{RegistryError, Result};
use crate::labels;
use crate::route::build_route;
use crate::types::{Container, NodeSet, Removal, Route, RouteEntry};

/// Marker APISIX expects at the end of a standalone config file.
const END_MARKER: &str = "#END";

/// Top-level layout of `apisix.yaml`. Only `routes` is managed; every other
/// key, and every route we cannot manage, is written back as read.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_yaml::Value>,
}

pub struct FileRegistry {
    config: Option<ApisixYamlConfig>,
    lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(config: Option<ApisixYamlConfig>) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    fn config(&self) -> Result<&ApisixYamlConfig> {
        match &self.config {
            Some(config) if !config.path.as_os_str().is_empty() => Ok(config),
            _ => Err(RegistryError::Config(
                "apisix_yaml.path could not be empty".into(),
            )),
        }
    }
}

/// Reads the document. A file that does not exist yet, or holds nothing but
/// comments, is an empty document.
pub async fn read_document(path: &Path) -> Result<Document> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Document::default()),
        Err(e) => return Err(e.into()),
    };

    let blank = raw.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    });
    if blank {
        return Ok(Document::default());
    }

    Ok(serde_yaml::from_str(&raw)?)
}

async fn write_document(config: &ApisixYamlConfig, document: &Document) -> Result<()> {
    let body = serde_yaml::to_string(document)?;
    let content = format!("{}\n{}\n", body, END_MARKER);

    if !config.atomic_write {
        tokio::fs::write(&config.path, content).await?;
        return Ok(());
    }

    let tmp = temp_path(&config.path);
    tokio::fs::write(&tmp, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &config.path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".turu-tmp");
    PathBuf::from(tmp)
}

/// Merges `route` into `entries`: union into the first route with the same
/// id, folding any later duplicates of that id into it, or append.
///
/// Fails with [`RegistryError::Unmanaged`] when an entry with that id has a
/// shape we cannot merge into.
fn upsert(entries: Vec<RouteEntry>, route: Route, nodes: &NodeSet) -> Result<Vec<RouteEntry>> {
    let mut merged: Vec<RouteEntry> = Vec::with_capacity(entries.len() + 1);
    let mut target: Option<usize> = None;

    for entry in entries {
        let same_id = entry.id() == Some(route.id.as_str());
        let existing = match entry {
            RouteEntry::Managed(existing) if same_id => existing,
            RouteEntry::Foreign(_) if same_id => {
                return Err(RegistryError::Unmanaged(route.id));
            }
            other => {
                merged.push(other);
                continue;
            }
        };
        match target {
            None => {
                target = Some(merged.len());
                merged.push(RouteEntry::Managed(existing));
            }
            Some(i) => {
                if let (RouteEntry::Managed(first), Some(duplicate)) =
                    (&mut merged[i], existing.nodes())
                {
                    first.merge_nodes(duplicate);
                }
            }
        }
    }

    match target {
        Some(i) => {
            if let RouteEntry::Managed(first) = &mut merged[i] {
                first.merge_nodes(nodes);
            }
        }
        None => merged.push(RouteEntry::Managed(route)),
    }
    Ok(merged)
}

#[async_trait]
impl Registry for FileRegistry {
    async fn construct(&self) -> Result<()> {
        self.config().map(|_| ())
    }

    async fn register(&self, container: &Container) -> Result<()> {
        let config = self.config()?;
        let route = build_route(container)?;
        let nodes = match route.nodes() {
            Some(nodes) if !nodes.is_empty() => nodes.clone(),
            _ => {
                debug!("route {} has no exposed endpoints, nothing to register", route.id);
                return Ok(());
            }
        };

        debug!(
            "registering {} for route {}",
            nodes.endpoints().collect::<Vec<_>>().join(", "),
            route.id
        );

        let _guard = self.lock.lock().await;
        let mut document = read_document(&config.path).await?;
        let routes = std::mem::take(&mut document.routes);
        document.routes = upsert(routes, route, &nodes)?;
        write_document(config, &document).await
    }

    async fn deregister(&self, container: &Container) -> Result<()> {
        let config = self.config()?;
        let identity = labels::identity(container);
        let endpoints = labels::endpoints(&identity.name, container);

        let _guard = self.lock.lock().await;
        let mut document = read_document(&config.path).await?;
        let mut changed = false;
        document.routes.retain_mut(|entry| match entry {
            RouteEntry::Managed(route) => {
                let removal = route.remove_nodes(&endpoints);
                changed |= removal.changed();
                removal != Removal::Emptied
            }
            RouteEntry::Foreign(_) => true,
        });

        if !changed {
            debug!("no route holds an endpoint of {}, file left as is", identity.name);
            return Ok(());
        }
        write_document(config, &document).await
    }
}
