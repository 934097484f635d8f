//! Label extraction and service identity derivation.
//!
//! Everything the registrator knows about a container comes from its
//! labels and exposed ports.  The helpers here are pure so both backends
//! derive identical names and endpoints for the same container.

use std::collections::HashMap;

use crate::types::Container;

pub const COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE: &str = "com.docker.compose.service";
pub const SERVICE: &str = "turu.service";
pub const REGISTRY: &str = "turu.registry";

/// Namespace of the gateway labels.
pub const GATEWAY_PREFIX: &str = "turu.apisix.";
pub const GATEWAY_HOST: &str = "turu.apisix.host";
pub const GATEWAY_URI: &str = "turu.apisix.uri";

/// Gateway labels of a container, keyed by their full label name.
pub type GatewayLabels = HashMap<String, String>;

/// Returns every label under [`GATEWAY_PREFIX`], in original casing.
pub fn extract_gateway_labels(container: &Container) -> GatewayLabels {
    container
        .labels
        .iter()
        .filter(|(k, _)| k.starts_with(GATEWAY_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Container name and service identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Host part of every endpoint this container contributes.
    pub name: String,
    /// Key of the route the container belongs to.
    pub service: String,
}

/// Derives the container name and service identity.
///
/// Compose projects name both `{project}-{service}` and ignore the
/// `turu.service` override. Otherwise the name is the container name
/// without its leading `/`, and the service defaults to it.
pub fn identity(container: &Container) -> Identity {
    let labels = &container.labels;
    if let Some(project) = labels.get(COMPOSE_PROJECT) {
        let compose_service = labels.get(COMPOSE_SERVICE).map(String::as_str).unwrap_or("");
        let name = format!("{}-{}", project, compose_service);
        return Identity {
            service: name.clone(),
            name,
        };
    }

    let name = container
        .name
        .strip_prefix('/')
        .unwrap_or(&container.name)
        .to_string();
    let service = labels.get(SERVICE).cloned().unwrap_or_else(|| name.clone());
    Identity { name, service }
}

/// Backend selector label, if present.
pub fn registry_selector(container: &Container) -> Option<&str> {
    container.labels.get(REGISTRY).map(String::as_str)
}

/// `{name}:{port}` for every exposed port. Port keys carry the protocol
/// (`8080/tcp`), which is dropped; keys without a port number are skipped.
pub fn endpoints(name: &str, container: &Container) -> Vec<String> {
    container
        .exposed_ports
        .iter()
        .filter_map(|key| {
            let port = key.split('/').next().unwrap_or("").trim();
            if port.is_empty() {
                None
            } else {
                Some(format!("{}:{}", name, port))
            }
        })
        .collect()
}
