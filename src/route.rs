//! Builds the gateway route for a container.

use std::collections::BTreeMap;

use crate::error::{RegistryError, Result};
use crate::labels::{self, GATEWAY_HOST, GATEWAY_URI};
use crate::types::{Container, NodeSet, Route, Upstream, DEFAULT_URI};

/// Builds the canonical route for `container`.
///
/// Fails with [`RegistryError::NotEnabled`] when the host label is absent.
/// A container without exposed ports still yields a route, with an empty
/// node set.
pub fn build_route(container: &Container) -> Result<Route> {
    let gateway = labels::extract_gateway_labels(container);
    let identity = labels::identity(container);

    let host = gateway
        .get(GATEWAY_HOST)
        .cloned()
        .ok_or_else(|| RegistryError::NotEnabled(identity.name.clone()))?;
    let uri = gateway
        .get(GATEWAY_URI)
        .cloned()
        .unwrap_or_else(|| DEFAULT_URI.to_string());

    let nodes = NodeSet::from_endpoints(labels::endpoints(&identity.name, container));
    let now = chrono::Utc::now().timestamp();

    Ok(Route {
        id: identity.service.clone(),
        create_time: Some(now),
        update_time: Some(now),
        name: Some(identity.service),
        uri: Some(uri),
        host: Some(host),
        status: Some(1),
        upstream: Some(Upstream::round_robin(nodes)),
        extra: BTreeMap::new(),
    })
}
