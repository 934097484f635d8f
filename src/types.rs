//! Data structures used throughout the registrator.
//!
//! [`Container`] and [`ContainerEvent`] describe what the container
//! runtime reports.  [`Route`], [`Upstream`] and [`NodeSet`] describe what
//! gets persisted to the gateway, and are serialised with
//! [`serde`](https://serde.rs/) in the shape APISIX reads from its
//! standalone YAML file and from etcd.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Load balancing policy written on every upstream we create.
pub const ROUND_ROBIN: &str = "roundrobin";

/// Path rule used when a container does not carry a URI label.
pub const DEFAULT_URI: &str = "/*";

/// Weight given to every endpoint.
pub const DEFAULT_WEIGHT: u32 = 1;

/// The subset of container metadata the registrator needs.
///
/// Built from an inspect response by the runtime adapter so the
/// registration logic never depends on a particular runtime client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub id: String,
    /// Raw container name as reported by the runtime, e.g. `/web-1`.
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Exposed port keys such as `8080/tcp`.
    pub exposed_ports: Vec<String>,
}

/// Lifecycle transitions the registrator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Stopped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "container-start",
            EventKind::Stopped => "container-kill",
        }
    }
}

/// A lifecycle notification together with the inspected container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEvent {
    pub kind: EventKind,
    pub container: Container,
}

impl ContainerEvent {
    pub fn started(container: Container) -> Self {
        Self {
            kind: EventKind::Started,
            container,
        }
    }

    pub fn stopped(container: Container) -> Self {
        Self {
            kind: EventKind::Stopped,
            container,
        }
    }
}

/// Endpoint (`host:port`) to weight mapping of an upstream.
///
/// Keys are unique; merging two sets is a shallow union where the
/// incoming weight wins for keys present in both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSet(BTreeMap<String, u32>);

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set giving every endpoint the default weight. Empty
    /// endpoint strings are skipped.
    pub fn from_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes = Self::new();
        for endpoint in endpoints {
            let endpoint = endpoint.into();
            if !endpoint.is_empty() {
                nodes.insert(endpoint, DEFAULT_WEIGHT);
            }
        }
        nodes
    }

    pub fn insert(&mut self, endpoint: impl Into<String>, weight: u32) {
        self.0.insert(endpoint.into(), weight);
    }

    /// Adds every entry of `other`, overwriting weights of shared keys and
    /// keeping all other existing entries.
    pub fn union(&mut self, other: &NodeSet) {
        for (endpoint, weight) in &other.0 {
            self.0.insert(endpoint.clone(), *weight);
        }
    }

    /// Removes exactly the given endpoints.
    pub fn subtract<'a, I>(&mut self, endpoints: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for endpoint in endpoints {
            self.0.remove(endpoint);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[cfg(test)]
impl NodeSet {
    pub fn contains(&self, endpoint: &str) -> bool {
        self.0.contains_key(endpoint)
    }

    pub fn weight(&self, endpoint: &str) -> Option<u32> {
        self.0.get(endpoint).copied()
    }
}

/// Load balancing unit backing a route.
///
/// Every field is optional so an upstream read back from the gateway is
/// written out with exactly the keys it had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub balancer: Option<String>,
    /// Map-form nodes. Upstreams using discovery instead have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeSet>,
    /// Fields we do not manage (timeouts, checks, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Upstream {
    pub fn round_robin(nodes: NodeSet) -> Self {
        Self {
            balancer: Some(ROUND_ROBIN.to_string()),
            nodes: Some(nodes),
            extra: BTreeMap::new(),
        }
    }
}

/// A gateway route keyed by service identity.
///
/// Only `id` is required. Optional fields that were absent when the route
/// was read stay absent when it is written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    /// Fields we do not manage (plugins, labels, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// What removing endpoints did to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// No endpoint matched; the route is unchanged.
    Untouched,
    /// Some endpoints were removed and some remain.
    Reduced,
    /// The node set is empty; the route must be deleted.
    Emptied,
}

impl Removal {
    pub fn changed(&self) -> bool {
        *self != Removal::Untouched
    }
}

impl Route {
    /// Map-form node set of the inline upstream, if any.
    pub fn nodes(&self) -> Option<&NodeSet> {
        self.upstream.as_ref().and_then(|u| u.nodes.as_ref())
    }

    /// Shallow union of `nodes` into this route's upstream.
    ///
    /// A route without an inline upstream gets a round-robin one.
    pub fn merge_nodes(&mut self, nodes: &NodeSet) {
        match self.upstream.as_mut() {
            Some(upstream) => match upstream.nodes.as_mut() {
                Some(current) => current.union(nodes),
                None => upstream.nodes = Some(nodes.clone()),
            },
            None => self.upstream = Some(Upstream::round_robin(nodes.clone())),
        }
        self.touch();
    }

    /// Removes `endpoints` from the map-form node set. Routes without one
    /// (shared upstream, discovery) are always [`Removal::Untouched`].
    pub fn remove_nodes(&mut self, endpoints: &[String]) -> Removal {
        let Some(nodes) = self.upstream.as_mut().and_then(|u| u.nodes.as_mut()) else {
            return Removal::Untouched;
        };
        let before = nodes.len();
        nodes.subtract(endpoints.iter().map(String::as_str));
        let removal = if nodes.is_empty() {
            Removal::Emptied
        } else if nodes.len() != before {
            Removal::Reduced
        } else {
            Removal::Untouched
        };
        if removal.changed() {
            self.touch();
        }
        removal
    }

    pub fn touch(&mut self) {
        self.update_time = Some(chrono::Utc::now().timestamp());
    }
}

/// A stored route as read from a backend.
///
/// Routes without a string `id`, or whose upstream lists nodes in a form
/// other than an endpoint map, are kept as raw values and written back as
/// read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteEntry {
    Managed(Route),
    Foreign(serde_json::Value),
}

impl RouteEntry {
    /// The entry's string id, whether or not we manage its shape.
    pub fn id(&self) -> Option<&str> {
        match self {
            RouteEntry::Managed(route) => Some(route.id.as_str()),
            RouteEntry::Foreign(value) => value.get("id").and_then(|id| id.as_str()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(endpoints: &[&str]) -> NodeSet {
        NodeSet::from_endpoints(endpoints.iter().copied())
    }

    #[test]
    fn union_keeps_existing_and_overwrites_shared() {
        let mut current = nodes(&["a:80", "b:80"]);
        current.insert("b:80", 5);
        current.union(&nodes(&["b:80", "c:80"]));

        assert_eq!(current.len(), 3);
        assert_eq!(current.weight("a:80"), Some(1));
        assert_eq!(current.weight("b:80"), Some(1));
        assert!(current.contains("c:80"));
    }

    #[test]
    fn union_is_idempotent() {
        let mut current = nodes(&["a:80"]);
        current.union(&nodes(&["a:80"]));
        current.union(&nodes(&["a:80"]));
        assert_eq!(current, nodes(&["a:80"]));
    }

    #[test]
    fn subtract_removes_only_given_keys() {
        let mut current = nodes(&["a:80", "b:80", "c:80"]);
        current.subtract(["b:80", "zz:1"]);
        assert_eq!(current, nodes(&["a:80", "c:80"]));

        current.subtract(["a:80", "c:80"]);
        assert!(current.is_empty());
    }

    #[test]
    fn from_endpoints_skips_empty_strings() {
        let set = nodes(&["", "a:80"]);
        assert_eq!(set.len(), 1);
    }

    fn web_route(endpoints: &[&str]) -> Route {
        Route {
            id: "web".into(),
            create_time: Some(1),
            update_time: Some(1),
            name: Some("web".into()),
            uri: Some(DEFAULT_URI.into()),
            host: Some("example.com".into()),
            status: Some(1),
            upstream: Some(Upstream::round_robin(nodes(endpoints))),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn remove_nodes_reports_what_changed() {
        let mut route = web_route(&["web-1:80", "web-2:80"]);

        assert_eq!(route.remove_nodes(&["other:80".to_string()]), Removal::Untouched);
        assert_eq!(route.update_time, Some(1));
        assert_eq!(route.remove_nodes(&["web-1:80".to_string()]), Removal::Reduced);
        assert!(route.update_time > Some(1));
        assert_eq!(route.remove_nodes(&["web-2:80".to_string()]), Removal::Emptied);
    }

    #[test]
    fn route_without_inline_upstream_is_untouched() {
        let mut route: Route =
            serde_json::from_str(r#"{"id":"shared","uri":"/x","upstream_id":"1"}"#).unwrap();
        assert_eq!(route.remove_nodes(&["a:80".to_string()]), Removal::Untouched);
        assert_eq!(route.extra.get("upstream_id"), Some(&serde_json::json!("1")));

        route.merge_nodes(&nodes(&["a:80"]));
        assert_eq!(route.nodes().map(NodeSet::len), Some(1));
    }

    #[test]
    fn discovery_upstream_is_never_emptied() {
        let mut route: Route = serde_json::from_str(
            r#"{"id":"svc","upstream":{"service_name":"svc","discovery_type":"dns"}}"#,
        )
        .unwrap();
        assert_eq!(route.remove_nodes(&["a:80".to_string()]), Removal::Untouched);
    }

    #[test]
    fn absent_fields_stay_absent() {
        let raw = serde_json::json!({"id": "web", "uris": ["/a", "/b"], "upstream": {"nodes": {"a:80": 1}}});
        let route: Route = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&route).unwrap(), raw);
    }

    #[test]
    fn unmanaged_shapes_are_kept_raw() {
        let no_id = serde_json::json!({"uri": "/hello", "upstream_id": 1});
        let list_nodes = serde_json::json!({
            "id": "legacy",
            "upstream": {"type": "roundrobin", "nodes": [{"host": "10.0.0.1", "port": 80, "weight": 1}]}
        });
        let numeric_id = serde_json::json!({"id": 1, "upstream": {"nodes": {"a:80": 1}}});

        for raw in [&no_id, &list_nodes, &numeric_id] {
            let entry: RouteEntry = serde_json::from_value(raw.clone()).unwrap();
            assert_eq!(entry, RouteEntry::Foreign(raw.clone()));
            assert_eq!(serde_json::to_value(&entry).unwrap(), *raw);
        }

        let entry: RouteEntry = serde_json::from_value(list_nodes).unwrap();
        assert_eq!(entry.id(), Some("legacy"));

        let entry: RouteEntry =
            serde_json::from_value(serde_json::json!({"id": "web", "upstream": {"nodes": {"a:80": 1}}}))
                .unwrap();
        assert!(matches!(entry, RouteEntry::Managed(_)));
    }

    #[test]
    fn route_serialises_in_gateway_shape() {
        let mut route = web_route(&["web:8080"]);
        route.create_time = Some(10);
        route.update_time = Some(20);
        route.uri = Some("/api".into());
        route.host = Some("api.example.com".into());

        let value = serde_json::to_value(&route).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "web",
                "create_time": 10,
                "update_time": 20,
                "name": "web",
                "uri": "/api",
                "host": "api.example.com",
                "status": 1,
                "upstream": {"type": "roundrobin", "nodes": {"web:8080": 1}}
            })
        );
    }
}
