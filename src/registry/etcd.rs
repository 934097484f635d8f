//! Distributed backend: one route per key in the etcd cluster APISIX reads.
//!
//! Every operation runs under a lock scoped to its kind and service, so two
//! registrations (or two deregistrations) of one service never interleave.
//! A registration and a deregistration of the same service use different
//! locks and are not serialized against each other.
//!
//! Locks are non-blocking: when another session holds the lock the
//! operation fails with [`RegistryError::LockContention`] without touching
//! the route.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, Identity, PutOptions, TlsOptions,
    Txn, TxnOp,
};
use log::{debug, info, warn};
use tokio::sync::OnceCell;

use super::Registry;
use crate::config::{ApisixEtcdConfig, MtlsConfig};
use crate::error::{RegistryError, Result};
use crate::labels;
use crate::route::build_route;
use crate::types::{Container, NodeSet, Removal, Route, RouteEntry};

/// Lease backing a lock session.
pub type SessionId = i64;

const DEFAULT_KEY_PREFIX: &str = "/apisix";

/// Key-value primitives the distributed backend needs.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Opens a session; locks taken in it live until it is closed.
    async fn open_session(&self) -> Result<SessionId>;
    /// Takes `name` for `session` if nobody holds it. Never waits.
    async fn try_lock(&self, session: SessionId, name: &str) -> Result<bool>;
    /// Closes the session, releasing every lock it holds.
    async fn close_session(&self, session: SessionId) -> Result<()>;
}

/// Which lock namespace an operation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Create,
    Remove,
}

impl LockKind {
    fn as_str(&self) -> &'static str {
        match self {
            LockKind::Create => "create",
            LockKind::Remove => "remove",
        }
    }
}

pub fn lock_name(kind: LockKind, service: &str) -> String {
    format!("/turu/locks/{}/{}", kind.as_str(), service)
}

/// [`KvStore`] over an etcd v3 cluster. Locks are keys created only if
/// absent and attached to the session lease, so revoking the lease
/// releases them.
pub struct EtcdStore {
    client: Client,
    lock_ttl_secs: i64,
}

impl EtcdStore {
    pub async fn connect(config: &ApisixEtcdConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(username.clone(), password.clone());
        }
        if let Some(mtls) = &config.mtls {
            options = options.with_tls(tls_options(mtls)?);
        }

        let client = Client::connect(&config.endpoints, Some(options)).await?;
        Ok(Self {
            client,
            lock_ttl_secs: config.lock_ttl_secs,
        })
    }
}

fn tls_options(mtls: &MtlsConfig) -> Result<TlsOptions> {
    let read = |path: &std::path::Path| {
        std::fs::read(path).map_err(|e| {
            RegistryError::Config(format!("reading {}: {}", path.display(), e))
        })
    };
    let ca = read(&mtls.ca)?;
    let cert = read(&mtls.cert)?;
    let key = read(&mtls.key)?;

    Ok(TlsOptions::new()
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key)))
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn open_session(&self) -> Result<SessionId> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(self.lock_ttl_secs, None).await?;
        Ok(lease.id())
    }

    async fn try_lock(&self, session: SessionId, name: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(name, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                name,
                session.to_string(),
                Some(PutOptions::new().with_lease(session)),
            )]);
        let response = client.txn(txn).await?;
        Ok(response.succeeded())
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(session).await?;
        Ok(())
    }
}

pub struct EtcdRegistry {
    config: Option<ApisixEtcdConfig>,
    key_prefix: String,
    store: OnceCell<Arc<dyn KvStore>>,
}

impl EtcdRegistry {
    /// Registry connecting to etcd on first `construct`.
    pub fn new(config: Option<ApisixEtcdConfig>) -> Self {
        let key_prefix = config
            .as_ref()
            .map(|c| c.key_prefix.clone())
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        Self {
            config,
            key_prefix,
            store: OnceCell::new(),
        }
    }

    /// Registry over an already constructed store.
    #[cfg(test)]
    pub fn with_store(store: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            config: None,
            key_prefix: key_prefix.into(),
            store: OnceCell::new_with(Some(store)),
        }
    }

    pub fn route_key(&self, service: &str) -> String {
        format!("{}/routes/{}", self.key_prefix.trim_end_matches('/'), service)
    }

    fn store(&self) -> Result<&dyn KvStore> {
        self.store
            .get()
            .map(|store| &**store)
            .ok_or_else(|| RegistryError::Config("etcd registry is not constructed".into()))
    }
}

async fn connect_store(config: Option<&ApisixEtcdConfig>) -> Result<Arc<dyn KvStore>> {
    let config =
        config.ok_or_else(|| RegistryError::Config("apisix_etcd is not configured".into()))?;
    if config.endpoints.is_empty() {
        return Err(RegistryError::Config(
            "apisix_etcd.endpoints could not be empty".into(),
        ));
    }
    let store = EtcdStore::connect(config).await?;
    info!("Connected to etcd at {:?}", config.endpoints);
    Ok(Arc::new(store))
}

/// Runs `op` while holding `lock` in a fresh session. The session is closed
/// whether `op` succeeds or not; `op` never runs when the lock is taken.
async fn with_lock<T, F>(store: &dyn KvStore, lock: &str, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let session = store.open_session().await?;
    let result = match store.try_lock(session, lock).await {
        Ok(true) => op.await,
        Ok(false) => Err(RegistryError::LockContention(lock.to_string())),
        Err(e) => Err(e),
    };

    if let Err(e) = store.close_session(session).await {
        warn!("failed to close lock session {} for {}: {}", session, lock, e);
    }
    result
}

async fn merge_route(store: &dyn KvStore, key: &str, route: Route, nodes: &NodeSet) -> Result<()> {
    let merged = match store.get(key).await? {
        None => route,
        Some(raw) => match serde_json::from_slice::<RouteEntry>(&raw)? {
            RouteEntry::Managed(mut current) => {
                current.merge_nodes(nodes);
                current
            }
            RouteEntry::Foreign(_) => return Err(RegistryError::Unmanaged(route.id)),
        },
    };
    store.put(key, serde_json::to_vec(&merged)?).await
}

async fn remove_endpoints(
    store: &dyn KvStore,
    key: &str,
    service: &str,
    endpoints: &[String],
) -> Result<()> {
    let raw = store
        .get(key)
        .await?
        .ok_or_else(|| RegistryError::NotFound(service.to_string()))?;
    let mut current = match serde_json::from_slice::<RouteEntry>(&raw)? {
        RouteEntry::Managed(current) => current,
        RouteEntry::Foreign(_) => {
            debug!("route {} at {} is not managed, left as is", service, key);
            return Ok(());
        }
    };

    match current.remove_nodes(endpoints) {
        Removal::Untouched => Ok(()),
        Removal::Reduced => store.put(key, serde_json::to_vec(&current)?).await,
        Removal::Emptied => {
            debug!("route {} has no nodes left, deleting {}", service, key);
            store.delete(key).await
        }
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn construct(&self) -> Result<()> {
        self.store
            .get_or_try_init(|| connect_store(self.config.as_ref()))
            .await?;
        Ok(())
    }

    async fn register(&self, container: &Container) -> Result<()> {
        let store = self.store()?;
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

        let key = self.route_key(&route.id);
        let lock = lock_name(LockKind::Create, &route.id);
        with_lock(store, &lock, merge_route(store, &key, route, &nodes)).await
    }

    async fn deregister(&self, container: &Container) -> Result<()> {
        let store = self.store()?;
        let identity = labels::identity(container);
        let endpoints = labels::endpoints(&identity.name, container);

        let key = self.route_key(&identity.service);
        let lock = lock_name(LockKind::Remove, &identity.service);
        with_lock(
            store,
            &lock,
            remove_endpoints(store, &key, &identity.service, &endpoints),
        )
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::labels::{GATEWAY_HOST, SERVICE};
    use crate::types::testing::container;

    fn registry() -> (EtcdRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let registry = EtcdRegistry::with_store(store.clone(), "/apisix");
        (registry, store)
    }

    fn web(name: &str, ports: &[&str]) -> Container {
        container(
            name,
            &[(GATEWAY_HOST, "web.example.com"), (SERVICE, "web")],
            ports,
        )
    }

    fn stored(store: &MemoryStore, key: &str) -> Option<Route> {
        store
            .value(key)
            .map(|raw| serde_json::from_slice(&raw).unwrap())
    }

    fn endpoints(route: &Route) -> Vec<String> {
        route
            .nodes()
            .unwrap()
            .endpoints()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn keys_and_locks_are_per_service() {
        let (registry, _) = registry();
        assert_eq!(registry.route_key("web"), "/apisix/routes/web");
        assert_eq!(
            EtcdRegistry::with_store(Arc::new(MemoryStore::default()), "/gw/").route_key("web"),
            "/gw/routes/web"
        );
        assert_eq!(lock_name(LockKind::Create, "web"), "/turu/locks/create/web");
        assert_eq!(lock_name(LockKind::Remove, "web"), "/turu/locks/remove/web");
    }

    #[tokio::test]
    async fn register_writes_new_route() {
        let (registry, store) = registry();
        registry.construct().await.unwrap();

        registry.register(&web("/web-1", &["8080/tcp"])).await.unwrap();

        let route = stored(&store, "/apisix/routes/web").unwrap();
        assert_eq!(route.id, "web");
        assert_eq!(route.host.as_deref(), Some("web.example.com"));
        assert_eq!(endpoints(&route), vec!["web-1:8080"]);
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn register_merges_and_is_idempotent() {
        let (registry, store) = registry();

        registry.register(&web("/web-1", &["80/tcp"])).await.unwrap();
        registry.register(&web("/web-2", &["80/tcp"])).await.unwrap();
        registry.register(&web("/web-2", &["80/tcp"])).await.unwrap();

        let route = stored(&store, "/apisix/routes/web").unwrap();
        assert_eq!(endpoints(&route), vec!["web-1:80", "web-2:80"]);
    }

    #[tokio::test]
    async fn register_keeps_existing_route_fields() {
        let (registry, store) = registry();
        store
            .put(
                "/apisix/routes/web",
                br#"{"id":"web","uri":"/v1/*","host":"old.example.com","plugins":{"cors":{}},"upstream":{"type":"chash","nodes":{"static:80":2}}}"#.to_vec(),
            )
            .await
            .unwrap();

        registry.register(&web("/web-1", &["80/tcp"])).await.unwrap();

        let route = stored(&store, "/apisix/routes/web").unwrap();
        assert_eq!(route.uri.as_deref(), Some("/v1/*"));
        assert_eq!(route.host.as_deref(), Some("old.example.com"));
        assert!(route.extra.contains_key("plugins"));
        let upstream = route.upstream.unwrap();
        assert_eq!(upstream.balancer.as_deref(), Some("chash"));
        let nodes = upstream.nodes.unwrap();
        assert_eq!(nodes.weight("static:80"), Some(2));
        assert_eq!(nodes.weight("web-1:80"), Some(1));
    }

    #[tokio::test]
    async fn deregister_removes_only_own_endpoints() {
        let (registry, store) = registry();
        let one = web("/web-1", &["80/tcp", "81/tcp"]);

        registry.register(&one).await.unwrap();
        registry.register(&web("/web-2", &["80/tcp"])).await.unwrap();
        registry.deregister(&one).await.unwrap();

        let route = stored(&store, "/apisix/routes/web").unwrap();
        assert_eq!(endpoints(&route), vec!["web-2:80"]);
    }

    #[tokio::test]
    async fn key_vanishes_with_last_endpoint() {
        let (registry, store) = registry();
        let c = web("/web-1", &["80/tcp"]);

        registry.register(&c).await.unwrap();
        registry.deregister(&c).await.unwrap();

        assert!(store.value("/apisix/routes/web").is_none());
    }

    #[tokio::test]
    async fn deregister_missing_route_is_not_found() {
        let (registry, store) = registry();

        let err = registry.deregister(&web("/web-1", &["80/tcp"])).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(service) if service == "web"));
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn unrelated_deregister_writes_nothing() {
        let (registry, store) = registry();
        let raw = br#"{"id":"web","upstream":{"nodes":{"web-2:80":1}}}"#.to_vec();
        store.put("/apisix/routes/web", raw.clone()).await.unwrap();

        registry.deregister(&web("/web-1", &["80/tcp"])).await.unwrap();
        assert_eq!(store.value("/apisix/routes/web"), Some(raw));
    }

    #[tokio::test]
    async fn foreign_route_is_left_untouched() {
        let (registry, store) = registry();
        let raw = br#"{"id":"web","uri":"/legacy","upstream":{"type":"roundrobin","nodes":[{"host":"10.0.0.1","port":80,"weight":1}]}}"#.to_vec();
        store.put("/apisix/routes/web", raw.clone()).await.unwrap();
        let c = web("/web-1", &["80/tcp"]);

        registry.deregister(&c).await.unwrap();
        assert_eq!(store.value("/apisix/routes/web"), Some(raw.clone()));

        let err = registry.register(&c).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unmanaged(id) if id == "web"));
        assert_eq!(store.value("/apisix/routes/web"), Some(raw));
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn missing_host_label_writes_nothing() {
        let (registry, store) = registry();
        let c = container("/web-1", &[(SERVICE, "web")], &["80/tcp"]);

        let err = registry.register(&c).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotEnabled(_)));
        assert!(store.value("/apisix/routes/web").is_none());
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn held_create_lock_aborts_register() {
        let (registry, store) = registry();
        let session = store.open_session().await.unwrap();
        assert!(store
            .try_lock(session, &lock_name(LockKind::Create, "web"))
            .await
            .unwrap());

        let err = registry.register(&web("/web-1", &["80/tcp"])).await.unwrap_err();
        assert!(matches!(err, RegistryError::LockContention(_)));
        assert!(store.value("/apisix/routes/web").is_none());

        store.close_session(session).await.unwrap();
        registry.register(&web("/web-1", &["80/tcp"])).await.unwrap();
        assert!(store.value("/apisix/routes/web").is_some());
    }

    #[tokio::test]
    async fn create_lock_does_not_exclude_remove() {
        let (registry, store) = registry();
        let c = web("/web-1", &["80/tcp"]);
        registry.register(&c).await.unwrap();

        let session = store.open_session().await.unwrap();
        assert!(store
            .try_lock(session, &lock_name(LockKind::Create, "web"))
            .await
            .unwrap());

        // A registration in flight for the service does not stop removal.
        registry.deregister(&c).await.unwrap();
        assert!(store.value("/apisix/routes/web").is_none());

        store.close_session(session).await.unwrap();
    }

    #[tokio::test]
    async fn locks_are_scoped_per_service() {
        let (registry, store) = registry();
        let session = store.open_session().await.unwrap();
        store
            .try_lock(session, &lock_name(LockKind::Create, "web"))
            .await
            .unwrap();

        let api = container("/api", &[(GATEWAY_HOST, "api.example.com")], &["80/tcp"]);
        registry.register(&api).await.unwrap();
        assert!(store.value("/apisix/routes/api").is_some());
    }

    #[tokio::test]
    async fn store_failure_still_closes_session() {
        let (registry, store) = registry();
        store.fail_reads(true);

        let err = registry.register(&web("/web-1", &["80/tcp"])).await.unwrap_err();
        assert!(matches!(err, RegistryError::Store(_)));
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn unconfigured_registry_fails_construct() {
        let registry = EtcdRegistry::new(None);
        assert!(matches!(
            registry.construct().await,
            Err(RegistryError::Config(_))
        ));
        assert!(matches!(
            registry.register(&web("/web-1", &["80/tcp"])).await,
            Err(RegistryError::Config(_))
        ));
    }
}
