use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory searched for `turu.yaml` before `$HOME` and the working
/// directory.
const SYSTEM_DIR: &str = "/etc/turu";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(alias = "apisix-yaml", skip_serializing_if = "Option::is_none")]
    pub apisix_yaml: Option<ApisixYamlConfig>,
    #[serde(alias = "apisix-etcd", skip_serializing_if = "Option::is_none")]
    pub apisix_etcd: Option<ApisixEtcdConfig>,
    /// Backends nested under `config:`, as older `turu.yaml` files have them.
    #[serde(default, skip_serializing)]
    config: Option<Backends>,
    /// Number of event workers; events of one service always share a worker.
    pub workers: usize,
    /// Pending events per worker before the event pump waits.
    pub queue_capacity: usize,
    /// Register already running containers before following events.
    pub sync_on_startup: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct Backends {
    #[serde(alias = "apisix-yaml")]
    apisix_yaml: Option<ApisixYamlConfig>,
    #[serde(alias = "apisix-etcd")]
    apisix_etcd: Option<ApisixEtcdConfig>,
}

/// File backend: APISIX standalone `apisix.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApisixYamlConfig {
    pub path: PathBuf,
    /// Write through a temporary file and rename instead of truncating.
    #[serde(default)]
    pub atomic_write: bool,
}

/// Distributed backend: the etcd cluster APISIX watches.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApisixEtcdConfig {
    #[serde(alias = "endpoint")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtls: Option<MtlsConfig>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: i64,
}

/// PEM file paths for mutual TLS against etcd.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MtlsConfig {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "/apisix".into()
}

fn default_lock_ttl_secs() -> i64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apisix_yaml: None,
            apisix_etcd: None,
            config: None,
            workers: 4,
            queue_capacity: 128,
            sync_on_startup: true,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&search_dirs(Path::new(SYSTEM_DIR)))
    }

    /// Loads `turu.yaml` from each of `dirs` in turn, then the working
    /// directory, `TURU_CONFIG` and the environment. Later sources win.
    fn load_from(dirs: &[PathBuf]) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        for dir in dirs {
            figment = figment.merge(Yaml::file(dir.join("turu.yaml")));
        }
        figment = figment
            .merge(Yaml::file("turu.yaml"))
            .merge(Toml::file("turu.toml"))
            .merge(Json::file("turu.json"));
        if let Ok(explicit) = std::env::var("TURU_CONFIG") {
            figment = figment.merge(Yaml::file(explicit));
        }

        let mut config: Config = figment
            .merge(Env::prefixed("TURU_").ignore(&["CONFIG", "ETCD_PASSWORD_FILE"]).split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if let Some(nested) = config.config.take() {
            if config.apisix_yaml.is_none() {
                config.apisix_yaml = nested.apisix_yaml;
            }
            if config.apisix_etcd.is_none() {
                config.apisix_etcd = nested.apisix_etcd;
            }
        }

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("TURU_ETCD_PASSWORD_FILE") {
            let password = std::fs::read_to_string(secret_file)?.trim().to_string();
            match config.apisix_etcd.as_mut() {
                Some(etcd) => etcd.password = Some(password),
                None => anyhow::bail!("TURU_ETCD_PASSWORD_FILE is set but apisix_etcd is not configured"),
            }
        }

        if config.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if config.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }

        Ok(config)
    }

    /// Selectors of the backends that have a configuration section.
    pub fn configured_backends(&self) -> Vec<&'static str> {
        let mut backends = Vec::new();
        if self.apisix_yaml.is_some() {
            backends.push(crate::registry::APISIX_YAML);
        }
        if self.apisix_etcd.is_some() {
            backends.push(crate::registry::APISIX_ETCD);
        }
        backends
    }
}

fn search_dirs(system: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![system.to_path_buf()];
    if let Ok(home) = std::env::var("HOME") {
        dirs.push(PathBuf::from(home));
    }
    dirs
}
