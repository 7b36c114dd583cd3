use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::{ErrorKind, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

/// Top level configuration for the relay, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// IPv4 address to listen on
    pub listen: Ipv4Addr,
    /// Port to run the service on
    pub port: u16,
    /// Public domain the relay is reachable on. Must be an SSL-enabled
    /// domain reachable by HTTPS.
    pub domain: String,
    /// Number of push workers. 0 means one per logical CPU.
    pub workers: usize,
    /// Global in-flight limit for outbound requests
    pub push_limit: usize,
    /// Total timeout for a single outbound request in seconds
    pub timeout: u64,
    /// Primary database settings
    pub database: DbConfig,
    /// Cache backend settings
    pub cache: CacheConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: Ipv4Addr::new(0, 0, 0, 0),
            port: 8080,
            domain: String::from("relay.example.com"),
            workers: 0,
            push_limit: 100,
            timeout: 10,
            database: Default::default(),
            cache: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbConfig {
    /// Database engine: "sqlite" or "postgres"
    pub backend: DbBackend,
    /// Path to the sqlite database file
    pub sqlite_path: PathBuf,
    /// PostgreSQL connection settings (ignored for sqlite)
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_user: String,
    pub pg_pass: String,
    pub pg_name: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: DbBackend::Sqlite,
            sqlite_path: PathBuf::from("relay.sqlite3"),
            pg_host: String::from("localhost"),
            pg_port: 5432,
            pg_user: String::from("relay"),
            pg_pass: String::new(),
            pg_name: String::from("relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Cache backend: "database" reuses the primary store, "redis" opens an
    /// independent client
    pub backend: CacheBackend,
    /// Redis host, or a filesystem path for unix socket connections
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_user: String,
    pub redis_pass: String,
    pub redis_database: i64,
    pub redis_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Database,
            redis_host: String::from("localhost"),
            redis_port: 6379,
            redis_user: String::new(),
            redis_pass: String::new(),
            redis_database: 0,
            redis_prefix: String::from("fedirelay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Database,
    Redis,
}

impl RelayConfig {
    /// Resolve the config file path from the `-c` flag or `CONFIG_FILE`,
    /// with container mode pinning everything under /data.
    pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
        if is_docker() {
            return PathBuf::from("/data/config.yaml");
        }

        flag.or_else(|| env::var("CONFIG_FILE").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("relay.yaml"))
    }

    /// Try to load our config file if it exists, otherwise write out our
    /// default config and return that.
    pub fn load_or_write_default(path: &Path) -> crate::Result<Self> {
        let mut cfg = match fs::read_to_string(path) {
            Ok(content) => serde_yaml::from_str(&content)?,

            Err(e) if e.kind() == ErrorKind::NotFound => {
                let cfg = Self::default();
                let mut f = File::create(path)?;
                f.write_all(serde_yaml::to_string(&cfg)?.as_bytes())?;

                cfg
            }

            Err(e) => return Err(e.into()),
        };

        if is_docker() {
            cfg.listen = Ipv4Addr::new(0, 0, 0, 0);
            cfg.port = 8080;
            cfg.database.sqlite_path = PathBuf::from("/data/relay.sqlite3");
        }

        Ok(cfg)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn actor(&self) -> String {
        format!("https://{}/actor", self.domain)
    }

    pub fn keyid(&self) -> String {
        format!("{}#main-key", self.actor())
    }

    /// True when the configured domain has never been changed from the
    /// placeholder written by `load_or_write_default`.
    pub fn is_placeholder(&self) -> bool {
        self.domain.ends_with("example.com")
    }
}

pub fn is_docker() -> bool {
    env::var("DOCKER_RUNNING").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let cfg = RelayConfig::default();
        let raw = serde_yaml::to_string(&cfg).unwrap();
        let parsed: RelayConfig = serde_yaml::from_str(&raw).unwrap();

        assert_eq!(parsed.domain, cfg.domain);
        assert_eq!(parsed.database.backend, DbBackend::Sqlite);
        assert_eq!(parsed.cache.backend, CacheBackend::Database);
    }

    #[test]
    fn partial_yaml_uses_defaults() {
        let parsed: RelayConfig = serde_yaml::from_str("domain: relay.example.org\n").unwrap();

        assert_eq!(parsed.domain, "relay.example.org");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.push_limit, 100);
    }
}
