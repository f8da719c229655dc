//! Configuration loading and access.
//!
//! The configuration is stored in a global that is cheap to read from every
//! worker; `ArcSwap` makes replacing it on reload safe without locking.

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::info;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Backend host and port. A host beginning with `/` is a Unix socket
/// directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credentials used for backend connections.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct User {
    pub username: String,
    pub password: Option<String>,
}

/// General settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    #[serde(default = "General::default_host")]
    pub host: String,

    #[serde(default = "General::default_port")]
    pub port: u16,

    /// Directory where each worker binds its `.s.<pid>.<id>` management
    /// socket.
    #[serde(default = "General::default_unix_socket_dir")]
    pub unix_socket_dir: String,

    /// How long a borrow may wait for a free slot before the client is told
    /// the pool is full, in milliseconds.
    #[serde(default = "General::default_checkout_timeout")]
    pub checkout_timeout: u64,

    /// Backend connect timeout, in milliseconds.
    #[serde(default = "General::default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "General::default_tcp_keepalives_idle")]
    pub tcp_keepalives_idle: u64,
    #[serde(default = "General::default_tcp_keepalives_count")]
    pub tcp_keepalives_count: u32,
    #[serde(default = "General::default_tcp_keepalives_interval")]
    pub tcp_keepalives_interval: u64,
    #[serde(default = "General::default_tcp_no_delay")]
    pub tcp_no_delay: bool,

    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    /// When set, log to syslog under this program name instead of stderr.
    #[serde(default)]
    pub syslog_prog_name: Option<String>,
}

impl General {
    pub fn default_host() -> String {
        "0.0.0.0".into()
    }
    pub fn default_port() -> u16 {
        6432
    }
    pub fn default_unix_socket_dir() -> String {
        "/tmp".into()
    }
    pub fn default_checkout_timeout() -> u64 {
        5_000
    }
    pub fn default_connect_timeout() -> u64 {
        5_000
    }
    pub fn default_tcp_keepalives_idle() -> u64 {
        5
    }
    pub fn default_tcp_keepalives_count() -> u32 {
        5
    }
    pub fn default_tcp_keepalives_interval() -> u64 {
        5
    }
    pub fn default_tcp_no_delay() -> bool {
        true
    }
    pub fn default_worker_threads() -> usize {
        4
    }
}

impl Default for General {
    fn default() -> General {
        General {
            host: General::default_host(),
            port: General::default_port(),
            unix_socket_dir: General::default_unix_socket_dir(),
            checkout_timeout: General::default_checkout_timeout(),
            connect_timeout: General::default_connect_timeout(),
            tcp_keepalives_idle: General::default_tcp_keepalives_idle(),
            tcp_keepalives_count: General::default_tcp_keepalives_count(),
            tcp_keepalives_interval: General::default_tcp_keepalives_interval(),
            tcp_no_delay: General::default_tcp_no_delay(),
            worker_threads: General::default_worker_threads(),
            syslog_prog_name: None,
        }
    }
}

/// The backend pool this instance multiplexes onto.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub server_host: String,

    #[serde(default = "PoolConfig::default_server_port")]
    pub server_port: u16,

    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    pub database: String,

    #[serde(default = "PoolConfig::default_pool_size")]
    pub pool_size: usize,
}

impl PoolConfig {
    pub fn default_server_port() -> u16 {
        5432
    }
    pub fn default_pool_size() -> usize {
        10
    }

    pub fn address(&self) -> Address {
        Address {
            host: self.server_host.clone(),
            port: self.server_port,
        }
    }

    pub fn server_user(&self) -> User {
        User {
            username: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            server_host: "127.0.0.1".into(),
            server_port: PoolConfig::default_server_port(),
            user: "postgres".into(),
            password: None,
            database: "postgres".into(),
            pool_size: PoolConfig::default_pool_size(),
        }
    }
}

/// Optional standby target promoted when writes to the primary fail.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Failover {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub host: String,

    #[serde(default = "PoolConfig::default_server_port")]
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub failover: Failover,
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool.pool_size == 0 {
            return Err(Error::BadConfig("pool_size must be at least 1".into()));
        }
        if self.pool.user.is_empty() {
            return Err(Error::BadConfig("pool user must not be empty".into()));
        }
        if self.failover.enabled && self.failover.host.is_empty() {
            return Err(Error::BadConfig(
                "failover is enabled but no failover host is configured".into(),
            ));
        }
        Ok(())
    }

    pub fn show(&self) {
        info!("Listening on {}:{}", self.general.host, self.general.port);
        info!(
            "Pool: {} slots to {} as {} (database {})",
            self.pool.pool_size,
            self.pool.address(),
            self.pool.user,
            self.pool.database
        );
        if self.failover.enabled {
            info!("Failover: {}:{}", self.failover.host, self.failover.port);
        }
    }
}

/// Parse a configuration file and install it as the global config.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let contents = std::fs::read_to_string(&path).map_err(|err| {
        Error::BadConfig(format!(
            "could not read {}: {err}",
            path.as_ref().display()
        ))
    })?;
    let config: Config = toml::from_str(&contents)
        .map_err(|err| Error::BadConfig(format!("could not parse config: {err}")))?;
    config.validate()?;
    CONFIG.store(Arc::new(config));
    Ok(())
}

/// Install an already-built configuration (used by tests and embedders).
pub fn set_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

/// Get a read-only instance of the configuration.
pub fn get_config() -> Config {
    (*(*CONFIG.load())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            server_host = "10.0.0.1"
            user = "app"
            database = "orders"
            "#,
        )
        .unwrap();

        assert_eq!(config.general.port, 6432);
        assert_eq!(config.general.unix_socket_dir, "/tmp");
        assert_eq!(config.pool.server_port, 5432);
        assert_eq!(config.pool.pool_size, 10);
        assert!(!config.failover.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_pool() {
        let config = Config {
            pool: PoolConfig {
                pool_size: 0,
                ..PoolConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_failover_without_host() {
        let config = Config {
            failover: Failover {
                enabled: true,
                host: String::new(),
                port: 5432,
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
