use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::clamav::ClamavTimeouts;
use crate::failover::RetryPolicy;
use crate::spamd::SpamdTimeouts;
use crate::upstream::{parse_address, HealthConfig, ProtocolKind, UpstreamPool};
use crate::verdict::VerdictSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: String,
    pub pid_file: String,
    /// Directory for spooled messages handed to the daemons.
    pub spool_dir: String,
    pub logging: LoggingConfig,
    pub retry: RetryConfig,
    pub clamav: ClamavConfig,
    pub spamd: SpamdConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace.
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: usize,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    /// `/path/to/socket` or `host:port`.
    pub address: String,
    /// Defaults to clamd for antivirus servers and rspamc for spam servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClamavConfig {
    pub servers: Vec<ServerConfig>,
    pub connect_timeout_ms: u64,
    pub port_timeout_ms: u64,
    pub data_timeout_ms: u64,
    pub results_timeout_ms: u64,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamdConfig {
    pub servers: Vec<ServerConfig>,
    pub extra_servers: Vec<ServerConfig>,
    pub connect_timeout_ms: u64,
    pub results_timeout_ms: u64,
    pub health: HealthConfig,
    /// Add X-Spamd-* result headers.
    pub extended_headers: bool,
    pub trace_symbol: Option<String>,
    pub trace_addr: Option<String>,
    pub reject_message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// What to do with a message when a pool could not scan it.
    pub on_unavailable: UnavailablePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    #[default]
    Accept,
    Tempfail,
    Reject,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/var/run/scan-milter.sock".to_string(),
            pid_file: "/var/run/scan-milter.pid".to_string(),
            spool_dir: "/tmp".to_string(),
            logging: LoggingConfig::default(),
            retry: RetryConfig::default(),
            clamav: ClamavConfig::default(),
            spamd: SpamdConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 5,
            backoff_ms: 1000,
        }
    }
}

impl Default for ClamavConfig {
    fn default() -> Self {
        ClamavConfig {
            servers: vec![ServerConfig {
                name: "local".to_string(),
                address: "/var/run/clamav/clamd.sock".to_string(),
                protocol: None,
            }],
            connect_timeout_ms: 1000,
            port_timeout_ms: 5000,
            data_timeout_ms: 15000,
            results_timeout_ms: 15000,
            health: HealthConfig::default(),
        }
    }
}

impl Default for SpamdConfig {
    fn default() -> Self {
        SpamdConfig {
            servers: vec![ServerConfig {
                name: "rspamd".to_string(),
                address: "127.0.0.1:11333".to_string(),
                protocol: Some(ProtocolKind::Rspamc),
            }],
            extra_servers: Vec::new(),
            connect_timeout_ms: 1000,
            results_timeout_ms: 20000,
            health: HealthConfig::default(),
            extended_headers: true,
            trace_symbol: None,
            trace_addr: None,
            reject_message: "Spam message rejected; If this is not spam contact abuse team"
                .to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file '{path}'"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse configuration file '{path}'"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks everything that can be checked without talking to a daemon.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.log_level()?;
        if self.retry.attempts == 0 {
            bail!("retry.attempts must be at least 1");
        }
        if !Path::new(&self.spool_dir).is_dir() {
            bail!("spool_dir '{}' is not a directory", self.spool_dir);
        }
        self.clamav_pool()?;
        self.spam_pool(false)?;
        self.spam_pool(true)?;
        if self.spamd.trace_symbol.is_some() != self.spamd.trace_addr.is_some() {
            log::warn!("spamd.trace_symbol and spamd.trace_addr only work together");
        }
        Ok(())
    }

    pub fn log_level(&self) -> anyhow::Result<LevelFilter> {
        self.logging
            .level
            .parse()
            .map_err(|_| anyhow!("invalid logging.level '{}'", self.logging.level))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }

    pub fn clamav_timeouts(&self) -> ClamavTimeouts {
        ClamavTimeouts {
            connect: Duration::from_millis(self.clamav.connect_timeout_ms),
            port: Duration::from_millis(self.clamav.port_timeout_ms),
            data: Duration::from_millis(self.clamav.data_timeout_ms),
            results: Duration::from_millis(self.clamav.results_timeout_ms),
        }
    }

    pub fn spamd_timeouts(&self) -> SpamdTimeouts {
        SpamdTimeouts {
            connect: Duration::from_millis(self.spamd.connect_timeout_ms),
            results: Duration::from_millis(self.spamd.results_timeout_ms),
        }
    }

    pub fn verdict_settings(&self) -> VerdictSettings {
        VerdictSettings {
            extended_headers: self.spamd.extended_headers,
            trace_symbol: self.spamd.trace_symbol.clone(),
            trace_addr: self.spamd.trace_addr.clone(),
        }
    }

    pub fn clamav_pool(&self) -> anyhow::Result<UpstreamPool> {
        build_pool(
            "clamav.servers",
            &self.clamav.servers,
            ProtocolKind::Clamd,
            self.clamav.health,
        )
    }

    pub fn spam_pool(&self, extra: bool) -> anyhow::Result<UpstreamPool> {
        let (section, servers) = if extra {
            ("spamd.extra_servers", &self.spamd.extra_servers)
        } else {
            ("spamd.servers", &self.spamd.servers)
        };
        build_pool(section, servers, ProtocolKind::Rspamc, self.spamd.health)
    }
}

fn build_pool(
    section: &str,
    servers: &[ServerConfig],
    default_protocol: ProtocolKind,
    health: HealthConfig,
) -> anyhow::Result<UpstreamPool> {
    let mut members = Vec::with_capacity(servers.len());
    for server in servers {
        if server.name.trim().is_empty() {
            bail!("{section}: server with address '{}' has no name", server.address);
        }
        let protocol = server.protocol.unwrap_or(default_protocol);
        let is_clamd = protocol == ProtocolKind::Clamd;
        if is_clamd != (default_protocol == ProtocolKind::Clamd) {
            bail!(
                "{section}: server '{}' uses protocol {protocol} which does not belong here",
                server.name
            );
        }
        let address = parse_address(&server.address)
            .with_context(|| format!("{section}: server '{}'", server.name))?;
        members.push((server.name.clone(), address, protocol));
    }
    Ok(UpstreamPool::new(members, health))
}
