use crate::error::{ClusterError, Result};
use crate::url::ConnectionUrl;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Where the member list comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InventoryConfig {
    /// EC2 instances matching `instance_tags`, via the AWS CLI
    Ec2 { region: String },

    /// Fixed host list
    Static { hosts: Vec<String> },

    /// Every address a hostname resolves to
    Dns { hostname: String },
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig::Ec2 {
            region: "eu-west-1".to_string(),
        }
    }
}

/// Cluster connection configuration, fixed at manager construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub database: String,
    pub user: String,
    pub password: String,

    /// Database port on every member
    pub port: u16,

    /// Management (leader status) port on every member
    pub leader_probe_port: u16,

    /// Path answering 200 only on the current leader
    pub leader_probe_path: String,
    pub leader_probe_timeout_ms: u64,

    // Pool sizing
    pub max_connections: u32,
    pub idle_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub max_uses: u32,
    pub max_lifetime_ms: u64,

    // Background work
    pub discovery_interval_ms: u64,
    pub health_check_interval_ms: u64,

    // Connection retry policy
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    /// Tag filter applied by the inventory source
    pub instance_tags: BTreeMap<String, String>,
    pub inventory: InventoryConfig,

    /// Connect to the first member when none confirms leadership
    pub fallback_to_first_member: bool,

    /// Probe members for leadership; disabled for single-host direct mode
    pub verify_leader: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let mut instance_tags = BTreeMap::new();
        instance_tags.insert("Role".to_string(), "postgresql-patroni".to_string());
        instance_tags.insert("Tier".to_string(), "database".to_string());

        Self {
            database: "postgres".to_string(),
            user: "admin".to_string(),
            password: "admin123".to_string(),
            port: 5432,
            leader_probe_port: 8008,
            leader_probe_path: "/master".to_string(),
            leader_probe_timeout_ms: 5000,
            max_connections: 20,
            idle_timeout_ms: 30_000,
            connection_timeout_ms: 10_000,
            max_uses: 7500,
            max_lifetime_ms: 1_800_000,
            discovery_interval_ms: 30_000,
            health_check_interval_ms: 10_000,
            max_retries: 3,
            retry_delay_ms: 2000,
            instance_tags,
            inventory: InventoryConfig::default(),
            fallback_to_first_member: true,
            verify_leader: true,
        }
    }
}

impl ClusterConfig {
    /// Direct mode: a single host taken from a connection URL, no leader probing
    pub fn direct(url: &ConnectionUrl) -> Self {
        Self::default().into_direct(url)
    }

    /// Keep pool and retry settings but target the single host of `url`
    pub fn into_direct(mut self, url: &ConnectionUrl) -> Self {
        self.apply_url(url);
        self.inventory = InventoryConfig::Static {
            hosts: vec![url.host.clone()],
        };
        self.verify_leader = false;
        self
    }

    /// Take credentials, port and database name from a connection URL
    pub fn apply_url(&mut self, url: &ConnectionUrl) {
        self.user = url.user.clone();
        self.password = url.password.clone();
        self.port = url.port;
        self.database = url.database.clone();
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(ClusterError::config("database name must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(ClusterError::config("user must not be empty"));
        }
        if self.port == 0 || self.leader_probe_port == 0 {
            return Err(ClusterError::config("ports must be non-zero"));
        }
        if !self.leader_probe_path.starts_with('/') {
            return Err(ClusterError::config(format!(
                "leader_probe_path must start with '/': {}",
                self.leader_probe_path
            )));
        }

        let timings = [
            ("leader_probe_timeout_ms", self.leader_probe_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("max_lifetime_ms", self.max_lifetime_ms),
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("retry_delay_ms", self.retry_delay_ms),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, value)| *value == 0) {
            return Err(ClusterError::config(format!("{} must be greater than 0", name)));
        }

        if self.max_retries < 1 {
            return Err(ClusterError::config("max_retries must be at least 1"));
        }
        if self.max_connections < 1 {
            return Err(ClusterError::config("max_connections must be at least 1"));
        }
        if self.max_uses < 1 {
            return Err(ClusterError::config("max_uses must be at least 1"));
        }

        match &self.inventory {
            InventoryConfig::Ec2 { region } if region.trim().is_empty() => {
                Err(ClusterError::config("ec2 inventory requires a region"))
            }
            InventoryConfig::Static { hosts } if hosts.iter().all(|h| h.trim().is_empty()) => {
                Err(ClusterError::config("static inventory requires at least one host"))
            }
            InventoryConfig::Dns { hostname } if hostname.trim().is_empty() => {
                Err(ClusterError::config("dns inventory requires a hostname"))
            }
            _ => Ok(()),
        }
    }

    pub fn leader_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_probe_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
