//! In-memory cluster used by the integration tests.
//!
//! One `FakeCluster` scripts what the inventory returns, which member
//! answers the leader probe, which members are read-only and which refuse
//! connections. Inventory, probe and backend fakes all read from it.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use crudapp_cluster::{
    Backend, BackendPool, ClusterConfig, ClusterError, ClusterManager, ErrorHook, ErrorKind,
    InventorySource, LeaderProbe, MemberAddress, PoolStats, QueryParam, Result, Verification,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Script {
    /// `None` makes the inventory source fail
    inventory: Option<Vec<String>>,
    leaders: HashSet<String>,
    in_recovery: HashSet<String>,
    unreachable: HashSet<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    script: Mutex<Script>,
    opens: Mutex<HashMap<String, usize>>,
    hooks: Mutex<Vec<(String, ErrorHook)>>,
    closes: AtomicUsize,
    open_delay: Mutex<Duration>,
}

impl FakeCluster {
    pub fn new(hosts: &[&str]) -> Arc<Self> {
        let cluster = Self::default();
        cluster.set_inventory(Some(hosts));
        Arc::new(cluster)
    }

    pub fn set_inventory(&self, hosts: Option<&[&str]>) {
        self.script.lock().inventory = hosts.map(|h| h.iter().map(|s| s.to_string()).collect());
    }

    /// Make `host` the only member answering the leader probe
    pub fn set_leader(&self, host: &str) {
        let mut script = self.script.lock();
        script.leaders.clear();
        script.leaders.insert(host.to_string());
    }

    pub fn clear_leader(&self) {
        self.script.lock().leaders.clear();
    }

    pub fn set_in_recovery(&self, host: &str, in_recovery: bool) {
        let mut script = self.script.lock();
        if in_recovery {
            script.in_recovery.insert(host.to_string());
        } else {
            script.in_recovery.remove(host);
        }
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut script = self.script.lock();
        if unreachable {
            script.unreachable.insert(host.to_string());
        } else {
            script.unreachable.remove(host);
        }
    }

    /// Delay every pool open by `delay`
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Fire the pool error callback of every pool opened against `host`
    pub fn emit_pool_error(&self, host: &str) {
        let hooks: Vec<ErrorHook> = self
            .hooks
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, hook)| hook.clone())
            .collect();

        let err = ClusterError::query(
            ErrorKind::ResetByPeer,
            io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
        );
        for hook in hooks {
            hook(&err);
        }
    }

    pub fn total_opens(&self) -> usize {
        self.opens.lock().values().sum()
    }

    pub fn opens_for(&self, host: &str) -> usize {
        self.opens.lock().get(host).copied().unwrap_or(0)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn is_leader(&self, host: &str) -> bool {
        self.script.lock().leaders.contains(host)
    }

    fn is_unreachable(&self, host: &str) -> bool {
        self.script.lock().unreachable.contains(host)
    }

    fn is_in_recovery(&self, host: &str) -> bool {
        self.script.lock().in_recovery.contains(host)
    }
}

fn refused() -> ClusterError {
    ClusterError::query(
        ErrorKind::ConnectionRefused,
        io::Error::new(io::ErrorKind::ConnectionRefused, "connect ECONNREFUSED"),
    )
}

pub struct FakeInventory(pub Arc<FakeCluster>);

#[async_trait]
impl InventorySource for FakeInventory {
    async fn list_members(&self) -> anyhow::Result<Vec<MemberAddress>> {
        match self.0.script.lock().inventory.clone() {
            Some(hosts) => Ok(hosts.into_iter().map(MemberAddress::from).collect()),
            None => anyhow::bail!("inventory unreachable"),
        }
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

pub struct FakeProbe(pub Arc<FakeCluster>);

#[async_trait]
impl LeaderProbe for FakeProbe {
    async fn is_leader(&self, member: &MemberAddress) -> bool {
        let cluster = &self.0;
        !cluster.is_unreachable(member.host()) && cluster.is_leader(member.host())
    }
}

pub struct FakeBackend(pub Arc<FakeCluster>);

#[async_trait]
impl Backend for FakeBackend {
    type Pool = FakePool;

    async fn open(
        &self,
        member: &MemberAddress,
        config: &ClusterConfig,
        on_error: ErrorHook,
    ) -> Result<FakePool> {
        let delay = *self.0.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        *self.0.opens.lock().entry(member.host().to_string()).or_default() += 1;

        if self.0.is_unreachable(member.host()) {
            return Err(ClusterError::connect(
                member.clone(),
                ErrorKind::ConnectionRefused,
                io::Error::new(io::ErrorKind::ConnectionRefused, "connect ECONNREFUSED"),
            ));
        }

        self.0
            .hooks
            .lock()
            .push((member.host().to_string(), on_error));

        Ok(FakePool {
            member: member.clone(),
            cluster: self.0.clone(),
            closed: AtomicBool::new(false),
            max_connections: config.max_connections,
        })
    }
}

/// Checked-out fake connection
#[derive(Debug)]
pub struct FakeConnection {
    pub member: MemberAddress,
}

pub struct FakePool {
    member: MemberAddress,
    cluster: Arc<FakeCluster>,
    closed: AtomicBool,
    max_connections: u32,
}

#[async_trait]
impl BackendPool for FakePool {
    /// `"<member>|<sql>"` so tests can see which member served a statement
    type Rows = Vec<String>;
    type Connection = FakeConnection;

    async fn verify(&self) -> Result<Verification> {
        if self.cluster.is_unreachable(self.member.host()) {
            return Err(refused());
        }
        Ok(Verification {
            server_time: Utc::now(),
            in_recovery: self.cluster.is_in_recovery(self.member.host()),
            server_version: "PostgreSQL 16.2 (fake)".to_string(),
        })
    }

    async fn query(&self, sql: &str, _params: &[QueryParam]) -> Result<Vec<String>> {
        if self.is_closed() {
            return Err(ClusterError::query(ErrorKind::Other, "pool is closed"));
        }
        if self.cluster.is_unreachable(self.member.host()) {
            return Err(refused());
        }
        if sql.contains("duplicate") {
            return Err(ClusterError::query(
                ErrorKind::Other,
                "duplicate key value violates unique constraint",
            ));
        }
        Ok(vec![format!("{}|{}", self.member, sql)])
    }

    async fn acquire(&self) -> Result<FakeConnection> {
        if self.is_closed() {
            return Err(ClusterError::query(ErrorKind::Other, "pool is closed"));
        }
        if self.cluster.is_unreachable(self.member.host()) {
            return Err(refused());
        }
        Ok(FakeConnection {
            member: self.member.clone(),
        })
    }

    fn stats(&self) -> PoolStats {
        if self.is_closed() {
            return PoolStats {
                max_connections: self.max_connections,
                ..Default::default()
            };
        }
        PoolStats::new(2, 1, self.max_connections)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cluster.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Defaults with an inventory that passes validation
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        inventory: crudapp_cluster::InventoryConfig::Static {
            hosts: vec!["fake".to_string()],
        },
        ..Default::default()
    }
}

pub fn manager(cluster: &Arc<FakeCluster>) -> ClusterManager<FakeBackend> {
    manager_with(cluster, test_config())
}

pub fn manager_with(cluster: &Arc<FakeCluster>, config: ClusterConfig) -> ClusterManager<FakeBackend> {
    ClusterManager::new(
        config,
        FakeBackend(cluster.clone()),
        Arc::new(FakeInventory(cluster.clone())),
        Arc::new(FakeProbe(cluster.clone())),
    )
    .expect("valid test config")
}

/// Let spawned background work run without crossing a timer boundary
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
