use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address (host) of one cluster member
///
/// Equality is by host value only; ports are part of the cluster config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberAddress(String);

impl MemberAddress {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into().trim().to_string())
    }

    pub fn host(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberAddress {
    fn from(host: &str) -> Self {
        Self::new(host)
    }
}

impl From<String> for MemberAddress {
    fn from(host: String) -> Self {
        Self::new(host)
    }
}

/// Bind value for a parameterized statement
///
/// Untagged variants are tried in order, so `Timestamp` precedes `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
    Json(serde_json::Value),
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        QueryParam::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        QueryParam::Int(v as i64)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        QueryParam::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        QueryParam::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        QueryParam::Text(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        QueryParam::Text(v)
    }
}

impl From<DateTime<Utc>> for QueryParam {
    fn from(v: DateTime<Utc>) -> Self {
        QueryParam::Timestamp(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(QueryParam::Null)
    }
}

/// Result of the post-connect verification query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// Server clock at verification time (liveness signal)
    pub server_time: DateTime<Utc>,
    /// Node is a replica / in recovery and refuses writes
    pub in_recovery: bool,
    pub server_version: String,
}

/// Lifecycle of a cluster connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Connected,
    Reconnecting,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "Uninitialized"),
            ManagerState::Initializing => write!(f, "Initializing"),
            ManagerState::Connected => write!(f, "Connected"),
            ManagerState::Reconnecting => write!(f, "Reconnecting"),
            ManagerState::ShuttingDown => write!(f, "ShuttingDown"),
            ManagerState::Closed => write!(f, "Closed"),
        }
    }
}

/// Connection pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Open connections (idle + checked out)
    pub size: u32,
    pub idle: u32,
    pub active: u32,
    pub max_connections: u32,
}

impl PoolStats {
    pub fn new(size: u32, idle: u32, max_connections: u32) -> Self {
        Self {
            size,
            idle,
            active: size.saturating_sub(idle),
            max_connections,
        }
    }
}

/// Pool and cluster introspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub state: ManagerState,
    pub active_member: Option<MemberAddress>,
    pub directory_size: usize,
    pub members: Vec<MemberAddress>,
    pub pool: PoolStats,
    /// Reconnections performed since construction
    pub reconnections: u64,
}

/// Outcome of an end-to-end connection test against the active member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub server_time: Option<DateTime<Utc>>,
    pub server_version: Option<String>,
    pub is_replica: Option<bool>,
    pub leader: Option<MemberAddress>,
    pub members: Vec<MemberAddress>,
    pub error: Option<String>,
}

impl ConnectionReport {
    pub fn failed(error: impl Into<String>, leader: Option<MemberAddress>, members: Vec<MemberAddress>) -> Self {
        Self {
            success: false,
            server_time: None,
            server_version: None,
            is_replica: None,
            leader,
            members,
            error: Some(error.into()),
        }
    }
}
