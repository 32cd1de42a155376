use async_trait::async_trait;
use crudapp_common::{ClusterConfig, ClusterError, MemberAddress, Result};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Answers "is this member the writable leader right now?"
///
/// Implementations never fail: unreachable, follower and timeout all
/// collapse to `false`.
#[async_trait]
pub trait LeaderProbe: Send + Sync {
    async fn is_leader(&self, member: &MemberAddress) -> bool;
}

/// Probes the management endpoint of a member (Patroni `GET /master` by default)
pub struct HttpLeaderProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpLeaderProbe {
    pub fn new(port: u16, path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ClusterError::config(format!("failed to build leader probe client: {}", e)))?;

        Ok(Self {
            client,
            port,
            path: path.into(),
        })
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        Self::new(
            config.leader_probe_port,
            config.leader_probe_path.clone(),
            config.leader_probe_timeout(),
        )
    }

    fn url(&self, member: &MemberAddress) -> String {
        let host = member.host();
        if host.contains(':') && !host.starts_with('[') {
            format!("http://[{}]:{}{}", host, self.port, self.path)
        } else {
            format!("http://{}:{}{}", host, self.port, self.path)
        }
    }
}

#[async_trait]
impl LeaderProbe for HttpLeaderProbe {
    async fn is_leader(&self, member: &MemberAddress) -> bool {
        let url = self.url(member);

        match self.client.get(&url).send().await {
            Ok(response) => {
                let leader = response.status() == StatusCode::OK;
                debug!(member = %member, status = %response.status(), leader, "Leader probe answered");
                leader
            }
            Err(e) => {
                debug!(member = %member, error = %e, "Leader probe failed");
                false
            }
        }
    }
}

/// Treats every member as leader; used for single-host direct mode
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeLeaderProbe;

#[async_trait]
impl LeaderProbe for AssumeLeaderProbe {
    async fn is_leader(&self, _member: &MemberAddress) -> bool {
        true
    }
}
