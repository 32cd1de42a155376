//! Inventory sources: where the list of cluster members comes from.
//!
//! Supported sources:
//! - EC2: running instances matching a tag filter, queried through the AWS CLI
//! - Static: fixed list of hosts from configuration
//! - DNS: every address a hostname resolves to

use anyhow::{bail, Context};
use async_trait::async_trait;
use crudapp_common::{ClusterConfig, InventoryConfig, MemberAddress};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Query-by-tag source of running member addresses
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// List the addresses of every running member. An empty list is a valid answer.
    async fn list_members(&self) -> anyhow::Result<Vec<MemberAddress>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Build the source configured in `config.inventory`
pub fn inventory_from_config(config: &ClusterConfig) -> Arc<dyn InventorySource> {
    match &config.inventory {
        InventoryConfig::Ec2 { region } => {
            Arc::new(Ec2Inventory::new(region.clone(), config.instance_tags.clone()))
        }
        InventoryConfig::Static { hosts } => Arc::new(StaticInventory::new(hosts.clone())),
        InventoryConfig::Dns { hostname } => {
            Arc::new(DnsInventory::new(hostname.clone(), config.port))
        }
    }
}

/// EC2 instances in the `running` state carrying every configured tag
pub struct Ec2Inventory {
    region: String,
    tags: BTreeMap<String, String>,
    program: String,
}

impl Ec2Inventory {
    pub fn new(region: String, tags: BTreeMap<String, String>) -> Self {
        Self {
            region,
            tags,
            program: "aws".to_string(),
        }
    }

    /// Use a different executable than `aws` (wrappers, tests)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self) -> Vec<String> {
        describe_instances_args(&self.region, &self.tags)
    }
}

/// Arguments for `aws ec2 describe-instances` returning private IPs as JSON
pub fn describe_instances_args(region: &str, tags: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = vec![
        "ec2".to_string(),
        "describe-instances".to_string(),
        "--region".to_string(),
        region.to_string(),
        "--filters".to_string(),
        "Name=instance-state-name,Values=running".to_string(),
    ];
    args.extend(
        tags.iter()
            .map(|(key, value)| format!("Name=tag:{},Values={}", key, value)),
    );
    args.extend([
        "--query".to_string(),
        "Reservations[].Instances[].PrivateIpAddress".to_string(),
        "--output".to_string(),
        "json".to_string(),
    ]);
    args
}

/// Parse the JSON array printed by `describe-instances`, dropping empty entries
pub fn parse_describe_output(stdout: &str) -> anyhow::Result<Vec<MemberAddress>> {
    let values: Vec<Option<String>> = serde_json::from_str(stdout.trim())
        .context("unexpected describe-instances output")?;

    Ok(values
        .into_iter()
        .flatten()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty() && ip != "None")
        .map(MemberAddress::from)
        .collect())
}

#[async_trait]
impl InventorySource for Ec2Inventory {
    async fn list_members(&self) -> anyhow::Result<Vec<MemberAddress>> {
        let output = Command::new(&self.program)
            .args(self.args())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(region = %self.region, "AWS CLI warnings: {}", stderr.trim());
        }
        if !output.status.success() {
            bail!("describe-instances exited with {}", output.status);
        }

        parse_describe_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn describe(&self) -> String {
        format!("ec2(region={}, tags={:?})", self.region, self.tags)
    }
}

/// Fixed member list
pub struct StaticInventory {
    members: Vec<MemberAddress>,
}

impl StaticInventory {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MemberAddress>,
    {
        Self {
            members: hosts
                .into_iter()
                .map(Into::into)
                .filter(|m: &MemberAddress| !m.host().is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn list_members(&self) -> anyhow::Result<Vec<MemberAddress>> {
        Ok(self.members.clone())
    }

    fn describe(&self) -> String {
        format!("static({} hosts)", self.members.len())
    }
}

/// Members resolved from a DNS name (one per distinct IP, resolver order kept)
pub struct DnsInventory {
    hostname: String,
    port: u16,
}

impl DnsInventory {
    pub fn new(hostname: String, port: u16) -> Self {
        Self { hostname, port }
    }
}

#[async_trait]
impl InventorySource for DnsInventory {
    async fn list_members(&self) -> anyhow::Result<Vec<MemberAddress>> {
        let addrs = tokio::net::lookup_host((self.hostname.as_str(), self.port))
            .await
            .with_context(|| format!("failed to resolve {}", self.hostname))?;

        let mut members: Vec<MemberAddress> = Vec::new();
        for addr in addrs {
            let member = MemberAddress::from(addr.ip().to_string());
            if !members.contains(&member) {
                members.push(member);
            }
        }

        debug!(hostname = %self.hostname, count = members.len(), "Resolved cluster members");
        Ok(members)
    }

    fn describe(&self) -> String {
        format!("dns({})", self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_instances_args_include_tag_filters() {
        let mut tags = BTreeMap::new();
        tags.insert("Role".to_string(), "postgresql-patroni".to_string());
        tags.insert("Tier".to_string(), "database".to_string());

        let args = describe_instances_args("eu-west-1", &tags);

        assert_eq!(&args[..4], &["ec2", "describe-instances", "--region", "eu-west-1"]);
        assert!(args.contains(&"Name=instance-state-name,Values=running".to_string()));
        assert!(args.contains(&"Name=tag:Role,Values=postgresql-patroni".to_string()));
        assert!(args.contains(&"Name=tag:Tier,Values=database".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("json"));
    }

    #[test]
    fn test_parse_describe_output_drops_missing_ips() {
        let stdout = "[\n  \"10.0.1.10\",\n  null,\n  \"None\",\n  \"10.0.2.11\"\n]\n";
        let members = parse_describe_output(stdout).unwrap();
        assert_eq!(
            members,
            vec![MemberAddress::from("10.0.1.10"), MemberAddress::from("10.0.2.11")]
        );
    }

    #[test]
    fn test_parse_describe_output_empty_and_malformed() {
        assert!(parse_describe_output("[]").unwrap().is_empty());
        assert!(parse_describe_output("An error occurred (AuthFailure)").is_err());
    }

    #[tokio::test]
    async fn test_static_inventory_skips_blank_hosts() {
        let inventory = StaticInventory::new(vec!["10.0.0.1", " ", "10.0.0.2"]);
        let members = inventory.list_members().await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(inventory.describe(), "static(2 hosts)");
    }

    #[tokio::test]
    async fn test_dns_inventory_resolves_localhost() {
        let inventory = DnsInventory::new("localhost".to_string(), 5432);
        let members = inventory.list_members().await.unwrap();
        assert!(!members.is_empty());
    }

    #[tokio::test]
    async fn test_ec2_inventory_missing_program_is_an_error() {
        let inventory = Ec2Inventory::new("eu-west-1".to_string(), BTreeMap::new())
            .with_program("definitely-not-an-aws-cli-binary");
        assert!(inventory.list_members().await.is_err());
    }
}
