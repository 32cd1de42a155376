use crate::inventory::InventorySource;
use crudapp_common::MemberAddress;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Ordered snapshot of known cluster members.
///
/// Snapshots are immutable; discovery swaps in a whole new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDirectory {
    members: Arc<[MemberAddress]>,
}

impl InstanceDirectory {
    pub fn new(members: Vec<MemberAddress>) -> Self {
        Self {
            members: members.into(),
        }
    }

    pub fn members(&self) -> &[MemberAddress] {
        &self.members
    }

    pub fn first(&self) -> Option<&MemberAddress> {
        self.members.first()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &MemberAddress) -> bool {
        self.members.contains(member)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberAddress> {
        self.members.iter()
    }
}

impl From<Vec<MemberAddress>> for InstanceDirectory {
    fn from(members: Vec<MemberAddress>) -> Self {
        Self::new(members)
    }
}

/// Keeps the directory in sync with an inventory source
pub struct Discovery {
    source: Arc<dyn InventorySource>,
    directory: RwLock<InstanceDirectory>,
}

impl Discovery {
    pub fn new(source: Arc<dyn InventorySource>) -> Self {
        Self {
            source,
            directory: RwLock::new(InstanceDirectory::default()),
        }
    }

    /// Current snapshot
    pub fn directory(&self) -> InstanceDirectory {
        self.directory.read().clone()
    }

    /// Refresh the directory from the inventory source.
    ///
    /// Never fails: when the source errors the previous directory is kept
    /// and returned. A successful empty answer replaces the directory.
    pub async fn discover(&self) -> InstanceDirectory {
        info!("Discovering cluster members from {}", self.source.describe());
        let started = Instant::now();

        match self.source.list_members().await {
            Ok(members) => {
                let directory = InstanceDirectory::new(members);
                if directory.is_empty() {
                    warn!("No running cluster members found");
                } else {
                    info!(
                        members = ?directory.members(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Discovered {} cluster members",
                        directory.len()
                    );
                }

                *self.directory.write() = directory.clone();
                metrics::counter!("crudapp_cluster_discovery_total", "outcome" => "success").increment(1);
                metrics::gauge!("crudapp_cluster_members").set(directory.len() as f64);
                directory
            }
            Err(e) => {
                let previous = self.directory();
                warn!(
                    error = %format!("{:#}", e),
                    kept = previous.len(),
                    "Failed to discover cluster members, keeping previous directory"
                );
                metrics::counter!("crudapp_cluster_discovery_total", "outcome" => "failure").increment(1);
                previous
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replays scripted inventory answers, `None` meaning "source unreachable"
    struct ScriptedInventory {
        answers: Mutex<Vec<Option<Vec<&'static str>>>>,
    }

    impl ScriptedInventory {
        fn new(answers: Vec<Option<Vec<&'static str>>>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
            }
        }
    }

    #[async_trait]
    impl InventorySource for ScriptedInventory {
        async fn list_members(&self) -> anyhow::Result<Vec<MemberAddress>> {
            match self.answers.lock().pop().flatten() {
                Some(hosts) => Ok(hosts.into_iter().map(MemberAddress::from).collect()),
                None => anyhow::bail!("inventory unreachable"),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[tokio::test]
    async fn test_discover_replaces_directory_wholesale() {
        let discovery = Discovery::new(Arc::new(ScriptedInventory::new(vec![
            Some(vec!["a", "b"]),
            Some(vec!["c"]),
        ])));

        let first = discovery.discover().await;
        assert_eq!(first.members(), &[MemberAddress::from("a"), MemberAddress::from("b")]);

        let second = discovery.discover().await;
        assert_eq!(second.members(), &[MemberAddress::from("c")]);
        assert_eq!(discovery.directory(), second);

        // Earlier snapshots are unaffected by the swap
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_discover_failure_keeps_previous_directory() {
        let discovery = Discovery::new(Arc::new(ScriptedInventory::new(vec![
            Some(vec!["a", "b"]),
            None,
        ])));

        discovery.discover().await;
        let after_failure = discovery.discover().await;

        assert_eq!(after_failure.len(), 2);
        assert!(after_failure.contains(&MemberAddress::from("a")));
    }

    #[tokio::test]
    async fn test_empty_answer_is_a_successful_discovery() {
        let discovery = Discovery::new(Arc::new(ScriptedInventory::new(vec![
            Some(vec!["a"]),
            Some(vec![]),
        ])));

        discovery.discover().await;
        let empty = discovery.discover().await;

        assert!(empty.is_empty());
        assert!(discovery.directory().is_empty());
    }
}
