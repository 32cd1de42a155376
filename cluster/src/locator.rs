use crate::directory::InstanceDirectory;
use crate::probe::LeaderProbe;
use crudapp_common::MemberAddress;
use std::sync::Arc;
use tracing::{info, warn};

/// Finds the current leader by probing members in directory order
pub struct LeaderLocator {
    probe: Arc<dyn LeaderProbe>,
    fallback_to_first: bool,
}

impl LeaderLocator {
    pub fn new(probe: Arc<dyn LeaderProbe>, fallback_to_first: bool) -> Self {
        Self {
            probe,
            fallback_to_first,
        }
    }

    pub fn probe(&self) -> &Arc<dyn LeaderProbe> {
        &self.probe
    }

    /// First member confirming leadership.
    ///
    /// When nobody confirms (election window, probe outage) the first member
    /// is returned if fallback is enabled; `None` for an empty directory.
    pub async fn locate(&self, directory: &InstanceDirectory) -> Option<MemberAddress> {
        info!("Searching for leader among {} members", directory.len());

        for member in directory.iter() {
            if self.probe.is_leader(member).await {
                info!(member = %member, "Found leader");
                return Some(member.clone());
            }
        }

        match directory.first() {
            Some(first) if self.fallback_to_first => {
                warn!(member = %first, "No leader confirmed, using first available member");
                Some(first.clone())
            }
            Some(_) => {
                warn!("No leader confirmed and fallback is disabled");
                None
            }
            None => None,
        }
    }
}
