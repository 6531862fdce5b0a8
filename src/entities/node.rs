//! Storage node records.

use serde::{Deserialize, Serialize};

use super::EntryState;
use super::cluster::push_unique;
use crate::db::{Bucket, Record};
use crate::ids::generate_id;

/// A storage host within a cluster.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeEntry {
    /// Node identifier.
    pub id: String,
    /// Owning cluster.
    pub cluster_id: String,
    /// Failure zone used to spread replicas.
    pub zone: u32,
    /// Hostname the executor connects to.
    pub manage_hostname: String,
    /// Hostname used in brick paths and block targets.
    pub storage_hostname: String,
    /// Administrative state.
    pub state: EntryState,
    /// Device ids attached to this node.
    pub devices: Vec<String>,
}

impl Record for NodeEntry {
    const BUCKET: Bucket = Bucket::Node;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl NodeEntry {
    /// Creates an online node in `cluster_id`.
    #[must_use]
    pub fn new(
        cluster_id: impl Into<String>,
        manage_hostname: impl Into<String>,
        storage_hostname: impl Into<String>,
        zone: u32,
    ) -> Self {
        Self {
            id: generate_id(),
            cluster_id: cluster_id.into(),
            zone,
            manage_hostname: manage_hostname.into(),
            storage_hostname: storage_hostname.into(),
            state: EntryState::Online,
            devices: Vec::new(),
        }
    }

    /// Records an attached device.
    pub fn device_add(&mut self, id: &str) {
        push_unique(&mut self.devices, id);
    }

    /// Returns `true` when the node accepts new bricks.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state == EntryState::Online
    }
}
