//! Cluster records and their membership back-references.

use serde::{Deserialize, Serialize};

use crate::db::{Bucket, Record};
use crate::ids::generate_id;

/// A group of storage nodes that volumes are placed within.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClusterEntry {
    /// Cluster identifier.
    pub id: String,
    /// Member node ids.
    pub nodes: Vec<String>,
    /// Volume ids placed on this cluster.
    pub volumes: Vec<String>,
    /// Block volume ids placed on this cluster.
    pub block_volumes: Vec<String>,
    /// Whether regular file volumes may be placed here.
    pub file: bool,
    /// Whether block-hosting volumes may be placed here.
    pub block: bool,
}

impl Record for ClusterEntry {
    const BUCKET: Bucket = Bucket::Cluster;

    fn record_id(&self) -> &str {
        &self.id
    }
}

pub(super) fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_owned());
    }
}

pub(super) fn drop_id(list: &mut Vec<String>, id: &str) {
    list.retain(|existing| existing != id);
}

impl ClusterEntry {
    /// Creates an empty cluster accepting both file and block volumes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: generate_id(),
            file: true,
            block: true,
            ..Self::default()
        }
    }

    /// Records node membership.
    pub fn node_add(&mut self, id: &str) {
        push_unique(&mut self.nodes, id);
    }

    /// Records a volume placed on this cluster.
    pub fn volume_add(&mut self, id: &str) {
        push_unique(&mut self.volumes, id);
    }

    /// Drops a volume from this cluster.
    pub fn volume_delete(&mut self, id: &str) {
        drop_id(&mut self.volumes, id);
    }

    /// Records a block volume placed on this cluster.
    pub fn block_volume_add(&mut self, id: &str) {
        push_unique(&mut self.block_volumes, id);
    }

    /// Drops a block volume from this cluster.
    pub fn block_volume_delete(&mut self, id: &str) {
        drop_id(&mut self.block_volumes, id);
    }
}
