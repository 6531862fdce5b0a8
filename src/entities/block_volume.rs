//! Block volume records.

use serde::{Deserialize, Serialize};

use super::{PendingEntity, PendingMarker};
use crate::db::{Bucket, Record};
use crate::ids::generate_id;

/// iSCSI connection details reported when a block volume is created.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockConnection {
    /// Target portal hosts.
    pub hosts: Vec<String>,
    /// Target IQN.
    pub iqn: String,
    /// Logical unit number.
    pub lun: u32,
    /// CHAP user, when auth is enabled.
    pub username: String,
    /// CHAP secret, when auth is enabled.
    pub password: String,
}

/// Descriptive attributes of a block volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockVolumeInfo {
    /// Block volume identifier.
    pub id: String,
    /// Block volume name.
    pub name: String,
    /// Size in GiB.
    pub size: u64,
    /// Owning cluster. Empty until placed.
    pub cluster_id: String,
    /// Hosting volume id. Empty until placed unless requested.
    pub hosting_volume: String,
    /// Number of target portals requested; zero means every node.
    pub hacount: u32,
    /// Whether CHAP auth is enabled.
    pub auth: bool,
    /// Connection details, filled in after creation.
    pub connection: BlockConnection,
}

/// A block device exported from a block-hosting volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockVolumeEntry {
    /// Block volume attributes.
    pub info: BlockVolumeInfo,
    /// Owning operation, if pending.
    pub pending: PendingMarker,
}

impl Record for BlockVolumeEntry {
    const BUCKET: Bucket = Bucket::BlockVolume;

    fn record_id(&self) -> &str {
        &self.info.id
    }
}

impl PendingEntity for BlockVolumeEntry {
    fn entity_id(&self) -> &str {
        &self.info.id
    }

    fn pending(&self) -> &PendingMarker {
        &self.pending
    }

    fn pending_mut(&mut self) -> &mut PendingMarker {
        &mut self.pending
    }
}

impl BlockVolumeEntry {
    /// Creates an unplaced block volume of `size` GiB. An empty `name`
    /// becomes `blockvol_<id>`.
    #[must_use]
    pub fn new(name: &str, size: u64, hacount: u32, auth: bool) -> Self {
        let id = generate_id();
        let resolved = if name.trim().is_empty() {
            format!("blockvol_{id}")
        } else {
            name.trim().to_owned()
        };
        Self {
            info: BlockVolumeInfo {
                id,
                name: resolved,
                size,
                hacount,
                auth,
                ..BlockVolumeInfo::default()
            },
            pending: PendingMarker::Unowned,
        }
    }
}
