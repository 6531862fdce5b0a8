//! Brick layout and device selection.
//!
//! Placement is metadata only: it reads the topology and returns unsaved
//! [`BrickEntry`] values. Callers reserve device space and persist the bricks
//! inside their own transaction.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::db::{DbError, Tx};
use crate::entities::{
    BrickEntry, ClusterEntry, DeviceEntry, Durability, KIB_PER_GIB, NodeEntry,
};

/// Raised when bricks cannot be placed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlacementError {
    /// The cluster has no nodes.
    #[error("cluster has no nodes")]
    EmptyCluster,
    /// The cluster has no online devices on online nodes.
    #[error("cluster has no online storage devices")]
    NoStorage,
    /// Not enough free space on distinct nodes.
    #[error("no space available to satisfy the request")]
    NoSpace,
    /// Splitting the volume further would make bricks too small.
    #[error("minimum brick size limit reached, out of space")]
    MinimumBrickSize,
    /// Splitting the volume further would exceed the brick count limit.
    #[error("maximum number of bricks reached")]
    MaxBricks,
    /// No candidate cluster accepts this kind of volume.
    #[error("no clusters are configured for this volume type")]
    NoClusters,
    /// Store access failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Bounds applied when splitting a volume into bricks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BrickLimits {
    /// Largest brick in GiB.
    pub max_size_gib: u64,
    /// Smallest brick in GiB.
    pub min_size_gib: u64,
    /// Most bricks a volume may have.
    pub max_bricks: usize,
}

impl Default for BrickLimits {
    fn default() -> Self {
        Self {
            max_size_gib: 4096,
            min_size_gib: 1,
            max_bricks: 32,
        }
    }
}

/// How a volume is split into brick sets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BrickLayout {
    /// Number of brick sets.
    pub sets: usize,
    /// Bricks per set.
    pub set_size: usize,
    /// Usable size of each brick in KiB.
    pub brick_size_kib: u64,
}

impl BrickLayout {
    /// Smallest layout whose bricks fit under the size limit.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::MinimumBrickSize`] or
    /// [`PlacementError::MaxBricks`] when no layout satisfies `limits`.
    pub fn for_volume(
        size_gib: u64,
        durability: Durability,
        limits: BrickLimits,
    ) -> Result<Self, PlacementError> {
        let mut layout = Self::with_sets(size_gib, durability, limits, 1)?;
        while layout.brick_size_kib > limits.max_size_gib.saturating_mul(KIB_PER_GIB) {
            layout = layout.split(size_gib, durability, limits)?;
        }
        Ok(layout)
    }

    /// The same volume spread over twice as many sets.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::MinimumBrickSize`] or
    /// [`PlacementError::MaxBricks`] when the split breaks `limits`.
    pub fn split(
        self,
        size_gib: u64,
        durability: Durability,
        limits: BrickLimits,
    ) -> Result<Self, PlacementError> {
        Self::with_sets(size_gib, durability, limits, self.sets.saturating_mul(2))
    }

    fn with_sets(
        size_gib: u64,
        durability: Durability,
        limits: BrickLimits,
        sets: usize,
    ) -> Result<Self, PlacementError> {
        let set_size = usize::try_from(durability.set_size()).unwrap_or(usize::MAX);
        if sets.saturating_mul(set_size) > limits.max_bricks {
            return Err(PlacementError::MaxBricks);
        }
        let divisor = u64::try_from(sets)
            .unwrap_or(u64::MAX)
            .saturating_mul(u64::from(durability.data_bricks()).max(1));
        let brick_size_kib = size_gib.saturating_mul(KIB_PER_GIB).div_ceil(divisor);
        if brick_size_kib < limits.min_size_gib.saturating_mul(KIB_PER_GIB) {
            return Err(PlacementError::MinimumBrickSize);
        }
        Ok(Self {
            sets,
            set_size,
            brick_size_kib,
        })
    }

    /// Total bricks in the layout.
    #[must_use]
    pub const fn brick_count(&self) -> usize {
        self.sets.saturating_mul(self.set_size)
    }
}

/// What to place.
#[derive(Clone, Debug)]
pub struct PlacementRequest<'a> {
    /// Volume size in GiB.
    pub size_gib: u64,
    /// Data protection scheme.
    pub durability: Durability,
    /// Thin pool factor in percent.
    pub snapshot_factor: u64,
    /// Volume the bricks belong to.
    pub volume_id: &'a str,
    /// Splitting bounds.
    pub limits: BrickLimits,
}

/// A successful placement.
#[derive(Clone, Debug)]
pub struct Placement {
    /// Cluster the bricks were placed in.
    pub cluster_id: String,
    /// Layout that fit.
    pub layout: BrickLayout,
    /// Unsaved bricks, in set order.
    pub bricks: Vec<BrickEntry>,
}

/// Online devices on online nodes of `cluster_id`.
///
/// # Errors
///
/// Returns [`PlacementError::EmptyCluster`] when the cluster has no nodes,
/// [`PlacementError::NoStorage`] when none of its devices are usable, or the
/// store error.
pub fn online_devices(tx: &Tx<'_>, cluster_id: &str) -> Result<Vec<DeviceEntry>, PlacementError> {
    let cluster = tx.load::<ClusterEntry>(cluster_id)?;
    if cluster.nodes.is_empty() {
        return Err(PlacementError::EmptyCluster);
    }
    let mut devices = Vec::new();
    for node_id in &cluster.nodes {
        let node = tx.load::<NodeEntry>(node_id)?;
        if !node.is_online() {
            continue;
        }
        for device_id in &node.devices {
            let device = tx.load::<DeviceEntry>(device_id)?;
            if device.is_online() {
                devices.push(device);
            }
        }
    }
    if devices.is_empty() {
        return Err(PlacementError::NoStorage);
    }
    Ok(devices)
}

/// Device with the most free space that can hold `need` KiB and is not on
/// one of `skip_nodes`. Ties go to the lowest id.
#[must_use]
pub fn best_fit<'a>(
    devices: &'a [DeviceEntry],
    free: &BTreeMap<String, u64>,
    need: u64,
    skip_nodes: &BTreeSet<String>,
) -> Option<&'a DeviceEntry> {
    devices
        .iter()
        .filter(|device| !skip_nodes.contains(&device.node_id))
        .map(|device| {
            let available = free.get(&device.id).copied().unwrap_or(device.free_size);
            (device, available)
        })
        .filter(|(_, available)| *available >= need)
        .max_by(|(left, left_free), (right, right_free)| {
            left_free
                .cmp(right_free)
                .then_with(|| right.id.cmp(&left.id))
        })
        .map(|(device, _)| device)
}

/// Chooses devices for every brick of `layout` within one cluster.
///
/// # Errors
///
/// Returns [`PlacementError::NoSpace`] when some set cannot be placed on
/// distinct nodes, or the errors of [`online_devices`].
pub fn allocate_bricks(
    tx: &Tx<'_>,
    cluster_id: &str,
    layout: BrickLayout,
    snapshot_factor: u64,
    volume_id: &str,
) -> Result<Vec<BrickEntry>, PlacementError> {
    let devices = online_devices(tx, cluster_id)?;
    let mut free: BTreeMap<String, u64> = devices
        .iter()
        .map(|device| (device.id.clone(), device.free_size))
        .collect();
    let mut bricks = Vec::with_capacity(layout.brick_count());
    for _ in 0..layout.sets {
        let mut used_nodes = BTreeSet::new();
        for _ in 0..layout.set_size {
            let template = BrickEntry::new(layout.brick_size_kib, snapshot_factor, "", "", volume_id);
            let need = template.total_size();
            let device =
                best_fit(&devices, &free, need, &used_nodes).ok_or(PlacementError::NoSpace)?;
            if let Some(remaining) = free.get_mut(&device.id) {
                *remaining = remaining.saturating_sub(need);
            }
            used_nodes.insert(device.node_id.clone());
            bricks.push(BrickEntry {
                device_id: device.id.clone(),
                node_id: device.node_id.clone(),
                ..template
            });
        }
    }
    Ok(bricks)
}

/// Places a volume in one cluster, splitting it into more sets while space
/// runs out.
///
/// # Errors
///
/// Returns the last [`PlacementError`] once no split fits.
pub fn allocate_in_cluster(
    tx: &Tx<'_>,
    cluster_id: &str,
    request: &PlacementRequest<'_>,
) -> Result<Placement, PlacementError> {
    let mut layout = BrickLayout::for_volume(request.size_gib, request.durability, request.limits)?;
    loop {
        match allocate_bricks(
            tx,
            cluster_id,
            layout,
            request.snapshot_factor,
            request.volume_id,
        ) {
            Ok(bricks) => {
                return Ok(Placement {
                    cluster_id: cluster_id.to_owned(),
                    layout,
                    bricks,
                });
            }
            Err(PlacementError::NoSpace) => {
                layout = layout.split(request.size_gib, request.durability, request.limits)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Per-cluster placement failures.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MultiClusterError {
    errors: BTreeMap<String, PlacementError>,
}

impl MultiClusterError {
    /// Records the failure of `cluster`.
    pub fn add(&mut self, cluster: &str, err: PlacementError) {
        self.errors.insert(cluster.to_owned(), err);
    }

    /// Number of clusters that failed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` when no failure was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// One caller-facing error: the shared error when every cluster failed
    /// the same way, [`PlacementError::NoSpace`] when they differ.
    #[must_use]
    pub fn shorten(&self) -> PlacementError {
        let mut errors = self.errors.values();
        let Some(first) = errors.next() else {
            return PlacementError::NoClusters;
        };
        if errors.all(|err| err == first) {
            first.clone()
        } else {
            PlacementError::NoSpace
        }
    }
}

/// Places a volume on the first of `clusters` that can hold it.
///
/// Space-shaped failures are reported as [`PlacementError::NoSpace`];
/// an empty cluster or one without storage keeps its own error. Store errors
/// stop the search.
///
/// # Errors
///
/// Returns [`MultiClusterError::shorten`] of the per-cluster failures.
pub fn allocate_across_clusters(
    tx: &Tx<'_>,
    clusters: &[String],
    request: &PlacementRequest<'_>,
) -> Result<Placement, PlacementError> {
    let mut failures = MultiClusterError::default();
    for cluster_id in clusters {
        match allocate_in_cluster(tx, cluster_id, request) {
            Ok(placement) => {
                tracing::debug!(cluster = %cluster_id, volume = %request.volume_id, "placed volume");
                return Ok(placement);
            }
            Err(
                PlacementError::NoSpace | PlacementError::MaxBricks | PlacementError::MinimumBrickSize,
            ) => {
                tracing::debug!(cluster = %cluster_id, "cluster cannot hold volume, trying next");
                failures.add(cluster_id, PlacementError::NoSpace);
            }
            Err(err @ (PlacementError::EmptyCluster | PlacementError::NoStorage)) => {
                tracing::debug!(cluster = %cluster_id, error = %err, "cluster unusable");
                failures.add(cluster_id, err);
            }
            Err(err) => return Err(err),
        }
    }
    if failures.len() > 1 {
        tracing::warn!(?failures, "unable to place volume on any cluster");
    }
    Err(failures.shorten())
}

/// Clusters a new volume may be placed in: `requested` when given, otherwise
/// every cluster, filtered by whether it accepts file or block-hosting
/// volumes.
///
/// # Errors
///
/// Returns [`DbError`] when a cluster cannot be loaded.
pub fn candidate_clusters(
    tx: &Tx<'_>,
    requested: &[String],
    block: bool,
) -> Result<Vec<String>, DbError> {
    let ids = if requested.is_empty() {
        tx.ids::<ClusterEntry>()?
    } else {
        requested.to_vec()
    };
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let cluster = tx.load::<ClusterEntry>(&id)?;
        if (block && cluster.block) || (!block && cluster.file) {
            out.push(id);
        }
    }
    Ok(out)
}
