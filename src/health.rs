//! Node health oracle and the host-retry helper.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::db::{DbError, Tx};
use crate::entities::{ClusterEntry, NodeEntry};
use crate::executor::{ExecFuture, ExecutorError};

/// Source of recent node health observations.
pub trait NodeHealth: Send + Sync {
    /// Node id mapped to whether it was recently healthy. Nodes missing from
    /// the map are assumed healthy.
    fn current_node_health(&self) -> BTreeMap<String, bool>;
}

/// Oracle that never reports a node down.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllNodesUp;

impl NodeHealth for AllNodesUp {
    fn current_node_health(&self) -> BTreeMap<String, bool> {
        BTreeMap::new()
    }
}

/// Health map updated by an external monitor.
#[derive(Debug, Default)]
pub struct NodeHealthCache {
    status: RwLock<BTreeMap<String, bool>>,
}

impl NodeHealthCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest observation for `node_id`.
    pub fn set(&self, node_id: &str, up: bool) {
        self.status.write().insert(node_id.to_owned(), up);
    }

    /// Forgets every observation.
    pub fn clear(&self) {
        self.status.write().clear();
    }
}

impl NodeHealth for NodeHealthCache {
    fn current_node_health(&self) -> BTreeMap<String, bool> {
        self.status.read().clone()
    }
}

/// Nodes of `cluster_id` in membership order, skipping nodes the oracle
/// reports down.
///
/// # Errors
///
/// Returns [`DbError`] when the cluster or a node cannot be loaded.
pub fn cluster_nodes(
    tx: &Tx<'_>,
    cluster_id: &str,
    health: &dyn NodeHealth,
) -> Result<Vec<NodeEntry>, DbError> {
    let cluster = tx.load::<ClusterEntry>(cluster_id)?;
    let status = health.current_node_health();
    let mut nodes = Vec::with_capacity(cluster.nodes.len());
    for node_id in &cluster.nodes {
        let node = tx.load::<NodeEntry>(node_id)?;
        if status.get(node_id) == Some(&false) {
            tracing::debug!(node = %node_id, host = %node.manage_hostname, "skipping node presumed unhealthy");
            continue;
        }
        nodes.push(node);
    }
    Ok(nodes)
}

/// Management hostnames of [`cluster_nodes`].
///
/// # Errors
///
/// Returns [`DbError`] when the cluster or a node cannot be loaded.
pub fn cluster_hosts(
    tx: &Tx<'_>,
    cluster_id: &str,
    health: &dyn NodeHealth,
) -> Result<Vec<String>, DbError> {
    Ok(cluster_nodes(tx, cluster_id, health)?
        .into_iter()
        .map(|node| node.manage_hostname)
        .collect())
}

/// Runs `attempt` against each host in turn until one succeeds.
///
/// "Does not exist" and "already exists" outcomes are final and returned
/// straight away. Any other failure moves on to the next host.
///
/// # Errors
///
/// Returns the last failure once every host has been tried, or
/// [`ExecutorError::NoHostsAvailable`] when `hosts` is empty.
pub async fn run_on_host<'a, T, F>(hosts: &[String], mut attempt: F) -> Result<T, ExecutorError>
where
    F: FnMut(String) -> ExecFuture<'a, T>,
{
    let mut last = ExecutorError::NoHostsAvailable;
    for host in hosts {
        match attempt(host.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_not_found() || err.is_already_exists() => return Err(err),
            Err(err) => {
                tracing::warn!(host = %host, error = %err, "remote call failed, trying next host");
                last = err;
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::test_support::setup_sample_topology;
    use rstest::rstest;

    #[rstest]
    fn down_nodes_are_skipped_and_unknown_nodes_kept() {
        let db = Db::temporary().expect("temporary store");
        let topology = setup_sample_topology(&db, 1, 3, 1, 1024).expect("topology");
        let cache = NodeHealthCache::new();
        let second = topology.nodes.get(1).expect("three nodes");
        cache.set(second, false);
        let cluster = topology.clusters.first().expect("one cluster");
        let hosts = db
            .view(|tx| cluster_hosts(tx, cluster, &cache))
            .expect("hosts");
        assert_eq!(hosts, ["manage-0-0", "manage-0-2"]);
    }

    #[rstest]
    #[tokio::test]
    async fn generic_failures_move_to_the_next_host() {
        let hosts = vec![String::from("a"), String::from("b")];
        let mut tried = Vec::new();
        let result = run_on_host(&hosts, |host| {
            tried.push(host.clone());
            Box::pin(async move {
                if host == "a" {
                    Err(ExecutorError::Command {
                        host,
                        message: String::from("boom"),
                    })
                } else {
                    Ok(host)
                }
            })
        })
        .await;
        assert_eq!(result, Ok(String::from("b")));
        assert_eq!(tried, ["a", "b"]);
    }

    #[rstest]
    #[tokio::test]
    async fn missing_targets_stop_the_search() {
        let hosts = vec![String::from("a"), String::from("b")];
        let mut calls = 0_u32;
        let result: Result<(), _> = run_on_host(&hosts, |_host| {
            calls += 1;
            Box::pin(async {
                Err(ExecutorError::NotFound {
                    target: String::from("vol"),
                })
            })
        })
        .await;
        assert!(result.is_err_and(|err| err.is_not_found()));
        assert_eq!(calls, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn no_hosts_is_reported() {
        let result: Result<(), _> =
            run_on_host(&[], |_host| Box::pin(async { Ok(()) })).await;
        assert_eq!(result, Err(ExecutorError::NoHostsAvailable));
    }
}
