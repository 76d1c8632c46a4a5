//! The token ring and replica location.
//!
//! Replicas are computed from the tokens of the nodes given in the
//! configuration and the replication strategy of the keyspace.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use super::Token;
use crate::cluster::{Node, NodeRef};

/// Replicas of one token. Usually no more than a handful, so kept inline.
pub type ReplicaSet<'a> = SmallVec<[NodeRef<'a>; 8]>;

/// A sorted list of (token, element) pairs that is traversed circularly.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Iterates over the ring's elements starting at the first token not lower than `token`,
    /// wrapping around once. Every member is visited exactly once.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        let start = self.ring.partition_point(|(t, _)| *t < token);
        self.ring[start..]
            .iter()
            .chain(self.ring[..start].iter())
            .map(|(_, elem)| elem)
    }

    /// The owner of `token`: the first ring member at or after it.
    pub fn get_elem_for_token(&self, token: Token) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    /// Get the total number of members in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` if the token ring contains no elements.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// How a keyspace places its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplicationStrategy {
    /// `replication_factor` consecutive distinct nodes of the ring.
    Simple {
        /// Number of replicas.
        replication_factor: usize,
    },
    /// Per datacenter, that many consecutive distinct nodes of the datacenter.
    NetworkTopology {
        /// Number of replicas in each datacenter.
        datacenter_repfactors: HashMap<String, usize>,
    },
    /// Data lives on the coordinator only; there are no replicas to route to.
    Local,
}

/// Finds the replicas of a token.
#[derive(Debug, Clone)]
pub struct ReplicaLocator {
    ring: TokenRing<Arc<Node>>,
    unique_nodes: usize,
    nodes_per_datacenter: HashMap<String, usize>,
}

impl ReplicaLocator {
    pub(crate) fn new<'a>(nodes: impl Iterator<Item = &'a Arc<Node>>) -> Self {
        let mut unique_nodes = 0;
        let mut nodes_per_datacenter: HashMap<String, usize> = HashMap::new();
        let mut ring = Vec::new();

        for node in nodes.filter(|node| !node.tokens.is_empty()) {
            unique_nodes += 1;
            if let Some(dc) = &node.datacenter {
                *nodes_per_datacenter.entry(dc.clone()).or_default() += 1;
            }
            ring.extend(node.tokens.iter().map(|token| (*token, node.clone())));
        }

        ReplicaLocator {
            ring: TokenRing::new(ring.into_iter()),
            unique_nodes,
            nodes_per_datacenter,
        }
    }

    /// The token ring of all nodes that own tokens.
    pub fn ring(&self) -> &TokenRing<Arc<Node>> {
        &self.ring
    }

    /// Replicas of `token` under `strategy`, primary replica first.
    pub fn replicas_for_token<'a>(
        &'a self,
        token: Token,
        strategy: &ReplicationStrategy,
    ) -> ReplicaSet<'a> {
        let mut replicas = ReplicaSet::new();
        match strategy {
            ReplicationStrategy::Simple { replication_factor } => {
                let wanted = (*replication_factor).min(self.unique_nodes);
                for node in self.ring.ring_range(token) {
                    if replicas.len() == wanted {
                        break;
                    }
                    if !contains(&replicas, node) {
                        replicas.push(node);
                    }
                }
            }
            ReplicationStrategy::NetworkTopology {
                datacenter_repfactors,
            } => {
                // Replication factors above the datacenter size are capped by it.
                let mut missing: HashMap<&str, usize> = datacenter_repfactors
                    .iter()
                    .map(|(dc, rf)| {
                        let in_dc = self.nodes_per_datacenter.get(dc).copied().unwrap_or(0);
                        (dc.as_str(), (*rf).min(in_dc))
                    })
                    .filter(|(_, wanted)| *wanted > 0)
                    .collect();

                for node in self.ring.ring_range(token) {
                    if missing.is_empty() {
                        break;
                    }
                    let Some(dc) = node.datacenter.as_deref() else {
                        continue;
                    };
                    let Some(left) = missing.get_mut(dc) else {
                        continue;
                    };
                    if contains(&replicas, node) {
                        continue;
                    }
                    replicas.push(node);
                    *left -= 1;
                    if *left == 0 {
                        missing.remove(dc);
                    }
                }
            }
            ReplicationStrategy::Local => {}
        }
        replicas
    }
}

fn contains(replicas: &ReplicaSet<'_>, node: &Arc<Node>) -> bool {
    replicas.iter().any(|r| Arc::ptr_eq(r, node))
}
