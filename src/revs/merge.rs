//! Merging revision paths into a tree, and stemming old history.

use super::{Rev, RevError, RevNode, RevStatus, RevTree};

/// One entry of a [`RevPath`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathNode {
    pub hash: String,
    pub status: RevStatus,
    pub deleted: bool,
}

/// A linear history, oldest first, whose first node sits at generation `start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevPath {
    pub start: u64,
    pub ids: Vec<PathNode>,
}

impl RevPath {
    /// A single available revision with no known ancestry.
    pub fn single(rev: &Rev, deleted: bool) -> Self {
        Self {
            start: rev.pos,
            ids: vec![PathNode {
                hash: rev.hash.clone(),
                status: RevStatus::Available,
                deleted,
            }],
        }
    }

    /// A new revision `hash` whose parent is `parent`.
    pub fn child_of(parent: &Rev, hash: impl Into<String>, deleted: bool) -> Self {
        Self {
            start: parent.pos,
            ids: vec![
                PathNode {
                    hash: parent.hash.clone(),
                    status: RevStatus::Missing,
                    deleted: false,
                },
                PathNode {
                    hash: hash.into(),
                    status: RevStatus::Available,
                    deleted,
                },
            ],
        }
    }

    /// Builds a path from a `_revisions` record: the leaf generation and hashes newest first.
    /// Ancestors are marked missing, the leaf available.
    pub fn from_revisions(start: u64, ids: &[String], deleted: bool) -> Result<Self, RevError> {
        if ids.is_empty() || (ids.len() as u64) > start {
            return Err(RevError::Invalid(format!(
                "_revisions start {} with {} ids",
                start,
                ids.len()
            )));
        }
        let first = start - (ids.len() as u64 - 1);
        let last = ids.len() - 1;
        let nodes = ids
            .iter()
            .rev()
            .enumerate()
            .map(|(i, hash)| PathNode {
                hash: hash.clone(),
                status: if i == last {
                    RevStatus::Available
                } else {
                    RevStatus::Missing
                },
                deleted: i == last && deleted,
            })
            .collect();
        Ok(Self {
            start: first,
            ids: nodes,
        })
    }

    /// The newest revision on the path.
    pub fn leaf(&self) -> Option<Rev> {
        self.ids
            .last()
            .map(|n| Rev::new(self.start + self.ids.len() as u64 - 1, n.hash.clone()))
    }
}

/// How a merged path relates to the tree it was merged into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The path extended an existing leaf (or seeded an empty tree).
    NewLeaf,
    /// The path forked off an interior node or started a disjoint branch.
    NewBranch,
    /// The path's newest revision was already in the tree.
    InternalNode,
}

impl RevTree {
    /// Merges a path into the tree.
    ///
    /// Nodes already present are matched by (generation, hash). Their status can only be
    /// upgraded to available, and a stemmed root is re-attached to its parent when the path
    /// knows it.
    pub fn merge(&mut self, path: &RevPath) -> MergeOutcome {
        let was_empty = self.nodes.is_empty();
        let had_child = self.child_flags();
        let last = path.ids.len().saturating_sub(1);

        let mut prev: Option<usize> = None;
        // Parent of the first node this merge inserts.
        let mut anchor: Option<Option<usize>> = None;
        let mut leaf_existed = path.ids.is_empty();

        for (i, entry) in path.ids.iter().enumerate() {
            let pos = path.start + i as u64;
            match self.find(pos, &entry.hash) {
                Some(index) => {
                    let node = &mut self.nodes[index];
                    if entry.status == RevStatus::Available {
                        node.status = RevStatus::Available;
                    }
                    if node.parent.is_none() && prev.is_some() {
                        node.parent = prev;
                    }
                    if i == last {
                        leaf_existed = true;
                    }
                    prev = Some(index);
                }
                None => {
                    if anchor.is_none() {
                        anchor = Some(prev);
                    }
                    self.nodes.push(RevNode {
                        pos,
                        hash: entry.hash.clone(),
                        parent: prev,
                        deleted: entry.deleted,
                        status: entry.status,
                    });
                    prev = Some(self.nodes.len() - 1);
                }
            }
        }

        if leaf_existed {
            return MergeOutcome::InternalNode;
        }
        match anchor {
            Some(Some(parent)) if !had_child[parent] => MergeOutcome::NewLeaf,
            Some(None) if was_empty => MergeOutcome::NewLeaf,
            _ => MergeOutcome::NewBranch,
        }
    }

    /// Prunes history so every path keeps at most `limit` generations below its newest leaf.
    ///
    /// A node survives when some leaf below it is fewer than `limit` generations away, so
    /// each root-to-leaf path keeps its newest `limit` revisions. Children of pruned nodes
    /// become roots. Returns the removed revisions, oldest first.
    pub fn stem(&mut self, limit: usize) -> Vec<Rev> {
        if limit == 0 || self.nodes.is_empty() {
            return Vec::new();
        }

        // Generation of the nearest leaf below each node.
        let has_child = self.child_flags();
        let mut reach: Vec<u64> = self
            .nodes
            .iter()
            .zip(&has_child)
            .map(|(n, c)| if *c { u64::MAX } else { n.pos })
            .collect();
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|a, b| self.nodes[*b].pos.cmp(&self.nodes[*a].pos));
        for index in order {
            if let Some(p) = self.nodes[index].parent {
                reach[p] = reach[p].min(reach[index]);
            }
        }

        let keep: Vec<bool> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| reach[i] - n.pos < limit as u64)
            .collect();
        if keep.iter().all(|k| *k) {
            return Vec::new();
        }

        let mut remap: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut kept = Vec::with_capacity(self.nodes.len());
        let mut removed = Vec::new();
        for (i, node) in std::mem::take(&mut self.nodes).into_iter().enumerate() {
            if keep[i] {
                remap[i] = Some(kept.len());
                kept.push(node);
            } else {
                removed.push(node.rev());
            }
        }
        for node in &mut kept {
            node.parent = node.parent.and_then(|p| remap[p]);
        }
        self.nodes = kept;

        removed.sort();
        removed
    }
}
