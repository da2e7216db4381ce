//! Revision trees for MVCC documents.
//!
//! Every document carries a forest of revisions. A revision is identified by its generation
//! (`pos`, the 1-based depth from the root) and a content hash; the string form is
//! `"<pos>-<hash>"`. The forest is stored as an arena of [`RevNode`]s with parent indices, so
//! there are no owning links between nodes: stemming is a vector filter plus an index remap,
//! and a tree may hold several disjoint branches once old history has been pruned.
//!
//! The winning revision is a deterministic total order over the leaves:
//! 1. non-deleted leaves beat deleted leaves,
//! 2. then the higher generation wins,
//! 3. then the lexicographically greater hash wins.
//!
//! Two leaves can never tie: equal generation and hash means the same node.

mod merge;

pub use merge::{MergeOutcome, PathNode, RevPath};

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Revision parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevError {
    #[error("Invalid revision: {0}")]
    Invalid(String),
}

/// A revision identifier: generation plus hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rev {
    pub pos: u64,
    pub hash: String,
}

impl Rev {
    pub fn new(pos: u64, hash: impl Into<String>) -> Self {
        Self {
            pos,
            hash: hash.into(),
        }
    }

    /// The revision one generation after this one.
    pub fn child(&self, hash: impl Into<String>) -> Result<Rev, RevError> {
        let pos = self
            .pos
            .checked_add(1)
            .ok_or_else(|| RevError::Invalid(format!("{} has no next generation", self)))?;
        Ok(Rev::new(pos, hash))
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pos, self.hash)
    }
}

impl FromStr for Rev {
    type Err = RevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pos, hash) = s
            .split_once('-')
            .ok_or_else(|| RevError::Invalid(s.to_string()))?;
        let pos: u64 = pos.parse().map_err(|_| RevError::Invalid(s.to_string()))?;
        if pos == 0 || hash.is_empty() {
            return Err(RevError::Invalid(s.to_string()));
        }
        Ok(Rev::new(pos, hash))
    }
}

/// Whether the body for a revision is still stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevStatus {
    Available,
    Missing,
}

impl RevStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RevStatus::Available => "available",
            RevStatus::Missing => "missing",
        }
    }
}

/// One node in the revision arena.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    pub pos: u64,
    pub hash: String,
    /// Index of the parent node, `None` for a root (original or stemmed).
    pub parent: Option<usize>,
    pub deleted: bool,
    pub status: RevStatus,
}

impl RevNode {
    pub fn rev(&self) -> Rev {
        Rev::new(self.pos, self.hash.clone())
    }
}

/// A leaf revision as seen by conflict resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub rev: Rev,
    pub deleted: bool,
    pub status: RevStatus,
}

impl Leaf {
    /// Total order used to pick the winner; greater wins.
    fn rank_cmp(&self, other: &Leaf) -> Ordering {
        (!self.deleted, self.rev.pos, &self.rev.hash).cmp(&(!other.deleted, other.rev.pos, &other.rev.hash))
    }
}

/// What a traversal visitor sees for each node.
#[derive(Debug)]
pub struct Visit<'a> {
    pub index: usize,
    pub node: &'a RevNode,
    pub parent: Option<&'a RevNode>,
    pub is_leaf: bool,
}

/// The revision forest of a single document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevTree {
    nodes: Vec<RevNode>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[RevNode] {
        &self.nodes
    }

    /// Arena index of the node with this generation and hash.
    pub fn find(&self, pos: u64, hash: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.pos == pos && n.hash == hash)
    }

    pub fn get(&self, rev: &Rev) -> Option<&RevNode> {
        self.find(rev.pos, &rev.hash).map(|i| &self.nodes[i])
    }

    pub fn contains(&self, rev: &Rev) -> bool {
        self.find(rev.pos, &rev.hash).is_some()
    }

    /// `true` at index i if node i has at least one child.
    fn child_flags(&self) -> Vec<bool> {
        let mut has_child = vec![false; self.nodes.len()];
        for node in &self.nodes {
            if let Some(p) = node.parent {
                has_child[p] = true;
            }
        }
        has_child
    }

    /// Children of every node, ordered by hash.
    fn children(&self) -> Vec<Vec<usize>> {
        let mut children = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(p) = node.parent {
                children[p].push(i);
            }
        }
        for list in &mut children {
            list.sort_by(|a, b| self.nodes[*a].hash.cmp(&self.nodes[*b].hash));
        }
        children
    }

    pub fn is_leaf(&self, index: usize) -> bool {
        !self.nodes.iter().any(|n| n.parent == Some(index))
    }

    /// Depth-first traversal from every root, roots ordered by (pos, hash).
    pub fn traverse<F>(&self, mut visitor: F)
    where
        F: FnMut(Visit<'_>),
    {
        let children = self.children();
        let mut roots: Vec<usize> = (0..self.nodes.len())
            .filter(|i| self.nodes[*i].parent.is_none())
            .collect();
        roots.sort_by(|a, b| {
            let (na, nb) = (&self.nodes[*a], &self.nodes[*b]);
            (na.pos, &na.hash).cmp(&(nb.pos, &nb.hash))
        });

        let mut stack: Vec<usize> = roots.into_iter().rev().collect();
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            visitor(Visit {
                index,
                node,
                parent: node.parent.map(|p| &self.nodes[p]),
                is_leaf: children[index].is_empty(),
            });
            stack.extend(children[index].iter().rev());
        }
    }

    /// Marks the given revisions as missing; returns how many nodes changed.
    pub fn mark_missing(&mut self, revs: &HashSet<Rev>) -> usize {
        let mut targets = Vec::new();
        self.traverse(|visit| {
            if visit.node.status == RevStatus::Available && revs.contains(&visit.node.rev()) {
                targets.push(visit.index);
            }
        });
        for index in &targets {
            self.nodes[*index].status = RevStatus::Missing;
        }
        targets.len()
    }

    /// All leaves, highest generation first (ties broken by hash, descending).
    pub fn leaves(&self) -> Vec<Leaf> {
        let has_child = self.child_flags();
        let mut leaves: Vec<Leaf> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !has_child[*i])
            .map(|(_, n)| Leaf {
                rev: n.rev(),
                deleted: n.deleted,
                status: n.status,
            })
            .collect();
        leaves.sort_by(|a, b| b.rev.cmp(&a.rev));
        leaves
    }

    /// The revision the document currently "is".
    pub fn winning_rev(&self) -> Option<Rev> {
        self.leaves()
            .into_iter()
            .max_by(|a, b| a.rank_cmp(b))
            .map(|leaf| leaf.rev)
    }

    /// Deletion flag of the given revision; unknown revisions are not deleted.
    pub fn is_deleted(&self, rev: &Rev) -> bool {
        self.get(rev).map(|n| n.deleted).unwrap_or(false)
    }

    /// Non-deleted leaves other than the winner.
    pub fn collect_conflicts(&self) -> Vec<Rev> {
        let winner = self.winning_rev();
        self.leaves()
            .into_iter()
            .filter(|leaf| !leaf.deleted && Some(&leaf.rev) != winner.as_ref())
            .map(|leaf| leaf.rev)
            .collect()
    }

    /// Deleted leaves other than the winner.
    pub fn collect_deleted_conflicts(&self) -> Vec<Rev> {
        let winner = self.winning_rev();
        self.leaves()
            .into_iter()
            .filter(|leaf| leaf.deleted && Some(&leaf.rev) != winner.as_ref())
            .map(|leaf| leaf.rev)
            .collect()
    }

    /// The best-ranked leaf descending from `rev` (itself if it is a leaf).
    pub fn latest(&self, rev: &Rev) -> Option<Rev> {
        let start = self.find(rev.pos, &rev.hash)?;
        let children = self.children();
        let mut best: Option<Leaf> = None;
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            if children[index].is_empty() {
                let node = &self.nodes[index];
                let leaf = Leaf {
                    rev: node.rev(),
                    deleted: node.deleted,
                    status: node.status,
                };
                let better = match &best {
                    Some(current) => leaf.rank_cmp(current) == Ordering::Greater,
                    None => true,
                };
                if better {
                    best = Some(leaf);
                }
            }
            stack.extend(children[index].iter().copied());
        }
        best.map(|leaf| leaf.rev)
    }

    /// Nodes from `rev` up to its (possibly stemmed) root, `rev` first.
    pub fn ancestry(&self, rev: &Rev) -> Vec<&RevNode> {
        let mut path = Vec::new();
        let mut cursor = self.find(rev.pos, &rev.hash);
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            path.push(node);
            cursor = node.parent;
        }
        path
    }

    /// Distance from every node to its closest leaf, indexed like the arena.
    pub fn compute_height(&self) -> Vec<u64> {
        let has_child = self.child_flags();
        let mut height: Vec<u64> = has_child
            .iter()
            .map(|c| if *c { u64::MAX } else { 0 })
            .collect();

        // A child is always one generation deeper than its parent, so visiting deepest
        // generations first finalizes children before parents.
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|a, b| self.nodes[*b].pos.cmp(&self.nodes[*a].pos));
        for index in order {
            if let Some(p) = self.nodes[index].parent {
                height[p] = height[p].min(height[index].saturating_add(1));
            }
        }
        height
    }

    /// Available revisions farther than `max_height` from their closest leaf.
    pub fn revs_above_height(&self, max_height: u64) -> Vec<Rev> {
        let height = self.compute_height();
        let mut revs = Vec::new();
        self.traverse(|visit| {
            if visit.node.status == RevStatus::Available && height[visit.index] > max_height {
                revs.push(visit.node.rev());
            }
        });
        revs
    }

    /// Available revisions that are not leaves: everything auto-compaction may purge.
    pub fn compactable_revs(&self) -> Vec<Rev> {
        let mut revs = Vec::new();
        self.traverse(|visit| {
            if visit.node.status == RevStatus::Available && !visit.is_leaf {
                revs.push(visit.node.rev());
            }
        });
        revs
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a tree from paths given as oldest-first rev strings; a trailing `!` marks the
    /// leaf as deleted.
    pub(crate) fn tree_of(paths: &[&[&str]]) -> RevTree {
        let mut tree = RevTree::new();
        for path in paths {
            let first: Rev = path[0].trim_end_matches('!').parse().unwrap();
            let ids = path
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    let rev: Rev = r.trim_end_matches('!').parse().unwrap();
                    PathNode {
                        hash: rev.hash,
                        status: RevStatus::Available,
                        deleted: i == path.len() - 1 && r.ends_with('!'),
                    }
                })
                .collect();
            tree.merge(&RevPath {
                start: first.pos,
                ids,
            });
        }
        tree
    }

    fn rev(s: &str) -> Rev {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let r = rev("12-abc");
        assert_eq!(r.pos, 12);
        assert_eq!(r.hash, "abc");
        assert_eq!(r.to_string(), "12-abc");

        assert!("abc".parse::<Rev>().is_err());
        assert!("0-abc".parse::<Rev>().is_err());
        assert!("x-abc".parse::<Rev>().is_err());
        assert!("3-".parse::<Rev>().is_err());
    }

    #[test]
    fn test_child_generation() {
        assert_eq!(rev("4-a").child("b").unwrap(), rev("5-b"));
        let last = Rev::new(u64::MAX, "a");
        assert!(matches!(last.child("b"), Err(RevError::Invalid(_))));
    }

    #[test]
    fn test_conflict_list_example() {
        let tree = tree_of(&[
            &["1-a", "2-b", "3-aaa"],
            &["1-a", "2-b", "3-bbb"],
            &["1-a", "2-c!"],
        ]);

        assert_eq!(tree.winning_rev(), Some(rev("3-bbb")));
        assert_eq!(tree.collect_conflicts(), vec![rev("3-aaa")]);
        assert_eq!(tree.collect_deleted_conflicts(), vec![rev("2-c")]);
    }

    #[test]
    fn test_winner_is_deterministic() {
        let a = tree_of(&[&["1-x", "2-m"], &["1-x", "2-n"], &["1-y"]]);
        let b = tree_of(&[&["1-y"], &["1-x", "2-n"], &["1-x", "2-m"]]);
        assert_eq!(a.winning_rev(), b.winning_rev());
        assert_eq!(a.winning_rev(), Some(rev("2-n")));
        for _ in 0..3 {
            assert_eq!(a.winning_rev(), Some(rev("2-n")));
        }
    }

    #[test]
    fn test_deleted_leaf_loses_to_live_leaf() {
        let tree = tree_of(&[&["1-a", "2-b", "3-z!"], &["1-a", "2-c"]]);
        assert_eq!(tree.winning_rev(), Some(rev("2-c")));
        assert!(!tree.is_deleted(&rev("2-c")));
        assert!(tree.is_deleted(&rev("3-z")));

        let all_deleted = tree_of(&[&["1-a", "2-b!"], &["1-a", "2-c!"]]);
        assert_eq!(all_deleted.winning_rev(), Some(rev("2-c")));
        assert!(all_deleted.is_deleted(&rev("2-c")));
    }

    #[test]
    fn test_disjoint_branches() {
        let mut tree = tree_of(&[&["1-a", "2-b", "3-c", "4-d"]]);
        tree.merge(&RevPath {
            start: 5,
            ids: vec![PathNode {
                hash: "q".to_string(),
                status: RevStatus::Available,
                deleted: false,
            }],
        });

        assert_eq!(tree.winning_rev(), Some(rev("5-q")));
        assert_eq!(tree.collect_conflicts(), vec![rev("4-d")]);
    }

    #[test]
    fn test_traverse_visits_roots_first() {
        let tree = tree_of(&[&["1-a", "2-b", "3-c"], &["1-a", "2-x"]]);
        let mut seen = Vec::new();
        tree.traverse(|v| seen.push((v.node.rev().to_string(), v.is_leaf)));
        assert_eq!(
            seen,
            vec![
                ("1-a".to_string(), false),
                ("2-b".to_string(), false),
                ("3-c".to_string(), true),
                ("2-x".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_latest_and_ancestry() {
        let tree = tree_of(&[&["1-a", "2-b", "3-c"], &["1-a", "2-x"]]);
        assert_eq!(tree.latest(&rev("2-b")), Some(rev("3-c")));
        assert_eq!(tree.latest(&rev("1-a")), Some(rev("3-c")));
        assert_eq!(tree.latest(&rev("2-x")), Some(rev("2-x")));
        assert_eq!(tree.latest(&rev("9-zz")), None);

        let path: Vec<String> = tree
            .ancestry(&rev("3-c"))
            .iter()
            .map(|n| n.hash.clone())
            .collect();
        assert_eq!(path, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_heights_and_compactable() {
        let tree = tree_of(&[&["1-a", "2-b", "3-c", "4-d"], &["1-a", "2-x"]]);
        let height = tree.compute_height();
        let h = |r: &str| height[tree.find(rev(r).pos, &rev(r).hash).unwrap()];
        assert_eq!(h("4-d"), 0);
        assert_eq!(h("2-x"), 0);
        assert_eq!(h("1-a"), 1);
        assert_eq!(h("2-b"), 2);

        assert_eq!(tree.revs_above_height(1), vec![rev("2-b")]);
        assert_eq!(
            tree.compactable_revs(),
            vec![rev("1-a"), rev("2-b"), rev("3-c")]
        );
    }

    #[test]
    fn test_mark_missing() {
        let mut tree = tree_of(&[&["1-a", "2-b"]]);
        let purge: HashSet<Rev> = [rev("1-a")].into_iter().collect();
        assert_eq!(tree.mark_missing(&purge), 1);
        assert_eq!(tree.get(&rev("1-a")).unwrap().status, RevStatus::Missing);
        assert!(tree.compactable_revs().is_empty());
        // Already missing
        assert_eq!(tree.mark_missing(&purge), 0);
    }
}
