//! Fusing the current iteration's graph with persisted state.
//!
//! The persisted graph represents real executions from earlier
//! iterations, so visit counts add up and edges union. Contradictory
//! observations of the same entry address are flagged per node while
//! the current-iteration view is kept.

use std::collections::btree_map::Entry;
use std::fmt;

use tracing::warn;

use crate::graph::FlowGraph;
use crate::node::Node;

/// A contradictory pair of observations for one entry address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeConflict {
    /// The two graphs disagree on a successor edge.
    Edges { entry: u64 },
    /// The two graphs hold different instruction runs for the block.
    Block { entry: u64 },
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeConflict::Edges { entry } => {
                write!(f, "conflicting successor edges for block {entry:#x}")
            }
            MergeConflict::Block { entry } => {
                write!(f, "conflicting instruction runs for block {entry:#x}")
            }
        }
    }
}

impl FlowGraph {
    /// Fold `other` into this graph.
    ///
    /// Nodes unknown to `self` are adopted as-is. Nodes present on both
    /// sides fuse additively on visits and unionally on edges, with the
    /// older iteration index winning. Returns every conflict found; the
    /// merged result is complete either way.
    pub fn merge(&mut self, other: FlowGraph) -> Vec<MergeConflict> {
        let mut conflicts = Vec::new();

        for (key, theirs) in other.nodes {
            match self.nodes.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(theirs);
                }
                Entry::Occupied(mut slot) => {
                    fuse(slot.get_mut(), theirs, &mut conflicts);
                }
            }
        }

        if self.first_entry == 0 {
            self.first_entry = other.first_entry;
        }

        for conflict in &conflicts {
            warn!(%conflict, "merge kept the current iteration's view");
        }
        conflicts
    }
}

/// Fuse one persisted node into its current-iteration counterpart.
fn fuse(ours: &mut Node, theirs: Node, conflicts: &mut Vec<MergeConflict>) {
    ours.visits = ours.visits.saturating_add(theirs.visits);

    let mut edge_conflict = false;
    edge_conflict |= fuse_edge(&mut ours.true_succ, theirs.true_succ);
    edge_conflict |= fuse_edge(&mut ours.false_succ, theirs.false_succ);
    if edge_conflict {
        conflicts.push(MergeConflict::Edges { entry: ours.entry });
    }

    if ours.body.is_empty() {
        ours.body = theirs.body;
    } else if !theirs.body.is_empty() && !same_block(ours, &theirs) {
        conflicts.push(MergeConflict::Block { entry: ours.entry });
    }

    ours.closed |= theirs.closed;
    ours.iteration = ours.iteration.min(theirs.iteration);
}

/// Union one successor slot; true when both sides insist on different
/// non-zero targets (the current value stays).
fn fuse_edge(ours: &mut u64, theirs: u64) -> bool {
    if *ours == 0 {
        *ours = theirs;
        return false;
    }
    theirs != 0 && theirs != *ours
}

/// Two observations describe the same block when their instruction runs
/// agree on address, length and kind. Text is host formatting and may
/// differ between runs.
fn same_block(ours: &Node, theirs: &Node) -> bool {
    ours.body.len() == theirs.body.len()
        && ours
            .body
            .iter()
            .zip(&theirs.body)
            .all(|(a, b)| a.address == b.address && a.length == b.length && a.kind == b.kind)
}
