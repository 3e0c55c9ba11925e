//! The flow-graph builder fed by the host, one instruction at a time.
//!
//! The graph owns every node behind an address-keyed map; edges are
//! plain addresses, never references, so loops cost nothing and the
//! wire codec can walk the structure directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};
use crate::instruction::Instruction;
use crate::node::Node;

/// Directed graph of basic blocks accumulated over a traced execution.
///
/// Two cursor fields drive the partitioning state machine:
/// `first_entry` remembers where the trace started, `open_entry` points
/// at the block currently receiving instructions (0 between blocks).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGraph {
    /// Every known block, keyed by entry address.
    pub nodes: BTreeMap<u64, Node>,
    /// Entry address of the first block this trace opened.
    pub first_entry: u64,
    pub(crate) open_entry: u64,
    pub(crate) iteration: u64,
}

impl FlowGraph {
    /// Empty graph for iteration 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty graph tagged with the host-supplied iteration index.
    pub fn for_iteration(iteration: u64) -> Self {
        Self {
            iteration,
            ..Self::default()
        }
    }

    /// Iteration index this graph is being built under.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Entry address of the block currently receiving instructions, 0
    /// when the builder is idle between blocks.
    pub fn open_entry(&self) -> u64 {
        self.open_entry
    }

    /// Route a non-branch instruction into the block under construction.
    pub fn append_instruction(&mut self, inst: Instruction) -> Result<()> {
        if !inst.validate() {
            return Err(Error::InvalidInstruction("instruction failed validation"));
        }
        if inst.is_branch() {
            return Err(Error::InvalidInstruction(
                "branch routed to the non-branch append",
            ));
        }

        let entry = self.effective_entry(inst.address);
        let iteration = self.iteration;
        self.nodes
            .entry(entry)
            .or_insert_with(|| Node::new(entry, iteration))
            .append(inst, iteration);
        Ok(())
    }

    /// Route a branch instruction: close the open block, record its
    /// successor edges and make sure both successors exist as nodes.
    pub fn append_branch_instruction(&mut self, inst: Instruction) -> Result<()> {
        if !inst.validate() {
            return Err(Error::InvalidInstruction("instruction failed validation"));
        }
        if !inst.is_branch() {
            return Err(Error::InvalidInstruction(
                "non-branch routed to the branch append",
            ));
        }

        let entry = self.effective_entry(inst.address);
        let iteration = self.iteration;
        let node = self
            .nodes
            .entry(entry)
            .or_insert_with(|| Node::new(entry, iteration));
        node.append_branch(inst, iteration);
        let (true_succ, false_succ, closed) = (node.true_succ, node.false_succ, node.closed);

        self.materialize_successor(true_succ);
        self.materialize_successor(false_succ);

        if closed {
            trace!(entry, true_succ, false_succ, "closed block");
            self.open_entry = 0;
        }
        Ok(())
    }

    /// Whether any block's body holds an instruction at `address`.
    /// Diagnostics only, this walks every node.
    pub fn node_contains_address(&self, address: u64) -> bool {
        self.nodes.values().any(|node| node.contains(address))
    }

    /// Serialize the graph to pretty JSON for offline inspection.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Resolve the entry address the next instruction belongs to.
    fn effective_entry(&mut self, address: u64) -> u64 {
        if self.open_entry == 0 {
            if self.first_entry == 0 {
                self.first_entry = address;
            }
            self.open_entry = address;
        }
        self.open_entry
    }

    /// Insert a placeholder node for a successor address so every edge
    /// points at a key that exists.
    fn materialize_successor(&mut self, address: u64) {
        if address == 0 {
            return;
        }
        let iteration = self.iteration;
        self.nodes
            .entry(address)
            .or_insert_with(|| Node::new(address, iteration));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::BranchKind;

    fn plain(address: u64, text: &str, length: u32) -> Instruction {
        Instruction::new(address, text, BranchKind::None, length, 0)
    }

    #[test]
    fn test_first_instruction_sets_both_cursors() {
        let mut graph = FlowGraph::new();
        graph.append_instruction(plain(0x1000, "push ebp", 1)).unwrap();

        assert_eq!(graph.first_entry, 0x1000);
        assert_eq!(graph.open_entry(), 0x1000);
        assert_eq!(graph.nodes.len(), 1);
    }

    #[test]
    fn test_straight_line_block_stays_open() {
        let mut graph = FlowGraph::new();
        graph.append_instruction(plain(0x1000, "push ebp", 2)).unwrap();
        graph.append_instruction(plain(0x1002, "mov ebp, esp", 3)).unwrap();
        graph.append_instruction(plain(0x1005, "sub esp, 8", 3)).unwrap();

        let node = &graph.nodes[&0x1000];
        assert_eq!(node.body.len(), 3);
        assert!(!node.closed);
        assert_eq!(node.visits, 1);
        assert_eq!(node.true_succ, 0);
        assert_eq!(node.false_succ, 0);
    }

    #[test]
    fn test_branch_materializes_both_successors() {
        let mut graph = FlowGraph::new();
        graph.append_instruction(plain(0x1000, "cmp eax, 4", 3)).unwrap();
        graph
            .append_branch_instruction(Instruction::new(
                0x1003,
                "jne 0x2000",
                BranchKind::ConditionalJump,
                2,
                0x2000,
            ))
            .unwrap();

        assert_eq!(graph.open_entry(), 0);
        assert_eq!(graph.nodes.len(), 3);
        assert!(graph.nodes.contains_key(&0x2000));
        assert!(graph.nodes.contains_key(&0x1005));
        assert!(graph.nodes[&0x2000].body.is_empty());
        assert_eq!(graph.nodes[&0x2000].visits, 1);
    }

    #[test]
    fn test_every_edge_points_at_a_known_key() {
        let mut graph = FlowGraph::new();
        graph.append_instruction(plain(0x1000, "push 20", 2)).unwrap();
        graph
            .append_branch_instruction(Instruction::new(
                0x1002,
                "call 0x2000",
                BranchKind::Call,
                5,
                0x2000,
            ))
            .unwrap();
        graph.append_instruction(plain(0x2000, "xor eax, eax", 2)).unwrap();
        graph
            .append_branch_instruction(Instruction::new(0x2002, "ret", BranchKind::Return, 1, 0))
            .unwrap();

        for node in graph.nodes.values() {
            for succ in [node.true_succ, node.false_succ] {
                if succ != 0 {
                    assert!(graph.nodes.contains_key(&succ));
                }
            }
        }
    }

    #[test]
    fn test_loop_head_reentry_counts_visits() {
        let mut graph = FlowGraph::new();
        for _ in 0..2 {
            graph.append_instruction(plain(0x3000, "cmp eax, ebx", 4)).unwrap();
            graph
                .append_branch_instruction(Instruction::new(
                    0x3004,
                    "jne 0x3000",
                    BranchKind::ConditionalJump,
                    2,
                    0x3000,
                ))
                .unwrap();
        }

        let node = &graph.nodes[&0x3000];
        assert_eq!(node.visits, 2);
        assert_eq!(node.true_succ, 0x3000);
        assert_eq!(node.false_succ, 0x3006);
        assert_eq!(node.body.len(), 2);
    }

    #[test]
    fn test_invalid_arguments_are_rejected() {
        let mut graph = FlowGraph::new();

        let invalid = plain(0x1000, "", 2);
        assert!(matches!(
            graph.append_instruction(invalid),
            Err(Error::InvalidInstruction(_))
        ));

        let branch = Instruction::new(0x1000, "ret", BranchKind::Return, 1, 0);
        assert!(matches!(
            graph.append_instruction(branch),
            Err(Error::InvalidInstruction(_))
        ));

        let non_branch = plain(0x1000, "nop", 1);
        assert!(matches!(
            graph.append_branch_instruction(non_branch),
            Err(Error::InvalidInstruction(_))
        ));

        // Rejected appends leave no trace behind.
        assert!(graph.nodes.is_empty());
        assert_eq!(graph.first_entry, 0);
    }

    #[test]
    fn test_node_contains_address() {
        let mut graph = FlowGraph::new();
        graph.append_instruction(plain(0x1000, "push ebp", 1)).unwrap();
        graph.append_instruction(plain(0x1001, "mov ebp, esp", 2)).unwrap();

        assert!(graph.node_contains_address(0x1001));
        assert!(!graph.node_contains_address(0x2000));
    }
}
