//! Host-callback adapter around the graph builder.
//!
//! The host tracer drives four operations in program order on one
//! thread: `begin_iteration` when the target starts, `on_instruction`
//! and `on_branch` for every executed instruction, and `end_iteration`
//! when the target finishes. The last one performs the persistence
//! round-trip against the shared-memory window and hands back the
//! rendered document.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::Result;
use crate::graph::FlowGraph;
use crate::instruction::Instruction;
use crate::render;

/// Where `end_iteration` writes the diagram files.
#[derive(Debug, Clone)]
pub struct DotOutput {
    /// Path the `.dot` document is written to.
    pub dot_path: PathBuf,
    /// Path the external tool renders the `.png` into.
    pub png_path: PathBuf,
}

/// One tracing session over a target process.
#[derive(Debug, Default)]
pub struct TraceSession {
    graph: FlowGraph,
    dot_output: Option<DotOutput>,
}

impl TraceSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write and render diagram files at the end of every iteration.
    /// Both names come from the host, which keeps them unique per
    /// target process.
    pub fn enable_dot_output(&mut self, dot_path: impl Into<PathBuf>, png_path: impl Into<PathBuf>) {
        self.dot_output = Some(DotOutput {
            dot_path: dot_path.into(),
            png_path: png_path.into(),
        });
    }

    /// Keep the rendered document in memory only.
    pub fn disable_dot_output(&mut self) {
        self.dot_output = None;
    }

    /// The graph accumulated so far.
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Start collecting a fresh iteration of the target.
    ///
    /// The in-memory graph restarts empty; state accumulated by earlier
    /// iterations comes back through the window merge at the end.
    pub fn begin_iteration(&mut self, iteration: u64) {
        debug!(iteration, "starting iteration");
        self.graph = FlowGraph::for_iteration(iteration);
    }

    /// Feed one executed non-branch instruction.
    pub fn on_instruction(&mut self, inst: Instruction) -> Result<()> {
        self.graph.append_instruction(inst)
    }

    /// Feed one executed branch instruction.
    pub fn on_branch(&mut self, inst: Instruction) -> Result<()> {
        self.graph.append_branch_instruction(inst)
    }

    /// Close out the iteration against the shared-memory window.
    ///
    /// Reads the persisted graph out of the window, merges it into the
    /// current one, writes the union back, and returns the rendered
    /// document. When dot output is enabled the document is also
    /// written to disk and handed to the external tool. A corrupt
    /// window leaves the in-memory graph untouched.
    pub fn end_iteration(&mut self, window: &mut [u8]) -> Result<String> {
        let persisted = FlowGraph::deserialize_from(window)?;
        let conflicts = self.graph.merge(persisted);
        if !conflicts.is_empty() {
            warn!(
                count = conflicts.len(),
                "iteration merged with conflicting observations"
            );
        }

        self.graph.serialize_into(window)?;
        debug!(
            nodes = self.graph.nodes.len(),
            bytes = self.graph.mem_size(),
            "iteration persisted"
        );

        let document = self.graph.graphviz();
        if let Some(output) = &self.dot_output {
            fs::write(&output.dot_path, &document)?;
            render::render_png(&output.dot_path, &output.png_path)?;
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_WINDOW_BYTES;
    use crate::error::Error;
    use crate::instruction::{BranchKind, Instruction};

    fn feed_loop(session: &mut TraceSession, times: usize) {
        for _ in 0..times {
            session
                .on_instruction(Instruction::new(0x3000, "cmp eax, ebx", BranchKind::None, 4, 0))
                .unwrap();
            session
                .on_branch(Instruction::new(
                    0x3004,
                    "jne 0x3000",
                    BranchKind::ConditionalJump,
                    2,
                    0x3000,
                ))
                .unwrap();
        }
    }

    #[test]
    fn test_end_iteration_returns_document_and_persists() {
        let mut window = vec![0u8; DEFAULT_WINDOW_BYTES];
        let mut session = TraceSession::new();

        session.begin_iteration(1);
        feed_loop(&mut session, 1);
        let document = session.end_iteration(&mut window).unwrap();

        assert!(document.starts_with("\ndigraph control_flow_graph {"));
        assert!(document.contains("\"0x00003000\""));

        let persisted = FlowGraph::deserialize_from(&window).unwrap();
        assert_eq!(persisted.nodes.len(), 2);
        assert_eq!(persisted.first_entry, 0x3000);
    }

    #[test]
    fn test_visits_accumulate_over_two_iterations() {
        let mut window = vec![0u8; DEFAULT_WINDOW_BYTES];
        let mut session = TraceSession::new();

        session.begin_iteration(1);
        feed_loop(&mut session, 3);
        session.end_iteration(&mut window).unwrap();
        assert_eq!(session.graph().nodes[&0x3000].visits, 3);

        session.begin_iteration(2);
        feed_loop(&mut session, 2);
        session.end_iteration(&mut window).unwrap();

        let node = &session.graph().nodes[&0x3000];
        assert_eq!(node.visits, 5);
        assert_eq!(node.iteration, 1);
    }

    #[test]
    fn test_corrupt_window_preserves_graph() {
        let mut session = TraceSession::new();
        session.begin_iteration(1);
        feed_loop(&mut session, 1);

        // Claims one node but holds too few bytes for it.
        let mut window = vec![0u8; 70];
        window[8..16].copy_from_slice(&1u64.to_le_bytes());

        let err = session.end_iteration(&mut window).unwrap_err();
        assert!(matches!(err, Error::CorruptBuffer(_)));
        assert_eq!(session.graph().nodes.len(), 2);
        assert_eq!(session.graph().nodes[&0x3000].visits, 1);
    }

    #[test]
    fn test_window_too_small_to_persist() {
        let mut session = TraceSession::new();
        session.begin_iteration(1);
        feed_loop(&mut session, 1);

        let mut window = vec![0u8; 32];
        let err = session.end_iteration(&mut window).unwrap_err();
        assert!(matches!(err, Error::WindowTooSmall { .. }));
    }
}
