//! Incremental control-flow graph construction from dynamic
//! instrumentation traces.
//!
//! A host tracer reports every executed instruction of a target
//! process; this crate slices the stream into basic blocks, counts how
//! often each block is entered, persists the graph through a fixed-size
//! shared-memory window so repeated runs of the same target accumulate,
//! and renders the result as a Graphviz document.
//!
//! # Example
//!
//! ```
//! use flowtrace::{BranchKind, Instruction, TraceSession};
//!
//! let mut window = vec![0u8; flowtrace::codec::DEFAULT_WINDOW_BYTES];
//! let mut session = TraceSession::new();
//!
//! session.begin_iteration(1);
//! session
//!     .on_instruction(Instruction::new(0x1000, "xor eax, eax", BranchKind::None, 2, 0))
//!     .unwrap();
//! session
//!     .on_branch(Instruction::new(0x1002, "ret", BranchKind::Return, 1, 0))
//!     .unwrap();
//! let document = session.end_iteration(&mut window).unwrap();
//! assert!(document.contains("\"0x00001000\""));
//! ```

pub mod codec;
pub mod error;
pub mod graph;
pub mod instruction;
pub mod merge;
pub mod node;
pub mod render;
pub mod session;

pub use error::{Error, Result};
pub use graph::FlowGraph;
pub use instruction::{BranchKind, Instruction};
pub use merge::MergeConflict;
pub use node::Node;
pub use render::render_png;
pub use session::{DotOutput, TraceSession};
