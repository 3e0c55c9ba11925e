//! Error types surfaced by the graph core.

use thiserror::Error;

/// Errors reported by graph construction, the wire codec and rendering.
#[derive(Error, Debug)]
pub enum Error {
    /// An instruction record failed validation, or was routed to the
    /// wrong append operation.
    #[error("invalid instruction: {0}")]
    InvalidInstruction(&'static str),
    /// The serialized graph does not fit the shared-memory window.
    #[error("cfg window too small: need {needed} bytes, capacity is {capacity}")]
    WindowTooSmall { needed: usize, capacity: usize },
    /// The shared-memory window holds bytes that cannot be decoded back
    /// into a graph.
    #[error("corrupt cfg buffer: {0}")]
    CorruptBuffer(&'static str),
    /// The external diagram tool wrote to stderr or exited abnormally.
    #[error("diagram renderer failed: {0}")]
    RendererFailure(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
