use thiserror::Error;

use crate::ir::NodeId;

/// Errors surfaced by the backend for one procedure.
///
/// The input graph has already passed name and type analysis, so everything
/// here indicates either an unsupported construct or a bug in an earlier
/// stage. Nothing is recoverable; the driver decides whether to go on
/// compiling other procedures.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported node {node:?}: {opcode}")]
    UnsupportedNode { node: NodeId, opcode: &'static str },

    #[error("unsupported projection on {opcode} at {node:?}")]
    UnsupportedProjection { node: NodeId, opcode: &'static str },

    #[error("malformed graph: {0}")]
    MalformedGraph(String),
}
