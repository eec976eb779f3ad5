use std::any::Any;

use thiserror::Error;

use crate::{Key, NodeId};

/// Failures reported by an [`Applier`](crate::Applier) while it mutates the tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node {id} missing")]
    Missing { id: NodeId },
    #[error("node {id} type mismatch; expected {expected}")]
    TypeMismatch { id: NodeId, expected: &'static str },
    #[error("index {index} out of range for node {parent} with {len} children")]
    IndexOutOfRange {
        parent: NodeId,
        index: usize,
        len: usize,
    },
    #[error("node {id} already exists")]
    AlreadyExists { id: NodeId },
    #[error("applier has no current node")]
    NoCurrentNode,
}

/// Restarted content did not line up with the group it was recorded in.
///
/// This is a programming error in composable code (a restartable function
/// emitting a different group than the one it was recorded with), so the pass
/// is abandoned and the error surfaces from the recomposer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("structural mismatch at group {location}: expected key {expected:#x}, {detail}")]
pub struct StructuralError {
    pub location: usize,
    pub expected: Key,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error(transparent)]
    Structure(#[from] StructuralError),
    #[error("composition panicked: {message}")]
    Panicked { message: String },
    #[error("applying changes failed: {0}")]
    Apply(#[from] NodeError),
    #[error("composition is disposed")]
    Disposed,
    #[error("composition is already composing")]
    Reentrant,
    #[error("recomposer is shut down")]
    ShutDown,
}

impl ComposeError {
    /// Converts a panic payload caught at the pass boundary.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<StructuralError>() {
            Ok(error) => return ComposeError::Structure(*error),
            Err(other) => other,
        };
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ComposeError::Panicked { message }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, ComposeError::Structure(_))
    }
}
