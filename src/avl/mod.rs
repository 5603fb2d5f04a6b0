//! Persistent batched AVL authenticated dictionary.
//!
//! The dictionary maps box ids to serialized boxes and commits to its whole
//! contents with a 33-byte digest (root node label plus tree height). Nodes
//! are immutable and content-addressed, so every historical root remains
//! readable as long as its nodes are retained; rolling back is a pointer
//! move. Batches of insertions and removals produce witness bytes binding
//! the pre-digest to the post-digest.

mod node;
mod prover;

pub use node::{Label, Node};
pub use prover::{AvlOp, AvlTree, NodeSource, NullSource};
