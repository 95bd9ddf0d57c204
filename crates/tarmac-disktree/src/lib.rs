//! Persistent (copy-on-write) AVL trees stored inside a tarmac arena.
//!
//! A tree is identified by the offset of its root node (0 = empty); every
//! mutation returns a new root and leaves every previously exposed root
//! valid. Payload ordering and subtree annotations are pluggable via the
//! traits in [`traits`].

pub mod traits;
pub mod tree;


pub use traits::{NoAnnotation, TreeAnnotation, TreePayload};
pub use tree::{AvlDisk, Descent, InsertOutcome, Node};
