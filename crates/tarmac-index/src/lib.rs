//! On-disk indexing of Tarmac CPU traces.
//!
//! A single pass over parsed trace events builds a forest of persistent
//! (copy-on-write) AVL trees inside one arena file: the sequential order
//! tree, the by-PC tree, and one memory-tree root per observable instant.
//! A post-pass then decorates the sequential tree into a layered range
//! tree for call-depth queries, and finally the COMPLETE flag is set.
//!
//! Querying opens the finished file and walks the trees by offset; see
//! [`navigator::IndexNavigator`].

pub mod indexer;
pub mod layout;
pub mod lrt;
pub mod memtree;
pub mod navigator;
pub mod reader;

pub use indexer::{run_indexer, Indexer};
pub use layout::{
    ByPCPayload, CallDepthArrayEntry, FileHeader, MemoryPayload, MemorySubPayload, SeqOrderPayload,
    EXCEPTION_PC, MAGIC, SENTINEL_DEPTH, SPACE_MEMORY, SPACE_REGISTER,
};
pub use navigator::{DefinedRegion, IndexNavigator, MemView};
pub use reader::{check_index_header, IndexHeaderState, IndexReader};
