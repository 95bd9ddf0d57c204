//! Facade crate re-exporting the tarmac-index public surface.
//!
//! Most consumers want [`run_indexer`] to build an index and
//! [`IndexNavigator`] to query it; the lower layers (arena, tree engine)
//! are re-exported for tools that extend the index format.

pub use tarmac_arena::Arena;
pub use tarmac_disktree::{
    AvlDisk, Descent, InsertOutcome, NoAnnotation, Node, TreeAnnotation, TreePayload,
};
pub use tarmac_error::{Result, TarmacError};
pub use tarmac_index::{
    check_index_header, run_indexer, DefinedRegion, IndexHeaderState, IndexNavigator, IndexReader,
    Indexer, MemView,
};
pub use tarmac_types::{
    Addr, CallEffect, CallHeuristic, Image, IndexFlags, IndexerParams, MemAccess, NoCallAnalysis,
    OffT, RegisterId, RegWrite, Time, TraceEvent,
};
