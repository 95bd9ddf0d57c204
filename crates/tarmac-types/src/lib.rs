//! Shared scalar types, on-disk integer encoding, and the collaborator
//! interfaces the index core presents to the parser, register metadata,
//! image, and call-heuristic components.

pub mod encoding;
pub mod event;

pub use encoding::DiskRecord;
pub use event::{CallEffect, CallHeuristic, Image, MemAccess, NoCallAnalysis, RegWrite, TraceEvent};

/// A target address (memory, or a made-up position in the register space).
pub type Addr = u64;

/// A trace timestamp, in whatever unit the trace measures (cycles,
/// nanoseconds, ...).
pub type Time = u64;

/// A byte offset into the index file. 0 is never a valid record offset
/// (the magic number lives there), so trees use it as the empty root.
pub type OffT = u64;

bitflags::bitflags! {
    /// Flags word of the index file header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IndexFlags: u32 {
        /// The trace was believed big-endian at index time. Describes the
        /// traced CPU, never the index's own bytes.
        const BIGEND = 0x0000_0001;
        /// The trace includes AArch64 execution state.
        const AARCH64_USED = 0x0000_0002;
        /// Index generation completed successfully. Set last; its absence
        /// makes the file unreadable by queries.
        const COMPLETE = 0x0000_0004;
        /// The trace assumes everything is Thumb.
        const THUMB_ONLY = 0x0000_0008;
    }
}

/// Identifies a register by the byte range it occupies in the made-up
/// register address space.
///
/// The namespace mapping (which register gets which range) is owned by the
/// register-file metadata collaborator; ranges may overlap, e.g. s0 inside
/// d0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterId {
    /// First byte of the register in the 'r' address space.
    pub base: Addr,
    /// Width in bytes.
    pub size: u32,
}

impl RegisterId {
    /// Inclusive address range occupied in the register space.
    ///
    /// Zero-width registers do not exist; `size` must be at least 1.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> (Addr, Addr) {
        (self.base, self.base + self.size as Addr - 1)
    }
}

/// Parameters that tell the indexer which features it can leave out of its
/// index to save disk space.
#[derive(Debug, Clone, Copy)]
pub struct IndexerParams {
    /// Record register and memory state. When false, memory-related writes
    /// and queries are skipped.
    pub record_memory: bool,
    /// Run call-depth analysis. When false, call depth is held at 0.
    pub record_calls: bool,
    /// The traced CPU is believed big-endian.
    pub bigend: bool,
    /// The trace includes AArch64 execution state.
    pub aarch64_used: bool,
    /// The trace assumes everything is Thumb.
    pub thumb_only: bool,
    /// Offset to apply to line numbers shown during browsing, for traces
    /// whose Tarmac data starts after an initial header line.
    pub lineno_offset: u32,
    /// Log every call-heuristic verdict.
    pub debug_call_heuristics: bool,
}

impl Default for IndexerParams {
    fn default() -> Self {
        Self {
            record_memory: true,
            record_calls: true,
            bigend: false,
            aarch64_used: false,
            thumb_only: false,
            lineno_offset: 0,
            debug_call_heuristics: false,
        }
    }
}

impl IndexerParams {
    /// Whether an index built with these parameters may be kept on disk.
    ///
    /// Only indexes containing all the optional parts are permitted on
    /// disk; this prevents one tool finding a deficient index written by
    /// another.
    #[must_use]
    pub const fn can_store_on_disk(&self) -> bool {
        self.record_memory && self.record_calls
    }

    /// The header flags these parameters produce (without COMPLETE).
    #[must_use]
    pub fn header_flags(&self) -> IndexFlags {
        let mut flags = IndexFlags::empty();
        if self.bigend {
            flags |= IndexFlags::BIGEND;
        }
        if self.aarch64_used {
            flags |= IndexFlags::AARCH64_USED;
        }
        if self.thumb_only {
            flags |= IndexFlags::THUMB_ONLY;
        }
        flags
    }
}
