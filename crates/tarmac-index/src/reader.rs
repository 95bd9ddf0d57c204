//! Open-time validation and read access to a completed index file.

use std::path::Path;

use tarmac_arena::Arena;
use tarmac_error::{Result, TarmacError};
use tarmac_types::{DiskRecord, IndexFlags, OffT};

use crate::layout::{FileHeader, FILE_HEADER_OFFSET, MAGIC};

/// Classification of an index file's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexHeaderState {
    /// Valid magic and the COMPLETE flag: the file is usable.
    Ok,
    /// Not an index file, or one written by an incompatible version.
    WrongMagic,
    /// Valid magic but index generation never finished.
    Incomplete,
}

fn classify(arena: &Arena) -> Result<IndexHeaderState> {
    let min_size = MAGIC.len() as u64 + FileHeader::SIZE as u64;
    if arena.size() < min_size {
        return Ok(IndexHeaderState::WrongMagic);
    }
    let magic = arena.read_bytes(0, MAGIC.len())?;
    if magic != MAGIC {
        return Ok(IndexHeaderState::WrongMagic);
    }
    let header: FileHeader = arena.read_record(FILE_HEADER_OFFSET)?;
    if !header.flags.contains(IndexFlags::COMPLETE) {
        return Ok(IndexHeaderState::Incomplete);
    }
    Ok(IndexHeaderState::Ok)
}

/// Check whether `path` holds a usable index, without fully opening it.
///
/// I/O failures propagate; an unreadable-but-present file is reported via
/// the state, not an error.
pub fn check_index_header(path: &Path) -> Result<IndexHeaderState> {
    let arena = Arena::open(path)?;
    classify(&arena)
}

/// Read access to a completed index file.
pub struct IndexReader {
    arena: Arena,
    header: FileHeader,
}

impl IndexReader {
    /// Open and validate an index file.
    pub fn open(path: &Path) -> Result<Self> {
        let arena = Arena::open(path)?;
        match classify(&arena)? {
            IndexHeaderState::Ok => {}
            IndexHeaderState::WrongMagic => {
                return Err(TarmacError::BadMagic {
                    path: path.to_path_buf(),
                })
            }
            IndexHeaderState::Incomplete => {
                return Err(TarmacError::Incomplete {
                    path: path.to_path_buf(),
                })
            }
        }
        let header: FileHeader = arena.read_record(FILE_HEADER_OFFSET)?;
        Ok(Self { arena, header })
    }

    #[inline]
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Root of the sequential order tree.
    #[inline]
    #[must_use]
    pub fn seqroot(&self) -> OffT {
        self.header.seqroot
    }

    /// Root of the PC tree.
    #[inline]
    #[must_use]
    pub fn bypcroot(&self) -> OffT {
        self.header.bypcroot
    }

    /// Line-number offset to apply when showing trace lines.
    #[inline]
    #[must_use]
    pub fn lineno_offset(&self) -> u32 {
        self.header.lineno_offset
    }

    /// Whether the traced CPU was believed big-endian.
    #[inline]
    #[must_use]
    pub fn is_big_endian(&self) -> bool {
        self.header.flags.contains(IndexFlags::BIGEND)
    }

    /// Whether the trace includes AArch64 execution state.
    #[inline]
    #[must_use]
    pub fn is_aarch64(&self) -> bool {
        self.header.flags.contains(IndexFlags::AARCH64_USED)
    }

    /// Whether the trace assumes everything is Thumb.
    #[inline]
    #[must_use]
    pub fn is_thumb_only(&self) -> bool {
        self.header.flags.contains(IndexFlags::THUMB_ONLY)
    }
}
