//! On-disk schemas of the index file.
//!
//! The file starts with a 16-byte magic number, then the [`FileHeader`],
//! then the arena body: tree nodes, payload blobs, call-depth arrays, and
//! subtree-root cells. Every multi-byte integer is little-endian regardless
//! of host; the `BIGEND` header flag describes the traced CPU, never the
//! index's own bytes.

use std::cmp::Ordering;

use tarmac_disktree::{AvlDisk, NoAnnotation, TreeAnnotation, TreePayload};
use tarmac_types::encoding::{get_u32, get_u64, put_u32, put_u64};
use tarmac_types::{Addr, DiskRecord, IndexFlags, OffT, Time};

/// Identifies the file as a Tarmac index, including a format version; an
/// index written by an incompatible version fails the magic check. The
/// NUL-terminated reference string is 17 bytes; only these 16 are stored.
pub const MAGIC: [u8; 16] = *b"TarmacIndex v08\n";

/// File offset of the magic number.
pub const MAGIC_OFFSET: OffT = 0;

/// File offset of the [`FileHeader`], immediately after the magic number.
pub const FILE_HEADER_OFFSET: OffT = 16;

/// Terminating call-depth value in call-depth arrays. Cannot be a real
/// depth: nothing recurses 2^32 - 2 levels without running out of stack.
pub const SENTINEL_DEPTH: u32 = u32::MAX - 1;

/// PC value marking a CPU exception event in the by-PC tree. 6 cannot be a
/// legal PC: legal values are 0 mod 4 (A32/A64) or 1 or 3 mod 4 (Thumb,
/// low-bit-set form).
pub const EXCEPTION_PC: Addr = 6;

/// Address-space tag for memory.
pub const SPACE_MEMORY: u8 = b'm';

/// Address-space tag for the made-up register space.
pub const SPACE_REGISTER: u8 = b'r';

/// File header living immediately after the magic number, holding the
/// final tree roots. Written at the end of indexing; the COMPLETE flag bit
/// is set last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub flags: IndexFlags,
    /// Root of the sequential order tree.
    pub seqroot: OffT,
    /// Root of the PC tree.
    pub bypcroot: OffT,
    /// Offset to apply to line numbers shown during browsing, for traces
    /// whose Tarmac data starts after an initial header line.
    pub lineno_offset: u32,
}

impl DiskRecord for FileHeader {
    const SIZE: usize = 24;

    fn write_to(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.flags.bits());
        put_u64(buf, 4, self.seqroot);
        put_u64(buf, 12, self.bypcroot);
        put_u32(buf, 20, self.lineno_offset);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            flags: IndexFlags::from_bits_retain(get_u32(buf, 0)),
            seqroot: get_u64(buf, 4),
            bypcroot: get_u64(buf, 12),
            lineno_offset: get_u32(buf, 20),
        }
    }
}

/// One observable instant of the trace, as stored in the sequential order
/// tree. Ordered by first trace-file line, which is monotone in both byte
/// position and (coerced) time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqOrderPayload {
    /// Timestamp as given in the trace file, coerced to be monotone.
    pub mod_time: Time,
    /// PC of this node.
    pub pc: Addr,
    /// Byte range of the event in the trace file.
    pub trace_file_pos: OffT,
    pub trace_file_len: OffT,
    /// Line range of the event in the trace file.
    pub trace_file_firstline: u32,
    pub trace_file_lines: u32,
    /// Root of the memory tree representing the state just after this
    /// event.
    pub memory_root: OffT,
    /// Depth in the function call hierarchy.
    pub call_depth: u32,
}

impl SeqOrderPayload {
    /// A probe payload carrying only the sort key.
    #[must_use]
    pub fn line_probe(firstline: u32) -> Self {
        Self {
            mod_time: 0,
            pc: 0,
            trace_file_pos: 0,
            trace_file_len: 0,
            trace_file_firstline: firstline,
            trace_file_lines: 0,
            memory_root: 0,
            call_depth: 0,
        }
    }
}

impl DiskRecord for SeqOrderPayload {
    const SIZE: usize = 52;

    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.mod_time);
        put_u64(buf, 8, self.pc);
        put_u64(buf, 16, self.trace_file_pos);
        put_u64(buf, 24, self.trace_file_len);
        put_u32(buf, 32, self.trace_file_firstline);
        put_u32(buf, 36, self.trace_file_lines);
        put_u64(buf, 40, self.memory_root);
        put_u32(buf, 48, self.call_depth);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            mod_time: get_u64(buf, 0),
            pc: get_u64(buf, 8),
            trace_file_pos: get_u64(buf, 16),
            trace_file_len: get_u64(buf, 24),
            trace_file_firstline: get_u32(buf, 32),
            trace_file_lines: get_u32(buf, 36),
            memory_root: get_u64(buf, 40),
            call_depth: get_u32(buf, 48),
        }
    }
}

impl TreePayload for SeqOrderPayload {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        self.trace_file_firstline.cmp(&other.trace_file_firstline)
    }
}

/// Descriptor of a node's call-depth array. Layered range trees are
/// expensive to maintain dynamically, so inserts store the zeroed default
/// and a tree-walking pass fills the real arrays in after the tree reaches
/// its final state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqOrderAnnotation {
    /// Offset of an array of [`CallDepthArrayEntry`].
    pub call_depth_array: OffT,
    pub call_depth_arraylen: u32,
}

impl DiskRecord for SeqOrderAnnotation {
    const SIZE: usize = 12;

    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.call_depth_array);
        put_u32(buf, 8, self.call_depth_arraylen);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            call_depth_array: get_u64(buf, 0),
            call_depth_arraylen: get_u32(buf, 8),
        }
    }
}

impl TreeAnnotation<SeqOrderPayload> for SeqOrderAnnotation {
    fn lift(_payload: &SeqOrderPayload) -> Self {
        Self::default()
    }

    fn combine(&self, _other: &Self) -> Self {
        Self::default()
    }
}

/// One entry of a node's cumulative call-depth frequency table.
///
/// The cumulative counts are of events/lines in the whole subtree whose
/// call depth is strictly less than `call_depth`; the first entry's counts
/// are therefore zero, and the `SENTINEL_DEPTH` entry's counts are the
/// subtree totals. The links are indices of the first entry in the left
/// and right child's arrays with depth greater or equal to this entry's,
/// and always land on a real entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDepthArrayEntry {
    pub call_depth: u32,
    pub cumulative_lines: u32,
    pub cumulative_insns: u32,
    pub leftlink: OffT,
    pub rightlink: OffT,
}

impl DiskRecord for CallDepthArrayEntry {
    const SIZE: usize = 28;

    fn write_to(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.call_depth);
        put_u32(buf, 4, self.cumulative_lines);
        put_u32(buf, 8, self.cumulative_insns);
        put_u64(buf, 12, self.leftlink);
        put_u64(buf, 20, self.rightlink);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            call_depth: get_u32(buf, 0),
            cumulative_lines: get_u32(buf, 4),
            cumulative_insns: get_u32(buf, 8),
            leftlink: get_u64(buf, 12),
            rightlink: get_u64(buf, 20),
        }
    }
}

/// One interval of known (or knowable) state in an address space.
///
/// If `raw` is nonzero, `contents` is the offset of `hi - lo + 1` raw
/// bytes. Otherwise `contents` is the offset of a one-word cell storing
/// the root of a memory subtree; the cell may be shared by several entries
/// that carved up one original interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPayload {
    /// Address-space tag: `SPACE_REGISTER` or `SPACE_MEMORY`.
    pub space: u8,
    pub raw: u8,
    /// Low and high bytes touched, inclusive.
    pub lo: Addr,
    pub hi: Addr,
    pub contents: OffT,
    /// First line of the seq node in which this piece of state was last
    /// touched.
    pub trace_file_firstline: u32,
}

impl MemoryPayload {
    /// A probe payload carrying only the sort key.
    #[must_use]
    pub fn probe(space: u8, lo: Addr, hi: Addr) -> Self {
        Self {
            space,
            raw: 0,
            lo,
            hi,
            contents: 0,
            trace_file_firstline: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_raw(&self) -> bool {
        self.raw != 0
    }
}

impl DiskRecord for MemoryPayload {
    const SIZE: usize = 30;

    fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.space;
        buf[1] = self.raw;
        put_u64(buf, 2, self.lo);
        put_u64(buf, 10, self.hi);
        put_u64(buf, 18, self.contents);
        put_u32(buf, 26, self.trace_file_firstline);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            space: buf[0],
            raw: buf[1],
            lo: get_u64(buf, 2),
            hi: get_u64(buf, 10),
            contents: get_u64(buf, 18),
            trace_file_firstline: get_u32(buf, 26),
        }
    }
}

impl TreePayload for MemoryPayload {
    /// Primary by address space; within a space, any interval overlap
    /// counts as equality, so one reachable tree always stores a disjoint
    /// partition per space.
    fn cmp_payload(&self, other: &Self) -> Ordering {
        match self.space.cmp(&other.space) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        if self.hi < other.lo {
            Ordering::Less
        } else if self.lo > other.hi {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Tracks the most recent modification anywhere in a subtree, so searches
/// can skip subtrees not touched since a cutoff line. `latest == 0` means
/// no modification recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryAnnotation {
    /// Maximum `trace_file_firstline` over the subtree.
    pub latest: u32,
}

impl DiskRecord for MemoryAnnotation {
    const SIZE: usize = 4;

    fn write_to(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.latest);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            latest: get_u32(buf, 0),
        }
    }
}

impl TreeAnnotation<MemoryPayload> for MemoryAnnotation {
    fn lift(payload: &MemoryPayload) -> Self {
        Self {
            latest: payload.trace_file_firstline,
        }
    }

    fn combine(&self, other: &Self) -> Self {
        Self {
            latest: self.latest.max(other.latest),
        }
    }
}

/// One filled-in interval of a memory subtree. The contents are always a
/// raw range of bytes. Addresses are absolute: a shared subtree does not
/// have the same base everywhere it is referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySubPayload {
    /// Low and high bytes, inclusive.
    pub lo: Addr,
    pub hi: Addr,
    pub contents: OffT,
    /// Line at which these bytes were discovered. Fills happen with
    /// hindsight, so this is later than the line of the event that put the
    /// bytes there.
    pub trace_file_firstline: u32,
}

impl MemorySubPayload {
    /// A probe payload carrying only the sort key.
    #[must_use]
    pub fn probe(lo: Addr, hi: Addr) -> Self {
        Self {
            lo,
            hi,
            contents: 0,
            trace_file_firstline: 0,
        }
    }
}

impl DiskRecord for MemorySubPayload {
    const SIZE: usize = 28;

    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.lo);
        put_u64(buf, 8, self.hi);
        put_u64(buf, 16, self.contents);
        put_u32(buf, 24, self.trace_file_firstline);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            lo: get_u64(buf, 0),
            hi: get_u64(buf, 8),
            contents: get_u64(buf, 16),
            trace_file_firstline: get_u32(buf, 24),
        }
    }
}

impl TreePayload for MemorySubPayload {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        if self.hi < other.lo {
            Ordering::Less
        } else if self.lo > other.hi {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// One visit to a PC, as stored in the PC tree. Ordered primarily by PC
/// and secondarily by line, so all visits to an address enumerate in trace
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByPCPayload {
    pub pc: Addr,
    pub trace_file_firstline: u32,
}

impl DiskRecord for ByPCPayload {
    const SIZE: usize = 12;

    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.pc);
        put_u32(buf, 8, self.trace_file_firstline);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            pc: get_u64(buf, 0),
            trace_file_firstline: get_u32(buf, 8),
        }
    }
}

impl TreePayload for ByPCPayload {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        match self.pc.cmp(&other.pc) {
            Ordering::Equal => self.trace_file_firstline.cmp(&other.trace_file_firstline),
            unequal => unequal,
        }
    }
}

/// The sequential order tree: every event, sorted by first trace line.
pub type SeqTree = AvlDisk<SeqOrderPayload, SeqOrderAnnotation>;

/// The memory tree: state of registers and memory at one instant. Many
/// roots share nodes; one root per seq node.
pub type MemTree = AvlDisk<MemoryPayload, MemoryAnnotation>;

/// A deferred-fill memory subtree behind a one-word cell.
pub type MemSubTree = AvlDisk<MemorySubPayload, NoAnnotation>;

/// The PC tree: the same events as the seq tree, sorted by PC.
pub type ByPcTree = AvlDisk<ByPCPayload, NoAnnotation>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_are_fixed() {
        assert_eq!(MAGIC.len(), 16);
        assert_eq!(FileHeader::SIZE, 24);
        assert_eq!(SeqOrderPayload::SIZE, 52);
        assert_eq!(SeqOrderAnnotation::SIZE, 12);
        assert_eq!(CallDepthArrayEntry::SIZE, 28);
        assert_eq!(MemoryPayload::SIZE, 30);
        assert_eq!(MemoryAnnotation::SIZE, 4);
        assert_eq!(MemorySubPayload::SIZE, 28);
        assert_eq!(ByPCPayload::SIZE, 12);
    }

    #[test]
    fn file_header_round_trips() {
        let header = FileHeader {
            flags: IndexFlags::COMPLETE | IndexFlags::BIGEND,
            seqroot: 0x1234_5678_9ABC,
            bypcroot: 0xFEDC_BA98,
            lineno_offset: 3,
        };
        let mut buf = [0_u8; FileHeader::SIZE];
        header.write_to(&mut buf);
        assert_eq!(FileHeader::read_from(&buf), header);
    }

    #[test]
    fn seq_payload_orders_by_firstline_only() {
        let a = SeqOrderPayload::line_probe(10);
        let mut b = SeqOrderPayload::line_probe(20);
        b.mod_time = 1; // irrelevant to the ordering
        assert_eq!(a.cmp_payload(&b), Ordering::Less);
        assert_eq!(b.cmp_payload(&a), Ordering::Greater);
        assert_eq!(a.cmp_payload(&SeqOrderPayload::line_probe(10)), Ordering::Equal);
    }

    #[test]
    fn memory_payload_overlap_is_equality() {
        let a = MemoryPayload::probe(SPACE_MEMORY, 0x1000, 0x1FFF);
        let inside = MemoryPayload::probe(SPACE_MEMORY, 0x1800, 0x1810);
        let below = MemoryPayload::probe(SPACE_MEMORY, 0, 0xFFF);
        let above = MemoryPayload::probe(SPACE_MEMORY, 0x2000, 0x2000);
        assert_eq!(a.cmp_payload(&inside), Ordering::Equal);
        assert_eq!(a.cmp_payload(&below), Ordering::Greater);
        assert_eq!(a.cmp_payload(&above), Ordering::Less);

        // Space is the primary key: registers sort after memory.
        let reg = MemoryPayload::probe(SPACE_REGISTER, 0, Addr::MAX);
        assert_eq!(a.cmp_payload(&reg), Ordering::Less);
    }

    #[test]
    fn by_pc_orders_by_pc_then_line() {
        let a = ByPCPayload { pc: 0x100, trace_file_firstline: 4 };
        let b = ByPCPayload { pc: 0x100, trace_file_firstline: 8 };
        let c = ByPCPayload { pc: 0x104, trace_file_firstline: 1 };
        assert_eq!(a.cmp_payload(&b), Ordering::Less);
        assert_eq!(b.cmp_payload(&c), Ordering::Less);
        assert_eq!(a.cmp_payload(&a), Ordering::Equal);
    }

    #[test]
    fn memory_annotation_combines_with_max() {
        let a = MemoryAnnotation { latest: 5 };
        let b = MemoryAnnotation { latest: 12 };
        assert_eq!(a.combine(&b).latest, 12);
        // 0 is "no modification recorded" and is the combine identity.
        assert_eq!(MemoryAnnotation::default().combine(&a).latest, 5);
    }

    #[test]
    fn exception_pc_is_not_a_legal_pc() {
        assert_eq!(EXCEPTION_PC % 4, 2);
    }
}
