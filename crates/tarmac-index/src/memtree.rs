//! Maintenance of the memory tree and its deferred-fill subtrees.
//!
//! The memory tree maps (address space, interval) to either a raw blob or
//! a one-word cell holding the root of a memory subtree. Intervals
//! reachable from one root are pairwise disjoint per space; a write that
//! overlaps existing intervals carves them into below/new/above pieces.
//! Carved remnants of a subtree-backed interval keep sharing the original
//! cell, which is what makes late fills visible at every instant that
//! references any piece of the original interval.

use std::cmp::Ordering;

use tarmac_arena::Arena;
use tarmac_disktree::TreePayload;
use tarmac_error::Result;
use tarmac_types::encoding::get_u64;
use tarmac_types::{Addr, OffT};

use crate::layout::{MemSubTree, MemTree, MemoryPayload, MemorySubPayload, SPACE_MEMORY, SPACE_REGISTER};

/// The one-word indirection slot holding the current root of a memory
/// subtree.
///
/// Overwriting the cell is the only in-place mutation permitted outside
/// the layered-range post-pass. During indexing the cell must be re-read
/// on every use; after the index is complete no further writes occur, so
/// readers may load it once per descent.
pub struct SubtreeCell;

impl SubtreeCell {
    /// Allocate a fresh cell holding the empty root.
    pub fn alloc(arena: &mut Arena) -> Result<OffT> {
        let off = arena.alloc(8)?;
        arena.write_bytes(off, &0_u64.to_le_bytes())?;
        Ok(off)
    }

    /// Read the current subtree root out of a cell.
    pub fn load(arena: &Arena, cell: OffT) -> Result<OffT> {
        let buf = arena.read_bytes(cell, 8)?;
        Ok(get_u64(&buf, 0))
    }

    /// Overwrite a cell with a new subtree root.
    pub fn store(arena: &mut Arena, cell: OffT, root: OffT) -> Result<()> {
        arena.write_bytes(cell, &root.to_le_bytes())
    }
}

/// The initial memory tree: one subtree-backed "unknown" entry covering
/// each whole address space, so contents that predate the trace can still
/// be filled in when the program reads them.
pub fn initial_root(arena: &mut Arena) -> Result<OffT> {
    let mut root = 0;
    for space in [SPACE_MEMORY, SPACE_REGISTER] {
        let cell = SubtreeCell::alloc(arena)?;
        let payload = MemoryPayload {
            space,
            raw: 0,
            lo: 0,
            hi: Addr::MAX,
            contents: cell,
            trace_file_firstline: 0,
        };
        root = MemTree::insert(arena, root, payload)?.root;
    }
    Ok(root)
}

/// The piece of `entry` covering exactly `[lo, hi]`, with the contents
/// pointer adjusted for raw data. The remnant keeps its original last-touch
/// line: its contents did not change at the event doing the carving.
fn clip_entry(entry: &MemoryPayload, lo: Addr, hi: Addr) -> MemoryPayload {
    let contents = if entry.is_raw() {
        entry.contents + (lo - entry.lo)
    } else {
        entry.contents
    };
    MemoryPayload {
        space: entry.space,
        raw: entry.raw,
        lo,
        hi,
        contents,
        trace_file_firstline: entry.trace_file_firstline,
    }
}

/// Remove every entry of `space` overlapping `[lo, hi]`, re-inserting the
/// below/above remnants of entries that straddle the boundary.
fn carve(arena: &mut Arena, mut root: OffT, space: u8, lo: Addr, hi: Addr) -> Result<OffT> {
    let probe = MemoryPayload::probe(space, lo, hi);
    while let Some((new_root, old)) = MemTree::remove(arena, root, &probe)? {
        root = new_root;
        if old.lo < lo {
            root = MemTree::insert(arena, root, clip_entry(&old, old.lo, lo - 1))?.root;
        }
        if old.hi > hi {
            root = MemTree::insert(arena, root, clip_entry(&old, hi + 1, old.hi))?.root;
        }
    }
    Ok(root)
}

/// Record bytes stored by the trace: carve out `[lo, hi]` and insert a raw
/// entry whose last-touch line is the writing event's.
pub fn record_write(
    arena: &mut Arena,
    root: OffT,
    space: u8,
    lo: Addr,
    hi: Addr,
    data: &[u8],
    firstline: u32,
) -> Result<OffT> {
    debug_assert_eq!(data.len() as u64, hi - lo + 1);
    let contents = arena.alloc_bytes(data)?;
    let root = carve(arena, root, space, lo, hi)?;
    let payload = MemoryPayload {
        space,
        raw: 1,
        lo,
        hi,
        contents,
        trace_file_firstline: firstline,
    };
    Ok(MemTree::insert(arena, root, payload)?.root)
}

/// Mark `[lo, hi]` as written-but-unknown (a semihosting call): carve and
/// insert a fresh empty subtree cell, replacing whatever covered the
/// region.
pub fn declare_unknown(
    arena: &mut Arena,
    root: OffT,
    space: u8,
    lo: Addr,
    hi: Addr,
    firstline: u32,
) -> Result<OffT> {
    let cell = SubtreeCell::alloc(arena)?;
    let root = carve(arena, root, space, lo, hi)?;
    let payload = MemoryPayload {
        space,
        raw: 0,
        lo,
        hi,
        contents: cell,
        trace_file_firstline: firstline,
    };
    Ok(MemTree::insert(arena, root, payload)?.root)
}

/// A load revealed the contents of `[lo, hi]`: for every byte of the range
/// covered by a subtree-backed entry and still unknown in its subtree,
/// write the data into the subtree so it becomes visible retroactively at
/// every instant referencing the cell.
///
/// Bytes already known in a subtree are left alone; overwriting them would
/// disturb the line at which they were first discovered.
pub fn fill_read(
    arena: &mut Arena,
    root: OffT,
    space: u8,
    lo: Addr,
    hi: Addr,
    data: &[u8],
    firstline: u32,
) -> Result<()> {
    debug_assert_eq!(data.len() as u64, hi - lo + 1);
    let mut cur = lo;
    loop {
        let point = MemoryPayload::probe(space, cur, cur);
        if let Some((_, entry)) = MemTree::search(arena, root, &point)? {
            let seg_hi = entry.hi.min(hi);
            if !entry.is_raw() {
                let slice = &data[(cur - lo) as usize..=(seg_hi - lo) as usize];
                fill_cell(arena, entry.contents, cur, seg_hi, slice, firstline)?;
            }
            match seg_hi.checked_add(1) {
                Some(next) if next <= hi => cur = next,
                _ => break,
            }
        } else {
            match MemTree::next(arena, root, &point)? {
                Some((_, entry)) if entry.space == space && entry.lo <= hi => cur = entry.lo,
                _ => break,
            }
        }
    }
    Ok(())
}

/// Insert `[lo, hi]` worth of data into the subtree behind `cell`,
/// covering only the gaps the subtree does not know yet.
fn fill_cell(
    arena: &mut Arena,
    cell: OffT,
    lo: Addr,
    hi: Addr,
    data: &[u8],
    firstline: u32,
) -> Result<()> {
    let mut subroot = SubtreeCell::load(arena, cell)?;
    let mut changed = false;
    let mut cur = lo;
    loop {
        let point = MemorySubPayload::probe(cur, cur);
        if let Some((_, known)) = MemSubTree::search(arena, subroot, &point)? {
            // Already filled; step past it.
            let seg_hi = known.hi.min(hi);
            match seg_hi.checked_add(1) {
                Some(next) if next <= hi => {
                    cur = next;
                    continue;
                }
                _ => break,
            }
        }
        let gap_hi = match MemSubTree::next(arena, subroot, &point)? {
            Some((_, entry)) if entry.lo <= hi => entry.lo - 1,
            _ => hi,
        };
        let slice = &data[(cur - lo) as usize..=(gap_hi - lo) as usize];
        let contents = arena.alloc_bytes(slice)?;
        let payload = MemorySubPayload {
            lo: cur,
            hi: gap_hi,
            contents,
            trace_file_firstline: firstline,
        };
        subroot = MemSubTree::insert(arena, subroot, payload)?.root;
        changed = true;
        match gap_hi.checked_add(1) {
            Some(next) if next <= hi => cur = next,
            _ => break,
        }
    }
    if changed {
        SubtreeCell::store(arena, cell, subroot)?;
    }
    Ok(())
}

/// One contiguous run of defined bytes inside a queried range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefinedPiece {
    pub lo: Addr,
    pub hi: Addr,
    /// Arena offset of the piece's bytes.
    pub contents: OffT,
    /// Line of the event that last touched (or retroactively revealed)
    /// these bytes.
    pub firstline: u32,
}

/// Visit, in ascending address order, every defined piece of `space`
/// within `[lo, hi]` as seen from `root`.
///
/// Subtree entries are clipped to the owning entry's interval: a shared
/// cell's subtree may span beyond a carved remnant, and only the remnant's
/// own range is visible through it.
pub fn visit_defined<F>(
    arena: &Arena,
    root: OffT,
    space: u8,
    lo: Addr,
    hi: Addr,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(DefinedPiece) -> Result<()>,
{
    let mut cur = lo;
    loop {
        let point = MemoryPayload::probe(space, cur, cur);
        let entry = match MemTree::search(arena, root, &point)? {
            Some((_, entry)) => entry,
            None => match MemTree::next(arena, root, &point)? {
                Some((_, entry)) if entry.space == space && entry.lo <= hi => {
                    cur = entry.lo;
                    continue;
                }
                _ => break,
            },
        };
        let seg_hi = entry.hi.min(hi);
        if entry.is_raw() {
            visit(DefinedPiece {
                lo: cur,
                hi: seg_hi,
                contents: entry.contents + (cur - entry.lo),
                firstline: entry.trace_file_firstline,
            })?;
        } else {
            let subroot = SubtreeCell::load(arena, entry.contents)?;
            visit_subtree(arena, subroot, cur, seg_hi, visit)?;
        }
        match seg_hi.checked_add(1) {
            Some(next) if next <= hi => cur = next,
            _ => break,
        }
    }
    Ok(())
}

fn visit_subtree<F>(arena: &Arena, subroot: OffT, lo: Addr, hi: Addr, visit: &mut F) -> Result<()>
where
    F: FnMut(DefinedPiece) -> Result<()>,
{
    let mut cur = lo;
    loop {
        let point = MemorySubPayload::probe(cur, cur);
        let entry = match MemSubTree::search(arena, subroot, &point)? {
            Some((_, entry)) => entry,
            None => match MemSubTree::next(arena, subroot, &point)? {
                Some((_, entry)) if entry.lo <= hi => {
                    cur = entry.lo;
                    continue;
                }
                _ => break,
            },
        };
        let piece_hi = entry.hi.min(hi);
        visit(DefinedPiece {
            lo: cur,
            hi: piece_hi,
            contents: entry.contents + (cur - entry.lo),
            firstline: entry.trace_file_firstline,
        })?;
        match piece_hi.checked_add(1) {
            Some(next) if next <= hi => cur = next,
            _ => break,
        }
    }
    Ok(())
}

/// Nearest entry of `space` at or above `addr` whose last touch is at or
/// after `minline`, pruning subtrees via the `latest` annotation.
pub fn next_mod_above(
    arena: &Arena,
    off: OffT,
    space: u8,
    addr: Addr,
    minline: u32,
) -> Result<Option<(Addr, Addr)>> {
    if off == 0 {
        return Ok(None);
    }
    let node = MemTree::read_node(arena, off)?;
    if node.annotation.latest < minline {
        return Ok(None);
    }
    let probe = MemoryPayload::probe(space, addr, addr);
    if probe.cmp_payload(&node.payload) != Ordering::Greater {
        if let Some(hit) = next_mod_above(arena, node.left, space, addr, minline)? {
            return Ok(Some(hit));
        }
        if node.payload.space == space && node.payload.trace_file_firstline >= minline {
            return Ok(Some((node.payload.lo, node.payload.hi)));
        }
    }
    next_mod_above(arena, node.right, space, addr, minline)
}

/// Nearest entry of `space` at or below `addr` whose last touch is at or
/// after `minline`.
pub fn next_mod_below(
    arena: &Arena,
    off: OffT,
    space: u8,
    addr: Addr,
    minline: u32,
) -> Result<Option<(Addr, Addr)>> {
    if off == 0 {
        return Ok(None);
    }
    let node = MemTree::read_node(arena, off)?;
    if node.annotation.latest < minline {
        return Ok(None);
    }
    let probe = MemoryPayload::probe(space, addr, addr);
    if probe.cmp_payload(&node.payload) != Ordering::Less {
        if let Some(hit) = next_mod_below(arena, node.right, space, addr, minline)? {
            return Ok(Some(hit));
        }
        if node.payload.space == space && node.payload.trace_file_firstline >= minline {
            return Ok(Some((node.payload.lo, node.payload.hi)));
        }
    }
    next_mod_below(arena, node.left, space, addr, minline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_arena() -> (tempfile::TempDir, Arena) {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = Arena::create(&dir.path().join("memtree.bin")).expect("create arena");
        (dir, arena)
    }

    /// Intervals reachable from a root must be pairwise disjoint per space.
    fn verify_partition(arena: &Arena, root: OffT) {
        let mut prev: Option<MemoryPayload> = None;
        MemTree::walk(arena, root, &mut |_, p: &MemoryPayload| {
            if let Some(ref last) = prev {
                if last.space == p.space {
                    assert!(
                        last.hi < p.lo,
                        "overlap: [{:#x},{:#x}] then [{:#x},{:#x}]",
                        last.lo,
                        last.hi,
                        p.lo,
                        p.hi
                    );
                }
            }
            assert!(p.lo <= p.hi);
            prev = Some(p.clone());
            Ok(())
        })
        .expect("walk");
    }

    fn read_all(arena: &Arena, root: OffT, space: u8, lo: Addr, len: u64) -> (Vec<u8>, Vec<u8>, u32) {
        let mut data = vec![0_u8; len as usize];
        let mut mask = vec![0_u8; len as usize];
        let mut line = 0;
        visit_defined(arena, root, space, lo, lo + len - 1, &mut |piece| {
            let n = (piece.hi - piece.lo + 1) as usize;
            let bytes = arena.read_bytes(piece.contents, n).expect("piece bytes");
            let start = (piece.lo - lo) as usize;
            data[start..start + n].copy_from_slice(&bytes);
            mask[start..start + n].fill(1);
            line = line.max(piece.firstline);
            Ok(())
        })
        .expect("visit");
        (data, mask, line)
    }

    #[test]
    fn initial_root_covers_both_spaces() {
        let (_dir, mut arena) = temp_arena();
        let root = initial_root(&mut arena).expect("initial root");
        verify_partition(&arena, root);

        let mut entries = Vec::new();
        MemTree::walk(&arena, root, &mut |_, p: &MemoryPayload| {
            entries.push((p.space, p.lo, p.hi, p.is_raw()));
            Ok(())
        })
        .expect("walk");
        assert_eq!(
            entries,
            vec![
                (SPACE_MEMORY, 0, Addr::MAX, false),
                (SPACE_REGISTER, 0, Addr::MAX, false),
            ]
        );
    }

    #[test]
    fn write_carves_the_initial_interval() {
        let (_dir, mut arena) = temp_arena();
        let root = initial_root(&mut arena).expect("initial root");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x1000, 0x1001, &[0xAA, 0xBB], 5)
            .expect("write");
        verify_partition(&arena, root);

        let (data, mask, line) = read_all(&arena, root, SPACE_MEMORY, 0x1000, 2);
        assert_eq!(data, vec![0xAA, 0xBB]);
        assert_eq!(mask, vec![1, 1]);
        assert_eq!(line, 5);

        // The carved remnants share the original cell and interval edges.
        let (_, below) = MemTree::search(&arena, root, &MemoryPayload::probe(SPACE_MEMORY, 0xFFF, 0xFFF))
            .expect("search")
            .expect("below remnant");
        assert_eq!((below.lo, below.hi), (0, 0xFFF));
        assert!(!below.is_raw());
        assert_eq!(below.trace_file_firstline, 0, "remnant keeps its old line");
        let (_, above) = MemTree::search(&arena, root, &MemoryPayload::probe(SPACE_MEMORY, 0x1002, 0x1002))
            .expect("search")
            .expect("above remnant");
        assert_eq!(above.lo, 0x1002);
        assert_eq!(above.contents, below.contents, "remnants share one cell");
    }

    #[test]
    fn overlapping_raw_writes_truncate() {
        let (_dir, mut arena) = temp_arena();
        let root = initial_root(&mut arena).expect("initial root");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x100, 0x103, &[1, 2, 3, 4], 5)
            .expect("first write");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x102, 0x102, &[9], 8)
            .expect("second write");
        verify_partition(&arena, root);

        let (data, mask, line) = read_all(&arena, root, SPACE_MEMORY, 0x100, 4);
        assert_eq!(data, vec![1, 2, 9, 4]);
        assert_eq!(mask, vec![1, 1, 1, 1]);
        assert_eq!(line, 8);

        // The untouched prefix still reports the original write line.
        let (_, _, prefix_line) = read_all(&arena, root, SPACE_MEMORY, 0x100, 2);
        assert_eq!(prefix_line, 5);
    }

    #[test]
    fn copy_on_write_keeps_old_roots_intact() {
        let (_dir, mut arena) = temp_arena();
        let root0 = initial_root(&mut arena).expect("initial root");
        let root1 = record_write(&mut arena, root0, SPACE_MEMORY, 0x10, 0x11, &[0xCA, 0xFE], 2)
            .expect("write 1");
        let root2 = record_write(&mut arena, root1, SPACE_MEMORY, 0x11, 0x12, &[0x12, 0x34], 7)
            .expect("write 2");

        let (_, mask0, _) = read_all(&arena, root0, SPACE_MEMORY, 0x10, 3);
        assert_eq!(mask0, vec![0, 0, 0], "state before any write");

        let (data1, mask1, line1) = read_all(&arena, root1, SPACE_MEMORY, 0x10, 3);
        assert_eq!(data1, vec![0xCA, 0xFE, 0]);
        assert_eq!(mask1, vec![1, 1, 0]);
        assert_eq!(line1, 2);

        let (data2, mask2, line2) = read_all(&arena, root2, SPACE_MEMORY, 0x10, 3);
        assert_eq!(data2, vec![0xCA, 0x12, 0x34]);
        assert_eq!(mask2, vec![1, 1, 1]);
        assert_eq!(line2, 7);
    }

    #[test]
    fn retroactive_fill_is_visible_through_old_roots() {
        let (_dir, mut arena) = temp_arena();
        let root0 = initial_root(&mut arena).expect("initial root");
        // Semihosting declares an unknown region at line 3.
        let root1 = declare_unknown(&mut arena, root0, SPACE_MEMORY, 0x2000, 0x2003, 3)
            .expect("declare");
        // A later read at line 7 reveals one byte.
        fill_read(&mut arena, root1, SPACE_MEMORY, 0x2002, 0x2002, &[0xCC], 7).expect("fill");

        // The fill shows through the root that existed before the read.
        let (data, mask, line) = read_all(&arena, root1, SPACE_MEMORY, 0x2002, 1);
        assert_eq!(data, vec![0xCC]);
        assert_eq!(mask, vec![1]);
        assert_eq!(line, 7, "last touch is the line of discovery");

        // Unrevealed neighbours stay undefined.
        let (_, mask, _) = read_all(&arena, root1, SPACE_MEMORY, 0x2000, 4);
        assert_eq!(mask, vec![0, 0, 1, 0]);
    }

    #[test]
    fn refill_does_not_disturb_discovery_line() {
        let (_dir, mut arena) = temp_arena();
        let root = initial_root(&mut arena).expect("initial root");
        let root = declare_unknown(&mut arena, root, SPACE_MEMORY, 0x40, 0x4F, 2).expect("declare");
        fill_read(&mut arena, root, SPACE_MEMORY, 0x42, 0x43, &[7, 8], 5).expect("first fill");
        fill_read(&mut arena, root, SPACE_MEMORY, 0x42, 0x43, &[7, 8], 30).expect("re-read");

        let (_, _, line) = read_all(&arena, root, SPACE_MEMORY, 0x42, 2);
        assert_eq!(line, 5, "re-reads must not advance the discovery line");
    }

    #[test]
    fn shared_cell_clips_to_remnant_interval() {
        let (_dir, mut arena) = temp_arena();
        let root = initial_root(&mut arena).expect("initial root");
        let root = declare_unknown(&mut arena, root, SPACE_MEMORY, 0x100, 0x10F, 1).expect("declare");
        // Reveal the whole region, then overwrite the middle with a raw
        // write: the remnants share the cell whose subtree still spans
        // the full region.
        fill_read(&mut arena, root, SPACE_MEMORY, 0x100, 0x10F, &[0x55; 16], 4).expect("fill");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x104, 0x10B, &[0xEE; 8], 9)
            .expect("overwrite");
        verify_partition(&arena, root);

        let (data, mask, _) = read_all(&arena, root, SPACE_MEMORY, 0x100, 16);
        assert_eq!(mask, vec![1; 16]);
        let mut want = vec![0x55_u8; 16];
        want[4..12].fill(0xEE);
        assert_eq!(data, want);
    }

    #[test]
    fn register_space_is_independent() {
        let (_dir, mut arena) = temp_arena();
        let root = initial_root(&mut arena).expect("initial root");
        let root = record_write(&mut arena, root, SPACE_REGISTER, 0x8, 0xF, &[1, 2, 3, 4, 5, 6, 7, 8], 3)
            .expect("reg write");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x8, 0x9, &[0xAA, 0xBB], 4)
            .expect("mem write");
        verify_partition(&arena, root);

        let (reg, reg_mask, _) = read_all(&arena, root, SPACE_REGISTER, 0x8, 8);
        assert_eq!(reg, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reg_mask, vec![1; 8]);

        let (mem, _, _) = read_all(&arena, root, SPACE_MEMORY, 0x8, 2);
        assert_eq!(mem, vec![0xAA, 0xBB]);
    }

    #[test]
    fn next_mod_skips_entries_below_minline() {
        let (_dir, mut arena) = temp_arena();
        let root = initial_root(&mut arena).expect("initial root");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x100, 0x101, &[1, 1], 5).expect("w");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x200, 0x201, &[2, 2], 9).expect("w");
        let root = record_write(&mut arena, root, SPACE_MEMORY, 0x300, 0x301, &[3, 3], 7).expect("w");

        // Forward from 0x102: the line-9 entry is the nearest with
        // minline 8; the line-7 entry at 0x300 is nearer for minline 6.
        assert_eq!(
            next_mod_above(&arena, root, SPACE_MEMORY, 0x102, 8).expect("fwd"),
            Some((0x200, 0x201))
        );
        assert_eq!(
            next_mod_above(&arena, root, SPACE_MEMORY, 0x202, 6).expect("fwd"),
            Some((0x300, 0x301))
        );
        assert_eq!(
            next_mod_above(&arena, root, SPACE_MEMORY, 0x302, 6).expect("fwd"),
            None
        );

        // Backward from 0x2FF with minline 6 finds the line-9 entry.
        assert_eq!(
            next_mod_below(&arena, root, SPACE_MEMORY, 0x2FF, 6).expect("bwd"),
            Some((0x200, 0x201))
        );
        // Covering entries count as "at" the address in both directions.
        assert_eq!(
            next_mod_above(&arena, root, SPACE_MEMORY, 0x200, 9).expect("fwd"),
            Some((0x200, 0x201))
        );
    }
}
