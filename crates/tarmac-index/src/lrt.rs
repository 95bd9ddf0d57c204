//! The layered-range post-pass.
//!
//! Once the sequential order tree is frozen, a bottom-up walk gives every
//! node a cumulative call-depth frequency table with cross-links into its
//! children's tables. Searches then binary-search only the root's table
//! and follow cross-links thereafter, keeping multi-depth-range queries at
//! O(log n).

use std::collections::BTreeSet;

use tarmac_arena::Arena;
use tarmac_error::Result;
use tarmac_types::{DiskRecord, OffT};
use tracing::debug;

use crate::layout::{CallDepthArrayEntry, SeqOrderAnnotation, SeqTree, SENTINEL_DEPTH};

/// Index of the first entry with depth greater or equal to `depth`.
///
/// Arrays are sentinel-terminated, so the result can only run off the end
/// for depths above `SENTINEL_DEPTH`; those clamp to the sentinel entry,
/// whose counts are the subtree totals (no real item sorts at or above the
/// sentinel).
pub(crate) fn lower_index(arr: &[CallDepthArrayEntry], depth: u32) -> usize {
    let idx = arr.partition_point(|e| e.call_depth < depth);
    idx.min(arr.len().saturating_sub(1))
}

fn counts_below(arr: &[CallDepthArrayEntry], depth: u32) -> (u32, u32) {
    if arr.is_empty() {
        return (0, 0);
    }
    let entry = &arr[lower_index(arr, depth)];
    (entry.cumulative_lines, entry.cumulative_insns)
}

/// Read a node's call-depth array out of the arena.
pub(crate) fn read_array(
    arena: &Arena,
    annotation: &SeqOrderAnnotation,
) -> Result<Vec<CallDepthArrayEntry>> {
    let len = annotation.call_depth_arraylen as usize;
    let buf = arena.read_bytes(annotation.call_depth_array, len * CallDepthArrayEntry::SIZE)?;
    Ok(buf
        .chunks_exact(CallDepthArrayEntry::SIZE)
        .map(CallDepthArrayEntry::read_from)
        .collect())
}

/// Merge child arrays with one node's own contribution.
fn merge_arrays(
    left: &[CallDepthArrayEntry],
    right: &[CallDepthArrayEntry],
    depth: u32,
    lines: u32,
) -> Vec<CallDepthArrayEntry> {
    let mut depths = BTreeSet::new();
    depths.insert(depth);
    for entry in left.iter().chain(right) {
        if entry.call_depth != SENTINEL_DEPTH {
            depths.insert(entry.call_depth);
        }
    }
    let mut out = Vec::with_capacity(depths.len() + 1);
    for d in depths.into_iter().chain(std::iter::once(SENTINEL_DEPTH)) {
        let (left_lines, left_insns) = counts_below(left, d);
        let (right_lines, right_insns) = counts_below(right, d);
        let (own_lines, own_insns) = if depth < d { (lines, 1) } else { (0, 0) };
        out.push(CallDepthArrayEntry {
            call_depth: d,
            cumulative_lines: left_lines + right_lines + own_lines,
            cumulative_insns: left_insns + right_insns + own_insns,
            leftlink: if left.is_empty() { 0 } else { lower_index(left, d) as OffT },
            rightlink: if right.is_empty() { 0 } else { lower_index(right, d) as OffT },
        });
    }
    out
}

fn decorate_node(arena: &mut Arena, off: OffT) -> Result<Vec<CallDepthArrayEntry>> {
    if off == 0 {
        return Ok(Vec::new());
    }
    let node = SeqTree::read_node(arena, off)?;
    let left = decorate_node(arena, node.left)?;
    let right = decorate_node(arena, node.right)?;
    let merged = merge_arrays(
        &left,
        &right,
        node.payload.call_depth,
        node.payload.trace_file_lines,
    );

    let mut buf = vec![0_u8; merged.len() * CallDepthArrayEntry::SIZE];
    for (i, entry) in merged.iter().enumerate() {
        entry.write_to(&mut buf[i * CallDepthArrayEntry::SIZE..(i + 1) * CallDepthArrayEntry::SIZE]);
    }
    let array_off = arena.alloc(buf.len() as u64)?;
    arena.write_bytes(array_off, &buf)?;

    // The one sanctioned write into an exposed node: the annotation slot
    // was reserved (zeroed) at insert time and is filled exactly once.
    SeqTree::write_annotation(
        arena,
        off,
        &SeqOrderAnnotation {
            call_depth_array: array_off,
            call_depth_arraylen: merged.len() as u32,
        },
    )?;
    Ok(merged)
}

/// Fill in every call-depth array of the finished seq tree.
pub fn decorate(arena: &mut Arena, seqroot: OffT) -> Result<()> {
    let root_array = decorate_node(arena, seqroot)?;
    if let Some(totals) = root_array.last() {
        debug!(
            insns = totals.cumulative_insns,
            lines = totals.cumulative_lines,
            "layered range tree decorated"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SeqOrderPayload;

    fn seq_node(firstline: u32, lines: u32, depth: u32) -> SeqOrderPayload {
        SeqOrderPayload {
            mod_time: firstline as u64,
            pc: 0x8000,
            trace_file_pos: 0,
            trace_file_len: 0,
            trace_file_firstline: firstline,
            trace_file_lines: lines,
            memory_root: 0,
            call_depth: depth,
        }
    }

    fn build_tree(arena: &mut Arena, nodes: &[(u32, u32, u32)]) -> OffT {
        let mut root = 0;
        for &(firstline, lines, depth) in nodes {
            root = SeqTree::insert(arena, root, seq_node(firstline, lines, depth))
                .expect("insert")
                .root;
        }
        root
    }

    fn temp_arena() -> (tempfile::TempDir, Arena) {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = Arena::create(&dir.path().join("lrt.bin")).expect("create arena");
        (dir, arena)
    }

    /// Count lines with depth in [lo, hi) by full scan.
    fn scan_lines(nodes: &[(u32, u32, u32)], lo: u32, hi: u32) -> u32 {
        nodes
            .iter()
            .filter(|(_, _, d)| lo <= *d && *d < hi)
            .map(|(_, lines, _)| *lines)
            .sum()
    }

    #[test]
    fn leaf_array_has_the_minimal_shape() {
        let (_dir, mut arena) = temp_arena();
        let root = build_tree(&mut arena, &[(1, 3, 2)]);
        decorate(&mut arena, root).expect("decorate");

        let node = SeqTree::read_node(&arena, root).expect("read");
        let arr = read_array(&arena, &node.annotation).expect("array");
        assert_eq!(arr.len(), 2);
        assert_eq!(
            (arr[0].call_depth, arr[0].cumulative_lines, arr[0].cumulative_insns),
            (2, 0, 0)
        );
        assert_eq!(
            (arr[1].call_depth, arr[1].cumulative_lines, arr[1].cumulative_insns),
            (SENTINEL_DEPTH, 3, 1)
        );
    }

    #[test]
    fn totals_match_subtree_contents_everywhere() {
        let (_dir, mut arena) = temp_arena();
        let nodes: Vec<(u32, u32, u32)> = (0..40)
            .map(|i| (i + 1, 1 + i % 3, (i * 7) % 5))
            .collect();
        let root = build_tree(&mut arena, &nodes);
        decorate(&mut arena, root).expect("decorate");

        // Every node's sentinel entry counts exactly its subtree.
        fn check(arena: &Arena, off: OffT) -> (u32, u32) {
            if off == 0 {
                return (0, 0);
            }
            let node = SeqTree::read_node(arena, off).expect("read");
            let (l_insns, l_lines) = check(arena, node.left);
            let (r_insns, r_lines) = check(arena, node.right);
            let insns = l_insns + r_insns + 1;
            let lines = l_lines + r_lines + node.payload.trace_file_lines;
            let arr = read_array(arena, &node.annotation).expect("array");
            let last = arr.last().expect("sentinel");
            assert_eq!(last.call_depth, SENTINEL_DEPTH);
            assert_eq!(last.cumulative_insns, insns);
            assert_eq!(last.cumulative_lines, lines);
            assert_eq!(arr[0].cumulative_lines, 0, "arrays start at zero");
            (insns, lines)
        }
        check(&arena, root);
    }

    #[test]
    fn arrays_are_sorted_with_valid_cross_links() {
        let (_dir, mut arena) = temp_arena();
        let nodes: Vec<(u32, u32, u32)> = (0..60).map(|i| (i + 1, 1, i % 7)).collect();
        let root = build_tree(&mut arena, &nodes);
        decorate(&mut arena, root).expect("decorate");

        fn check(arena: &Arena, off: OffT) {
            if off == 0 {
                return;
            }
            let node = SeqTree::read_node(arena, off).expect("read");
            let arr = read_array(arena, &node.annotation).expect("array");
            for pair in arr.windows(2) {
                assert!(pair[0].call_depth < pair[1].call_depth, "not sorted");
            }
            for child in [node.left, node.right] {
                if child == 0 {
                    continue;
                }
                let cnode = SeqTree::read_node(arena, child).expect("read child");
                let carr = read_array(arena, &cnode.annotation).expect("child array");
                for entry in &arr {
                    let link = if child == node.left {
                        entry.leftlink
                    } else {
                        entry.rightlink
                    } as usize;
                    assert!(link < carr.len(), "link past end");
                    // The link lands on the first child entry at or above
                    // this entry's depth.
                    assert!(carr[link].call_depth >= entry.call_depth || link == carr.len() - 1);
                    assert_eq!(link, lower_index(&carr, entry.call_depth));
                }
            }
            check(arena, node.left);
            check(arena, node.right);
        }
        check(&arena, root);
    }

    #[test]
    fn root_counts_agree_with_full_scan() {
        let (_dir, mut arena) = temp_arena();
        let nodes: Vec<(u32, u32, u32)> = (0..50)
            .map(|i| (i + 1, 1 + (i % 2), [0, 1, 2, 1, 0, 3, 2][i as usize % 7]))
            .collect();
        let root = build_tree(&mut arena, &nodes);
        decorate(&mut arena, root).expect("decorate");

        let node = SeqTree::read_node(&arena, root).expect("read");
        let arr = read_array(&arena, &node.annotation).expect("array");
        for (lo, hi) in [(0, 1), (0, 4), (1, 3), (2, u32::MAX), (0, u32::MAX)] {
            let got = arr[lower_index(&arr, hi)].cumulative_lines
                - arr[lower_index(&arr, lo)].cumulative_lines;
            assert_eq!(got, scan_lines(&nodes, lo, hi), "range [{lo},{hi})");
        }
    }
}
