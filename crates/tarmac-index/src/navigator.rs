//! Navigation and query operations over a completed index.

use tarmac_error::{Result, TarmacError};
use tarmac_types::{Addr, Image, RegisterId, Time};

use crate::layout::{
    ByPCPayload, ByPcTree, CallDepthArrayEntry, SeqOrderAnnotation, SeqOrderPayload, SeqTree,
    SPACE_MEMORY, SPACE_REGISTER,
};
use crate::lrt;
use crate::memtree::{self, DefinedPiece};
use crate::reader::IndexReader;

/// A reconstructed view of memory or registers at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemView {
    /// The bytes; undefined positions read as zero.
    pub data: Vec<u8>,
    /// One flag byte per data byte: 1 = defined, 0 = unknown.
    pub defined: Vec<u8>,
    /// Line of the latest trace event that wrote any defined byte, or 0
    /// if nothing in the range is defined.
    pub last_touch_line: u32,
}

impl MemView {
    /// Whether every byte of the view is defined.
    #[must_use]
    pub fn fully_defined(&self) -> bool {
        self.defined.iter().all(|&d| d != 0)
    }
}

/// The first defined subregion found by [`IndexNavigator::getmem_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedRegion {
    pub addr: Addr,
    pub data: Vec<u8>,
    pub last_touch_line: u32,
}

/// Navigation over a completed index, with optional symbol support from
/// an image of the traced program.
pub struct IndexNavigator {
    pub index: IndexReader,
    image: Option<Box<dyn Image>>,
    /// (loaded address) - (address in image file).
    load_offset: u64,
}

impl IndexNavigator {
    #[must_use]
    pub fn new(index: IndexReader) -> Self {
        Self {
            index,
            image: None,
            load_offset: 0,
        }
    }

    #[must_use]
    pub fn with_image(index: IndexReader, image: Box<dyn Image>, load_offset: u64) -> Self {
        Self {
            index,
            image: Some(image),
            load_offset,
        }
    }

    #[must_use]
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Look up a symbol, returning its loaded address and size.
    #[must_use]
    pub fn lookup_symbol(&self, name: &str) -> Option<(Addr, u64)> {
        let (addr, size) = self.image.as_ref()?.lookup_symbol(name)?;
        Some((addr.wrapping_add(self.load_offset), size))
    }

    /// Render a traced address symbolically, if the image knows it.
    #[must_use]
    pub fn symbolic_address(&self, addr: Addr) -> Option<String> {
        self.image
            .as_ref()?
            .symbolic_address(addr.wrapping_sub(self.load_offset))
    }

    // === Sequential navigation ===

    /// The last node whose (coerced) timestamp is at or before `t`.
    ///
    /// `mod_time` is weakly monotone in tree order, so a single descent
    /// tracking the best candidate suffices; ties resolve to the last.
    pub fn node_at_time(&self, t: Time) -> Result<Option<SeqOrderPayload>> {
        let arena = self.index.arena();
        let mut off = self.index.seqroot();
        let mut best = None;
        while off != 0 {
            let node = SeqTree::read_node(arena, off)?;
            if node.payload.mod_time <= t {
                best = Some(node.payload);
                off = node.right;
            } else {
                off = node.left;
            }
        }
        Ok(best)
    }

    /// The unique node whose line range contains `line`.
    pub fn node_at_line(&self, line: u32) -> Result<Option<SeqOrderPayload>> {
        let arena = self.index.arena();
        let mut off = self.index.seqroot();
        while off != 0 {
            let node = SeqTree::read_node(arena, off)?;
            if line < node.payload.trace_file_firstline {
                off = node.left;
            } else if line >= node.payload.trace_file_firstline + node.payload.trace_file_lines {
                off = node.right;
            } else {
                return Ok(Some(node.payload));
            }
        }
        Ok(None)
    }

    /// The node after `node` in trace order.
    pub fn get_next_node(&self, node: &SeqOrderPayload) -> Result<Option<SeqOrderPayload>> {
        Ok(SeqTree::next(self.index.arena(), self.index.seqroot(), node)?.map(|(_, p)| p))
    }

    /// The node before `node` in trace order.
    pub fn get_previous_node(&self, node: &SeqOrderPayload) -> Result<Option<SeqOrderPayload>> {
        Ok(SeqTree::prev(self.index.arena(), self.index.seqroot(), node)?.map(|(_, p)| p))
    }

    /// The first (`end = false`) or last (`end = true`) node of the trace.
    pub fn find_buffer_limit(&self, end: bool) -> Result<Option<SeqOrderPayload>> {
        let arena = self.index.arena();
        let root = self.index.seqroot();
        let found = if end {
            SeqTree::rightmost(arena, root)?
        } else {
            SeqTree::leftmost(arena, root)?
        };
        Ok(found.map(|(_, p)| p))
    }

    // === Memory and registers ===

    /// Reconstruct `size` bytes of `space` at `addr`, as seen from
    /// `memroot`. Unknown bytes are zero in the data and 0 in the mask;
    /// asking about unknown memory is not an error.
    pub fn getmem(&self, memroot: u64, space: u8, addr: Addr, size: u64) -> Result<MemView> {
        let mut view = MemView {
            data: vec![0_u8; size as usize],
            defined: vec![0_u8; size as usize],
            last_touch_line: 0,
        };
        if size == 0 || memroot == 0 {
            return Ok(view);
        }
        let hi = addr
            .checked_add(size - 1)
            .ok_or_else(|| TarmacError::out_of_range("memory range end", size))?;
        let arena = self.index.arena();
        memtree::visit_defined(arena, memroot, space, addr, hi, &mut |piece| {
            let len = (piece.hi - piece.lo + 1) as usize;
            let bytes = arena.read_bytes(piece.contents, len)?;
            let start = (piece.lo - addr) as usize;
            view.data[start..start + len].copy_from_slice(&bytes);
            view.defined[start..start + len].fill(1);
            view.last_touch_line = view.last_touch_line.max(piece.firstline);
            Ok(())
        })?;
        Ok(view)
    }

    /// The first defined subregion at or above `addr` within
    /// `[addr, addr + size)`, with adjacent defined pieces coalesced.
    pub fn getmem_next(
        &self,
        memroot: u64,
        space: u8,
        addr: Addr,
        size: u64,
    ) -> Result<Option<DefinedRegion>> {
        if size == 0 || memroot == 0 {
            return Ok(None);
        }
        let hi = addr
            .checked_add(size - 1)
            .ok_or_else(|| TarmacError::out_of_range("memory range end", size))?;
        let arena = self.index.arena();
        let mut pieces: Vec<DefinedPiece> = Vec::new();
        memtree::visit_defined(arena, memroot, space, addr, hi, &mut |piece| {
            pieces.push(piece);
            Ok(())
        })?;
        let Some(first) = pieces.first().copied() else {
            return Ok(None);
        };
        let mut data = arena.read_bytes(first.contents, (first.hi - first.lo + 1) as usize)?;
        let mut region = DefinedRegion {
            addr: first.lo,
            data: Vec::new(),
            last_touch_line: first.firstline,
        };
        let mut run_hi = first.hi;
        for piece in &pieces[1..] {
            if piece.lo != run_hi + 1 {
                break;
            }
            let bytes = arena.read_bytes(piece.contents, (piece.hi - piece.lo + 1) as usize)?;
            data.extend_from_slice(&bytes);
            run_hi = piece.hi;
            region.last_touch_line = region.last_touch_line.max(piece.firstline);
        }
        region.data = data;
        Ok(Some(region))
    }

    /// The raw bytes of a register. Fails unless every byte is defined.
    pub fn get_reg_bytes(&self, memroot: u64, reg: &RegisterId) -> Result<Vec<u8>> {
        let view = self.getmem(memroot, SPACE_REGISTER, reg.base, reg.size as u64)?;
        if !view.fully_defined() {
            return Err(TarmacError::undefined(format!(
                "register bytes at {:#x}+{}",
                reg.base, reg.size
            )));
        }
        Ok(view.data)
    }

    /// A register's value as an integer, assembled according to the traced
    /// CPU's endianness. Fails for undefined bytes and for registers wider
    /// than 8 bytes.
    pub fn get_reg_value(&self, memroot: u64, reg: &RegisterId) -> Result<u64> {
        if reg.size > 8 {
            return Err(TarmacError::out_of_range(
                "register width in bytes",
                reg.size as u64,
            ));
        }
        let bytes = self.get_reg_bytes(memroot, reg)?;
        let mut value = 0_u64;
        if self.index.is_big_endian() {
            for &b in &bytes {
                value = (value << 8) | b as u64;
            }
        } else {
            for &b in bytes.iter().rev() {
                value = (value << 8) | b as u64;
            }
        }
        Ok(value)
    }

    /// The address range of the nearest piece of `space` state, in the
    /// direction of `sign` from `addr`, last touched at or after
    /// `minline`. Subtrees with no modification that late are skipped via
    /// their annotations.
    pub fn find_next_mod(
        &self,
        memroot: u64,
        space: u8,
        addr: Addr,
        minline: u32,
        sign: i32,
    ) -> Result<Option<(Addr, Addr)>> {
        let arena = self.index.arena();
        if sign > 0 {
            memtree::next_mod_above(arena, memroot, space, addr, minline)
        } else if sign < 0 {
            memtree::next_mod_below(arena, memroot, space, addr, minline)
        } else {
            Err(TarmacError::internal("find_next_mod needs a nonzero sign"))
        }
    }

    /// Reconstruct memory as seen just after `node`.
    pub fn getmem_at(&self, node: &SeqOrderPayload, addr: Addr, size: u64) -> Result<MemView> {
        self.getmem(node.memory_root, SPACE_MEMORY, addr, size)
    }

    // === PC tree ===

    /// Every visit to `pc`, as trace-file first lines in trace order.
    pub fn pc_visits(&self, pc: Addr) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut line = 0;
        while let Some(next) = self.next_pc_visit(pc, line)? {
            out.push(next);
            line = next;
        }
        Ok(out)
    }

    /// The first visit to `pc` strictly after trace line `after_line`.
    pub fn next_pc_visit(&self, pc: Addr, after_line: u32) -> Result<Option<u32>> {
        let probe = ByPCPayload {
            pc,
            trace_file_firstline: after_line,
        };
        let found = ByPcTree::next(self.index.arena(), self.index.bypcroot(), &probe)?;
        Ok(found.and_then(|(_, p)| (p.pc == pc).then_some(p.trace_file_firstline)))
    }

    // === Layered range tree ===

    /// Find the `line`th trace line (from zero) whose call depth is in
    /// `[mindepth_i, maxdepth_i)`, and return how many earlier lines have
    /// call depth in `[mindepth_o, maxdepth_o)`. Fails with `OutOfRange`
    /// if there is no such line.
    pub fn lrt_translate(
        &self,
        line: u32,
        mindepth_i: u32,
        maxdepth_i: u32,
        mindepth_o: u32,
        maxdepth_o: u32,
    ) -> Result<u32> {
        self.lrt_translate_may_fail(line, mindepth_i, maxdepth_i, mindepth_o, maxdepth_o)?
            .ok_or_else(|| TarmacError::out_of_range("visible line index", line as u64))
    }

    /// As [`Self::lrt_translate`], returning `None` instead of failing
    /// when fewer than `line + 1` lines exist in the input depth range.
    ///
    /// `line` equal to the total is the virtual one-past-the-end position
    /// and yields the whole-trace count for the output range.
    pub fn lrt_translate_may_fail(
        &self,
        line: u32,
        mindepth_i: u32,
        maxdepth_i: u32,
        mindepth_o: u32,
        maxdepth_o: u32,
    ) -> Result<Option<u32>> {
        let root = self.index.seqroot();
        if root == 0 {
            return Ok((line == 0).then_some(0));
        }
        let arena = self.index.arena();
        let node = SeqTree::read_node(arena, root)?;
        let arr = lrt::read_array(arena, &node.annotation)?;
        let ia = lrt::lower_index(&arr, mindepth_i);
        let ib = lrt::lower_index(&arr, maxdepth_i);
        let ja = lrt::lower_index(&arr, mindepth_o);
        let jb = lrt::lower_index(&arr, maxdepth_o);
        let total_in = arr[ib].cumulative_lines - arr[ia].cumulative_lines;
        let total_out = arr[jb].cumulative_lines - arr[ja].cumulative_lines;
        if line > total_in {
            return Ok(None);
        }
        if line == total_in {
            return Ok(Some(total_out));
        }
        self.lrt_descend(
            node, arr, ia, ib, ja, jb, line, mindepth_i, maxdepth_i, mindepth_o, maxdepth_o,
        )
        .map(Some)
    }

    /// How many lines with call depth in the output range fall between the
    /// `linestart`th and `lineend`th lines of the input depth range.
    pub fn lrt_translate_range(
        &self,
        linestart: u32,
        lineend: u32,
        mindepth_i: u32,
        maxdepth_i: u32,
        mindepth_o: u32,
        maxdepth_o: u32,
    ) -> Result<u32> {
        let end = self.lrt_translate(lineend, mindepth_i, maxdepth_i, mindepth_o, maxdepth_o)?;
        let start = self.lrt_translate(linestart, mindepth_i, maxdepth_i, mindepth_o, maxdepth_o)?;
        Ok(end - start)
    }

    /// Descend the layered range tree. Only the root's array has been
    /// binary-searched; from here every step follows cross-links, so the
    /// whole search stays O(log n).
    #[allow(clippy::too_many_arguments)]
    fn lrt_descend(
        &self,
        mut node: tarmac_disktree::Node<SeqOrderPayload, SeqOrderAnnotation>,
        mut arr: Vec<CallDepthArrayEntry>,
        mut ia: usize,
        mut ib: usize,
        mut ja: usize,
        mut jb: usize,
        mut line: u32,
        mindepth_i: u32,
        maxdepth_i: u32,
        mindepth_o: u32,
        maxdepth_o: u32,
    ) -> Result<u32> {
        let arena = self.index.arena();
        let mut acc = 0_u32;
        loop {
            if node.left != 0 {
                let lnode = SeqTree::read_node(arena, node.left)?;
                let larr = lrt::read_array(arena, &lnode.annotation)?;
                let lia = arr[ia].leftlink as usize;
                let lib = arr[ib].leftlink as usize;
                let lja = arr[ja].leftlink as usize;
                let ljb = arr[jb].leftlink as usize;
                let left_in = larr[lib].cumulative_lines - larr[lia].cumulative_lines;
                if line < left_in {
                    node = lnode;
                    arr = larr;
                    ia = lia;
                    ib = lib;
                    ja = lja;
                    jb = ljb;
                    continue;
                }
                line -= left_in;
                acc += larr[ljb].cumulative_lines - larr[lja].cumulative_lines;
            }

            let depth = node.payload.call_depth;
            let in_range = mindepth_i <= depth && depth < maxdepth_i;
            let out_range = mindepth_o <= depth && depth < maxdepth_o;
            let node_lines = if in_range { node.payload.trace_file_lines } else { 0 };
            if line < node_lines {
                if out_range {
                    acc += line;
                }
                return Ok(acc);
            }
            line -= node_lines;
            if out_range {
                acc += node.payload.trace_file_lines;
            }

            if node.right == 0 {
                return Err(TarmacError::internal(
                    "layered-range descent overran the tree",
                ));
            }
            let rnode = SeqTree::read_node(arena, node.right)?;
            let rarr = lrt::read_array(arena, &rnode.annotation)?;
            let ria = arr[ia].rightlink as usize;
            let rib = arr[ib].rightlink as usize;
            let rja = arr[ja].rightlink as usize;
            let rjb = arr[jb].rightlink as usize;
            node = rnode;
            arr = rarr;
            ia = ria;
            ib = rib;
            ja = rja;
            jb = rjb;
        }
    }
}
