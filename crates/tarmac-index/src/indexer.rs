//! The streaming indexer: one pass over parsed trace events, maintaining
//! the evolving tree roots, the call-depth counter, and the deferred
//! memory fills, then freezing the file with the layered-range post-pass
//! and the COMPLETE flag.

use std::path::Path;

use tarmac_arena::Arena;
use tarmac_error::{Result, TarmacError};
use tarmac_types::{
    Addr, CallEffect, CallHeuristic, DiskRecord, IndexFlags, IndexerParams, OffT, Time, TraceEvent,
};
use tracing::{debug, info};

use crate::layout::{
    ByPCPayload, ByPcTree, FileHeader, SeqOrderPayload, SeqTree, EXCEPTION_PC, FILE_HEADER_OFFSET,
    MAGIC, MAGIC_OFFSET, SPACE_MEMORY, SPACE_REGISTER,
};
use crate::lrt;
use crate::memtree;

/// Builds an index file from a stream of trace events.
///
/// Events must arrive in trace order; byte positions and line numbers must
/// be monotone. Timestamps may jitter backwards and are coerced forward.
pub struct Indexer<H: CallHeuristic> {
    arena: Arena,
    params: IndexerParams,
    heuristic: H,
    seqroot: OffT,
    bypcroot: OffT,
    memroot: OffT,
    call_depth: u32,
    latest_time: Time,
    prev_pc: Option<Addr>,
    next_byte: u64,
    next_line: u32,
    events: u64,
}

impl<H: CallHeuristic> Indexer<H> {
    /// Create an index file destined to be kept on disk.
    ///
    /// Fails with [`TarmacError::NotPersistable`] unless all optional
    /// subsystems are enabled: a deficient index must not be findable by
    /// another tool later.
    pub fn create(path: &Path, params: IndexerParams, heuristic: H) -> Result<Self> {
        if !params.can_store_on_disk() {
            return Err(TarmacError::NotPersistable);
        }
        Self::create_transient(path, params, heuristic)
    }

    /// Create an index the caller promises to delete after use, e.g. a
    /// temp file backing a single in-process analysis. This skips the
    /// persistence gate, so subsystems may be disabled to save space.
    pub fn create_transient(path: &Path, params: IndexerParams, heuristic: H) -> Result<Self> {
        let mut arena = Arena::create(path)?;
        let magic_off = arena.alloc(MAGIC.len() as u64)?;
        debug_assert_eq!(magic_off, MAGIC_OFFSET);
        arena.write_bytes(magic_off, &MAGIC)?;
        let header_off = arena.alloc(FileHeader::SIZE as u64)?;
        debug_assert_eq!(header_off, FILE_HEADER_OFFSET);
        // Roots are zero and COMPLETE is absent until finish(): a crashed
        // or aborted build leaves a file that open-time validation
        // rejects.
        arena.write_record(
            header_off,
            &FileHeader {
                flags: params.header_flags(),
                seqroot: 0,
                bypcroot: 0,
                lineno_offset: params.lineno_offset,
            },
        )?;
        let memroot = if params.record_memory {
            memtree::initial_root(&mut arena)?
        } else {
            0
        };
        Ok(Self {
            arena,
            params,
            heuristic,
            seqroot: 0,
            bypcroot: 0,
            memroot,
            call_depth: 0,
            latest_time: 0,
            prev_pc: None,
            next_byte: 0,
            next_line: 1,
            events: 0,
        })
    }

    fn end_addr(lo: Addr, len: u64, line: u32) -> Result<Addr> {
        lo.checked_add(len - 1)
            .ok_or_else(|| TarmacError::parse(line, format!("address range wraps at {lo:#x}")))
    }

    /// Consume one event.
    pub fn push(&mut self, event: &TraceEvent) -> Result<()> {
        if event.pos < self.next_byte {
            return Err(TarmacError::parse(
                event.firstline,
                format!(
                    "byte position went backwards: {} after {}",
                    event.pos, self.next_byte
                ),
            ));
        }
        if event.firstline < self.next_line {
            return Err(TarmacError::parse(
                event.firstline,
                format!(
                    "line number went backwards: {} after {}",
                    event.firstline, self.next_line
                ),
            ));
        }
        if event.lines == 0 {
            return Err(TarmacError::parse(event.firstline, "event covers no lines"));
        }
        self.next_byte = event.pos + event.len;
        self.next_line = event.firstline + event.lines;

        // Nearby events are sometimes listed out of order; coerce
        // too-early timestamps up to the latest seen.
        let time = event.time.max(self.latest_time);
        self.latest_time = time;

        if self.params.record_memory {
            for write in &event.mem_writes {
                if write.bytes.is_empty() {
                    continue;
                }
                let hi = Self::end_addr(write.addr, write.bytes.len() as u64, event.firstline)?;
                self.memroot = memtree::record_write(
                    &mut self.arena,
                    self.memroot,
                    SPACE_MEMORY,
                    write.addr,
                    hi,
                    &write.bytes,
                    event.firstline,
                )?;
            }
            for write in &event.reg_writes {
                if write.bytes.len() != write.reg.size as usize {
                    return Err(TarmacError::parse(
                        event.firstline,
                        format!(
                            "register write width {} does not match register size {}",
                            write.bytes.len(),
                            write.reg.size
                        ),
                    ));
                }
                let (lo, hi) = write.reg.range();
                self.memroot = memtree::record_write(
                    &mut self.arena,
                    self.memroot,
                    SPACE_REGISTER,
                    lo,
                    hi,
                    &write.bytes,
                    event.firstline,
                )?;
            }
            for &(addr, size) in &event.semihost_regions {
                if size == 0 {
                    continue;
                }
                let hi = Self::end_addr(addr, size, event.firstline)?;
                self.memroot = memtree::declare_unknown(
                    &mut self.arena,
                    self.memroot,
                    SPACE_MEMORY,
                    addr,
                    hi,
                    event.firstline,
                )?;
            }
            for read in &event.mem_reads {
                if read.bytes.is_empty() {
                    continue;
                }
                let hi = Self::end_addr(read.addr, read.bytes.len() as u64, event.firstline)?;
                memtree::fill_read(
                    &mut self.arena,
                    self.memroot,
                    SPACE_MEMORY,
                    read.addr,
                    hi,
                    &read.bytes,
                    event.firstline,
                )?;
            }
        }

        if self.params.record_calls {
            let effect = self
                .heuristic
                .classify(self.prev_pc, event, self.call_depth);
            if self.params.debug_call_heuristics {
                debug!(
                    pc = event.pc,
                    line = event.firstline,
                    depth = self.call_depth,
                    ?effect,
                    "call heuristic"
                );
            }
            match effect {
                CallEffect::Call => self.call_depth += 1,
                CallEffect::Return => self.call_depth = self.call_depth.saturating_sub(1),
                CallEffect::Normal => {}
            }
        }

        let pc_key = if event.exception { EXCEPTION_PC } else { event.pc };
        self.bypcroot = ByPcTree::insert(
            &mut self.arena,
            self.bypcroot,
            ByPCPayload {
                pc: pc_key,
                trace_file_firstline: event.firstline,
            },
        )?
        .root;

        self.seqroot = SeqTree::insert(
            &mut self.arena,
            self.seqroot,
            SeqOrderPayload {
                mod_time: time,
                pc: event.pc,
                trace_file_pos: event.pos,
                trace_file_len: event.len,
                trace_file_firstline: event.firstline,
                trace_file_lines: event.lines,
                memory_root: self.memroot,
                call_depth: self.call_depth,
            },
        )?
        .root;

        self.prev_pc = Some(event.pc);
        self.events += 1;
        Ok(())
    }

    /// Run the layered-range post-pass, write the header, and set the
    /// COMPLETE flag last.
    pub fn finish(mut self) -> Result<()> {
        lrt::decorate(&mut self.arena, self.seqroot)?;

        let mut header = FileHeader {
            flags: self.params.header_flags(),
            seqroot: self.seqroot,
            bypcroot: self.bypcroot,
            lineno_offset: self.params.lineno_offset,
        };
        self.arena.write_record(FILE_HEADER_OFFSET, &header)?;
        self.arena.flush()?;

        header.flags |= IndexFlags::COMPLETE;
        self.arena.write_record(FILE_HEADER_OFFSET, &header)?;
        self.arena.flush()?;

        info!(
            events = self.events,
            bytes = self.arena.size(),
            "index generation complete"
        );
        Ok(())
    }
}

/// Index a whole event stream into `path`.
///
/// A parse error from the stream aborts the build; the file is left
/// without the COMPLETE flag and open-time validation will reject it.
pub fn run_indexer<H, I>(path: &Path, events: I, params: IndexerParams, heuristic: H) -> Result<()>
where
    H: CallHeuristic,
    I: IntoIterator<Item = Result<TraceEvent>>,
{
    let mut indexer = Indexer::create(path, params, heuristic)?;
    for event in events {
        indexer.push(&event?)?;
    }
    indexer.finish()
}
