//! The event stream interface between the Tarmac text parser and the
//! indexer, plus the call-heuristic and image collaborator seams.
//!
//! The parser groups everything a trace lists for one observable instant
//! (an instruction together with the register updates and memory accesses
//! it causes) into a single [`TraceEvent`]. The indexer consumes these in
//! trace order and never looks at the trace text itself.

use crate::{Addr, RegisterId, Time};

/// A memory access carried by a trace event.
///
/// `bytes` holds the data in ascending address order starting at `addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemAccess {
    pub addr: Addr,
    pub bytes: Vec<u8>,
}

/// A register write carried by a trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegWrite {
    pub reg: RegisterId,
    pub bytes: Vec<u8>,
}

/// One observable instant of the trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceEvent {
    /// Timestamp as listed in the trace file. May be non-monotone; the
    /// indexer coerces it against the latest time seen.
    pub time: Time,
    /// Program counter at this event.
    pub pc: Addr,
    /// True for CPU exception events.
    pub exception: bool,
    /// Byte range `[pos, pos + len)` of this event in the trace file.
    pub pos: u64,
    pub len: u64,
    /// Line range `[firstline, firstline + lines)` in the trace file.
    pub firstline: u32,
    pub lines: u32,
    /// Memory stores: the data is known at this instant.
    pub mem_writes: Vec<MemAccess>,
    /// Memory loads: reveal, with hindsight, contents of regions that were
    /// previously declared unknown.
    pub mem_reads: Vec<MemAccess>,
    /// Register file updates.
    pub reg_writes: Vec<RegWrite>,
    /// Regions written by semihosting calls whose data the trace does not
    /// show: `(addr, size)` pairs.
    pub semihost_regions: Vec<(Addr, u64)>,
}

/// Verdict of the call-detection heuristic for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEffect {
    /// This event enters a function: call depth increases.
    Call,
    /// This event leaves a function: call depth decreases.
    Return,
    /// Neither.
    Normal,
}

/// Call/return detection policy.
///
/// The policy itself (branch decoding, known function boundaries from an
/// image, ...) lives outside the core; the indexer only consumes the
/// verdicts.
pub trait CallHeuristic {
    /// Classify one event given the previous PC and the current call depth.
    fn classify(&mut self, prev_pc: Option<Addr>, event: &TraceEvent, depth: u32) -> CallEffect;
}

/// A heuristic that never detects calls. Used when call recording is
/// disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallAnalysis;

impl CallHeuristic for NoCallAnalysis {
    fn classify(&mut self, _prev_pc: Option<Addr>, _event: &TraceEvent, _depth: u32) -> CallEffect {
        CallEffect::Normal
    }
}

/// Symbol lookup against the program image under trace.
///
/// Addresses handed to `symbolic_address` have already had the load offset
/// applied by the navigator.
pub trait Image {
    /// Look up a symbol by name, returning its address and size.
    fn lookup_symbol(&self, name: &str) -> Option<(Addr, u64)>;

    /// Render an address symbolically (`"main+0x14"`), if known.
    fn symbolic_address(&self, addr: Addr) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_call_analysis_is_always_normal() {
        let mut h = NoCallAnalysis;
        let ev = TraceEvent {
            pc: 0x8000,
            ..TraceEvent::default()
        };
        assert_eq!(h.classify(None, &ev, 0), CallEffect::Normal);
        assert_eq!(h.classify(Some(0x7FFC), &ev, 12), CallEffect::Normal);
    }
}
