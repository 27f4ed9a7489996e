//! Event tracing for JIT debugging.
//!
//! Every coordinator decision (lookups, compiles, invalidations, halts) is
//! stamped with a sequence number and kept in a bounded ring. A host can
//! read the ring at any time, or drain it to ship events elsewhere.

use std::collections::VecDeque;
use std::fmt;

use crate::config::JitConfig;

/// Trace event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// `run` entered generated code
    RunEnter { pc: u64 },
    /// `run` returned to the host
    RunExit { pc: u64, halted: bool },
    /// Block lookup from generated code
    CacheLookup { pc: u64, hit: bool },
    /// Block translated and emitted
    BlockCompiled {
        pc: u64,
        guest_range: (u64, u64),
        host_size: usize,
        insts: usize,
    },
    /// Compiled code discarded
    CacheInvalidate {
        /// None = full clear
        ranges: Option<Vec<(u64, u64)>>,
        reason: &'static str,
    },
    /// Code memory fell below the low-water mark
    PressureEviction { remaining: usize, low_water_mark: usize },
    /// Invalidation requested while executing; deferred to the next safe point
    HaltRequested { reason: &'static str },
}

impl TraceEvent {
    /// Guest PC the event is about, if it concerns a single location.
    pub fn pc(&self) -> Option<u64> {
        match *self {
            TraceEvent::RunEnter { pc }
            | TraceEvent::RunExit { pc, .. }
            | TraceEvent::CacheLookup { pc, .. }
            | TraceEvent::BlockCompiled { pc, .. } => Some(pc),
            _ => None,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::RunEnter { pc } => write!(f, "RUN   enter pc={pc:#x}"),
            TraceEvent::RunExit { pc, halted } => {
                write!(f, "RUN   exit  pc={pc:#x} halted={halted}")
            }
            TraceEvent::CacheLookup { pc, hit } => {
                write!(f, "LOOK  pc={pc:#x} {}", if *hit { "hit" } else { "miss" })
            }
            TraceEvent::BlockCompiled {
                pc,
                guest_range: (lo, hi),
                host_size,
                insts,
            } => write!(
                f,
                "EMIT  pc={pc:#x} guest=[{lo:#x}, {hi:#x}] host={host_size}B insts={insts}"
            ),
            TraceEvent::CacheInvalidate { ranges: None, reason } => {
                write!(f, "CLEAR all ({reason})")
            }
            TraceEvent::CacheInvalidate {
                ranges: Some(ranges),
                reason,
            } => write!(f, "INVAL {} range(s) ({reason})", ranges.len()),
            TraceEvent::PressureEviction {
                remaining,
                low_water_mark,
            } => write!(f, "EVICT remaining={remaining} < {low_water_mark}"),
            TraceEvent::HaltRequested { reason } => write!(f, "HALT  ({reason})"),
        }
    }
}

/// An event and its position in the JIT's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    /// Monotonic across the whole JIT lifetime; never reused after a drain.
    pub seq: u64,
    pub event: TraceEvent,
}

/// Aggregate counts over the events currently in the buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub runs: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub compilations: u64,
    pub host_bytes: usize,
    pub full_clears: u64,
    pub range_invalidations: u64,
    pub pressure_evictions: u64,
    pub halt_requests: u64,
    /// Events pushed out of the ring since construction
    pub dropped: u64,
}

impl TraceStats {
    fn count(mut self, event: &TraceEvent) -> Self {
        match event {
            TraceEvent::RunEnter { .. } => self.runs += 1,
            TraceEvent::RunExit { .. } => {}
            TraceEvent::CacheLookup { hit: true, .. } => self.cache_hits += 1,
            TraceEvent::CacheLookup { hit: false, .. } => self.cache_misses += 1,
            TraceEvent::BlockCompiled { host_size, .. } => {
                self.compilations += 1;
                self.host_bytes += host_size;
            }
            TraceEvent::CacheInvalidate { ranges: None, .. } => self.full_clears += 1,
            TraceEvent::CacheInvalidate { ranges: Some(_), .. } => self.range_invalidations += 1,
            TraceEvent::PressureEviction { .. } => self.pressure_evictions += 1,
            TraceEvent::HaltRequested { .. } => self.halt_requests += 1,
        }
        self
    }
}

/// Bounded ring of [`TraceRecord`]s. A capacity of zero records nothing.
#[derive(Debug, Default)]
pub struct TraceBuffer {
    records: VecDeque<TraceRecord>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

impl TraceBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            ..Default::default()
        }
    }

    /// Recording only when `trace_enabled` is set.
    pub fn from_config(config: &JitConfig) -> Self {
        Self::with_capacity(if config.trace_enabled {
            config.trace_capacity
        } else {
            0
        })
    }

    pub fn is_recording(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resize the ring, dropping the oldest records that no longer fit.
    /// Zero stops recording.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict_to(capacity);
    }

    pub fn record(&mut self, event: TraceEvent) {
        if !self.is_recording() {
            return;
        }
        self.evict_to(self.capacity - 1);
        self.records.push_back(TraceRecord {
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;
    }

    fn evict_to(&mut self, len: usize) {
        while self.records.len() > len {
            self.records.pop_front();
            self.dropped += 1;
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &TraceRecord> {
        self.records.iter()
    }

    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.records.iter().map(|r| &r.event)
    }

    /// Records stamped `seq` or later.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = &TraceRecord> {
        self.records.iter().filter(move |r| r.seq >= seq)
    }

    /// Sequence number the next recorded event will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Hand every buffered record to the caller and empty the ring.
    pub fn drain(&mut self) -> Vec<TraceRecord> {
        self.records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn events_for_pc(&self, pc: u64) -> Vec<&TraceEvent> {
        self.events().filter(|e| e.pc() == Some(pc)).collect()
    }

    pub fn stats(&self) -> TraceStats {
        let stats = TraceStats {
            dropped: self.dropped,
            ..Default::default()
        };
        self.events().fold(stats, TraceStats::count)
    }

    /// Log the most recent `count` records at debug level.
    pub fn dump_recent(&self, count: usize) {
        let start = self.records.len().saturating_sub(count);
        log::debug!("═══ Recent {} JIT Events ═══", count);
        for record in self.records.iter().skip(start) {
            log::debug!("[{:6}] {}", record.seq, record.event);
        }
    }
}
