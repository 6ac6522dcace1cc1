#![cfg_attr(not(test), no_std)]
//! Process-wide cache statistics: one aggregation struct behind a
//! `mutex::SpinLock`, with every counter increment compiling to a no-op
//! when the `stats` feature is disabled.

use mutex::SpinLock;

/// Which opcode family a counter increment belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    LoadAttr,
    LoadMethod,
    StoreAttr,
    LoadGlobal,
    BinarySubscr,
}

const OPCODE_COUNT: usize = 5;

impl Opcode {
    const fn index(self) -> usize {
        match self {
            Opcode::LoadAttr => 0,
            Opcode::LoadMethod => 1,
            Opcode::StoreAttr => 2,
            Opcode::LoadGlobal => 3,
            Opcode::BinarySubscr => 4,
        }
    }
}

/// Per-opcode-family counters, as exposed by `stats()`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Counters {
    pub hits: u64,
    pub misses: u64,
    pub slight_misses: u64,
    pub uncacheable: u64,
    pub entries: u64,
}

/// The process-wide statistics aggregator.
pub struct Stats {
    counters: SpinLock<[Counters; OPCODE_COUNT]>,
}

impl Stats {
    #[must_use]
    pub const fn new() -> Self {
        Stats {
            counters: SpinLock::new([Counters {
                hits: 0,
                misses: 0,
                slight_misses: 0,
                uncacheable: 0,
                entries: 0,
            }; OPCODE_COUNT]),
        }
    }

    #[cfg(feature = "stats")]
    pub fn record_hit(&self, op: Opcode) {
        self.counters.lock()[op.index()].hits += 1;
    }
    #[cfg(not(feature = "stats"))]
    pub fn record_hit(&self, _op: Opcode) {}

    #[cfg(feature = "stats")]
    pub fn record_miss(&self, op: Opcode) {
        self.counters.lock()[op.index()].misses += 1;
    }
    #[cfg(not(feature = "stats"))]
    pub fn record_miss(&self, _op: Opcode) {}

    #[cfg(feature = "stats")]
    pub fn record_slight_miss(&self, op: Opcode) {
        self.counters.lock()[op.index()].slight_misses += 1;
    }
    #[cfg(not(feature = "stats"))]
    pub fn record_slight_miss(&self, _op: Opcode) {}

    #[cfg(feature = "stats")]
    pub fn record_uncacheable(&self, op: Opcode) {
        self.counters.lock()[op.index()].uncacheable += 1;
    }
    #[cfg(not(feature = "stats"))]
    pub fn record_uncacheable(&self, _op: Opcode) {}

    #[cfg(feature = "stats")]
    pub fn record_entry_created(&self, op: Opcode) {
        self.counters.lock()[op.index()].entries += 1;
    }
    #[cfg(not(feature = "stats"))]
    pub fn record_entry_created(&self, _op: Opcode) {}

    #[cfg(feature = "stats")]
    pub fn record_entry_freed(&self, op: Opcode) {
        let mut counters = self.counters.lock();
        counters[op.index()].entries = counters[op.index()].entries.saturating_sub(1);
    }
    #[cfg(not(feature = "stats"))]
    pub fn record_entry_freed(&self, _op: Opcode) {}

    /// A point-in-time copy of every opcode family's counters.
    #[must_use]
    pub fn snapshot(&self) -> [Counters; OPCODE_COUNT] {
        *self.counters.lock()
    }

    #[must_use]
    pub fn for_opcode(&self, op: Opcode) -> Counters {
        self.counters.lock()[op.index()]
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// The single process-wide instance, mirroring the donor workspace's
/// preference for a static aggregator over a heap-allocated singleton.
pub static GLOBAL: Stats = Stats::new();
