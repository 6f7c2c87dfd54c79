//! Per-core counters.
//!
//! Thread-local `Cell<u64>` counters, one set per owning core, following the
//! `StatExt`/`thread_local!` pattern used elsewhere in this codebase for
//! cheap, lock-free per-core stats. These are observational only: nothing in
//! the tracker reads them back to make decisions.

use std::cell::Cell;

thread_local! {
    pub(crate) static FLOWS_CREATED: Cell<u64> = const { Cell::new(0) };
    pub(crate) static FLOWS_FREED: Cell<u64> = const { Cell::new(0) };
    pub(crate) static HASH_EXIST: Cell<u64> = const { Cell::new(0) };
    pub(crate) static UNHASH_BUSY: Cell<u64> = const { Cell::new(0) };
    pub(crate) static UNHASH_NOTEXIST: Cell<u64> = const { Cell::new(0) };
    pub(crate) static EXPIRE_REPRIEVES: Cell<u64> = const { Cell::new(0) };
    pub(crate) static EXPIRE_TERMINAL: Cell<u64> = const { Cell::new(0) };
    pub(crate) static SYN_RETRANSMITS: Cell<u64> = const { Cell::new(0) };
    pub(crate) static TEMPLATE_INVALIDATIONS: Cell<u64> = const { Cell::new(0) };
    pub(crate) static BIND_OVERLOAD: Cell<u64> = const { Cell::new(0) };
    pub(crate) static ALLOC_NOMEM: Cell<u64> = const { Cell::new(0) };
}

pub(crate) trait StatExt: Sized {
    fn inc(&'static self) {
        self.inc_by(1);
    }
    fn inc_by(&'static self, val: u64);
}

impl StatExt for std::thread::LocalKey<Cell<u64>> {
    fn inc_by(&'static self, val: u64) {
        self.set(self.get() + val);
    }
}
