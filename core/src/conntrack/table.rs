//! Per-core and shared flow tables (`spec.md` 4.2/4.3).
//!
//! Both tables share one layout: a `2^bits`-bucket array of intrusive,
//! doubly-linked tuple-node chains, realized as an array-backed slab with
//! next/prev indices (`spec.md` 9) instead of raw pointer back-references.
//! A node's own slot/direction is recoverable from its `node_idx` (`slot*2 +
//! direction_bit`), so there is no separate back-reference to store.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::conntrack::flow::{Flow, F_HASHED};
use crate::conntrack::tuple::{AddressFamily, Direction, TupleNode};
use crate::error::ConnError;
use crate::hash::{hashkey, HashSeed};
use crate::stats::{self, StatExt};

const NONE: u32 = u32::MAX;

fn node_idx(slot: u32, dir: Direction) -> u32 {
    slot * 2 + if dir == Direction::Out { 1 } else { 0 }
}

fn slot_of(node: u32) -> u32 {
    node / 2
}

fn dir_of(node: u32) -> Direction {
    if node.is_multiple_of(2) {
        Direction::In
    } else {
        Direction::Out
    }
}

/// The slab + bucket-chain structure shared by [`CoreTable`] and
/// [`TemplateTable`].
struct Slab {
    seed: HashSeed,
    bits: u32,
    buckets: Vec<u32>,
    slots: Vec<Option<Box<Flow>>>,
    free: Vec<u32>,
    next: Vec<u32>,
    prev: Vec<u32>,
}

impl Slab {
    fn new(bits: u32) -> Self {
        Slab {
            seed: HashSeed::new(),
            bits,
            buckets: vec![NONE; 1usize << bits],
            slots: Vec::new(),
            free: Vec::new(),
            next: Vec::new(),
            prev: Vec::new(),
        }
    }

    fn bucket_for(&self, node: &TupleNode) -> usize {
        let (s, d) = node.hash_words();
        hashkey(self.seed, s, node.sport, d, node.dport, self.bits) as usize
    }

    /// Inserts a flow into a free slot, returning its index. The flow is
    /// not hashed yet; `new` fills it in, then calls [`CoreTable::hash`].
    fn insert(&mut self, flow: Box<Flow>) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(flow);
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(flow));
            self.next.push(NONE);
            self.next.push(NONE);
            self.prev.push(NONE);
            self.prev.push(NONE);
            idx
        }
    }

    fn get(&self, idx: u32) -> Option<&Flow> {
        self.slots.get(idx as usize)?.as_deref()
    }

    fn get_mut(&mut self, idx: u32) -> Option<&mut Flow> {
        self.slots.get_mut(idx as usize)?.as_deref_mut()
    }

    /// Removes the flow from the slab, handing ownership back to the
    /// caller (who returns it to the allocator).
    fn remove(&mut self, idx: u32) -> Option<Box<Flow>> {
        let flow = self.slots.get_mut(idx as usize)?.take()?;
        self.free.push(idx);
        Some(flow)
    }

    fn link(&mut self, bucket: usize, node: u32) {
        let head = self.buckets[bucket];
        self.next[node as usize] = head;
        self.prev[node as usize] = NONE;
        if head != NONE {
            self.prev[head as usize] = node;
        }
        self.buckets[bucket] = node;
    }

    fn unlink(&mut self, bucket: usize, node: u32) {
        let p = self.prev[node as usize];
        let n = self.next[node as usize];
        if p != NONE {
            self.next[p as usize] = n;
        } else {
            self.buckets[bucket] = n;
        }
        if n != NONE {
            self.prev[n as usize] = p;
        }
        self.next[node as usize] = NONE;
        self.prev[node as usize] = NONE;
    }

    fn link_both(&mut self, idx: u32) {
        let flow = self.slots[idx as usize].as_ref().expect("slot occupied");
        let bi = self.bucket_for(&flow.in_node);
        let bo = self.bucket_for(&flow.out_node);
        self.link(bi, node_idx(idx, Direction::In));
        self.link(bo, node_idx(idx, Direction::Out));
    }

    fn unlink_both(&mut self, idx: u32) {
        let flow = self.slots[idx as usize].as_ref().expect("slot occupied");
        let bi = self.bucket_for(&flow.in_node);
        let bo = self.bucket_for(&flow.out_node);
        self.unlink(bi, node_idx(idx, Direction::In));
        self.unlink(bo, node_idx(idx, Direction::Out));
    }

    /// Generic bucket walk used by both directional and template lookup.
    fn lookup_bucket(
        &self,
        bucket: usize,
        mut matches: impl FnMut(&Flow, Direction) -> bool,
    ) -> Option<(u32, Direction)> {
        let mut cur = self.buckets[bucket];
        while cur != NONE {
            let slot = slot_of(cur);
            let dir = dir_of(cur);
            if let Some(flow) = self.get(slot) {
                if matches(flow, dir) {
                    return Some((slot, dir));
                }
            }
            cur = self.next[cur as usize];
        }
        None
    }
}

fn with_conn_lock<R>(lock: &Option<AtomicBool>, f: impl FnOnce() -> R) -> R {
    if let Some(lock) = lock {
        while lock.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        let r = f();
        lock.store(false, Ordering::Release);
        r
    } else {
        f()
    }
}

fn lookup_key(
    reverse: bool,
    s: std::net::IpAddr,
    sp: u16,
    d: std::net::IpAddr,
    dp: u16,
) -> (std::net::IpAddr, u16, std::net::IpAddr, u16) {
    if reverse {
        (d, dp, s, sp)
    } else {
        (s, sp, d, dp)
    }
}

/// A per-core flow table: single-writer, single-reader on the owning core.
pub struct CoreTable {
    slab: Slab,
    conn_lock: Option<AtomicBool>,
}

impl CoreTable {
    pub fn new(bits: u32) -> Self {
        CoreTable {
            slab: Slab::new(bits),
            conn_lock: if cfg!(feature = "conn_lock") {
                Some(AtomicBool::new(false))
            } else {
                None
            },
        }
    }

    pub fn insert(&mut self, flow: Box<Flow>) -> u32 {
        self.slab.insert(flow)
    }

    pub fn get(&self, idx: u32) -> Option<&Flow> {
        self.slab.get(idx)
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut Flow> {
        self.slab.get_mut(idx)
    }

    pub fn remove(&mut self, idx: u32) -> Option<Box<Flow>> {
        self.slab.remove(idx)
    }

    /// Parents `child` to `parent` (`spec.md` 3's "optional pointer to
    /// parent control flow and counter of controlled children" — e.g. an
    /// FTP data flow controlled by its command flow). The protocol layer
    /// that recognizes such a relationship calls this after both flows
    /// exist; `expire` detaches it again on the child's teardown.
    pub fn attach_control(&mut self, child: u32, parent: u32) {
        if let Some(p) = self.slab.get(parent) {
            p.n_control_inc();
        }
        if let Some(c) = self.slab.get_mut(child) {
            c.parent = Some(parent);
        }
    }

    /// `spec.md` 4.2 `hash`.
    pub fn hash(&mut self, idx: u32) -> Result<(), ConnError> {
        let slab = &mut self.slab;
        let lock = &self.conn_lock;
        with_conn_lock(lock, move || {
            let flow = slab.get(idx).ok_or(ConnError::NotExist)?;
            if flow.is_hashed() {
                stats::HASH_EXIST.inc();
                return Err(ConnError::Exist);
            }
            slab.link_both(idx);
            let flow = slab.get(idx).unwrap();
            flow.set_flag(F_HASHED);
            flow.refcnt_inc();
            Ok(())
        })
    }

    /// `spec.md` 4.2 `unhash`.
    pub fn unhash(&mut self, idx: u32) -> Result<(), ConnError> {
        let slab = &mut self.slab;
        let lock = &self.conn_lock;
        with_conn_lock(lock, move || {
            let flow = slab.get(idx).ok_or(ConnError::NotExist)?;
            if !flow.is_hashed() {
                stats::UNHASH_NOTEXIST.inc();
                return Err(ConnError::NotExist);
            }
            if flow.refcnt() != 2 {
                stats::UNHASH_BUSY.inc();
                return Err(ConnError::Busy);
            }
            slab.unlink_both(idx);
            let flow = slab.get(idx).unwrap();
            flow.clear_flag(F_HASHED);
            flow.refcnt_dec();
            Ok(())
        })
    }

    /// `spec.md` 4.2/4.9 `lookup`/`get`.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup(
        &self,
        af: AddressFamily,
        proto: u8,
        s: std::net::IpAddr,
        sp: u16,
        d: std::net::IpAddr,
        dp: u16,
        reverse: bool,
    ) -> Option<(u32, Direction)> {
        with_conn_lock(&self.conn_lock, || {
            let (qs, qsp, qd, qdp) = lookup_key(reverse, s, sp, d, dp);
            let bucket = self
                .slab
                .bucket_for(&TupleNode {
                    af,
                    proto,
                    direction: Direction::In,
                    saddr: qs,
                    sport: qsp,
                    daddr: qd,
                    dport: qdp,
                });
            let hit = self.slab.lookup_bucket(bucket, |flow, dir| {
                let node = if dir == Direction::In {
                    &flow.in_node
                } else {
                    &flow.out_node
                };
                node.matches(af, proto, qs, qsp, qd, qdp)
            });
            if let Some((slot, _)) = hit {
                self.slab.get(slot).unwrap().refcnt_inc();
            }
            hit
        })
    }

    pub fn len(&self) -> usize {
        self.slab.slots.len() - self.slab.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over occupied slot indices, for `flush` (`spec.md` 4.8).
    pub fn occupied_slots(&self) -> Vec<u32> {
        self.slab
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect()
    }
}

/// The shared persistence-template table, protected by one process-global
/// spinlock (`spec.md` 4.3). Hand-rolled `AtomicBool` test-and-set: this is
/// core domain logic, not an ambient concern, so no external spinlock crate
/// stands in for it.
pub struct Spinlock(AtomicBool);

impl Spinlock {
    pub const fn new() -> Self {
        Spinlock(AtomicBool::new(false))
    }

    pub fn lock<R>(&self, f: impl FnOnce() -> R) -> R {
        while self.0.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        let r = f();
        self.0.store(false, Ordering::Release);
        r
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TemplateTable {
    slab: Slab,
    lock: Spinlock,
}

impl TemplateTable {
    pub fn new(bits: u32) -> Self {
        TemplateTable {
            slab: Slab::new(bits),
            lock: Spinlock::new(),
        }
    }

    pub fn insert(&mut self, flow: Box<Flow>) -> u32 {
        self.lock.lock(|| self.slab.insert(flow))
    }

    pub fn get(&self, idx: u32) -> Option<&Flow> {
        self.lock.lock(|| {
            // Safety note: reads under the same lock discipline as writes;
            // `Slab::get` only borrows, so this is sound without unsafe.
            self.slab.get(idx)
        })
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut Flow> {
        self.lock.lock(|| self.slab.get_mut(idx))
    }

    pub fn remove(&mut self, idx: u32) -> Option<Box<Flow>> {
        self.lock.lock(|| self.slab.remove(idx))
    }

    pub fn hash(&mut self, idx: u32) -> Result<(), ConnError> {
        self.lock.lock(|| {
            let flow = self.slab.get(idx).ok_or(ConnError::NotExist)?;
            if flow.is_hashed() {
                return Err(ConnError::Exist);
            }
            self.slab.link_both(idx);
            let flow = self.slab.get(idx).unwrap();
            flow.set_flag(F_HASHED);
            flow.refcnt_inc();
            Ok(())
        })
    }

    pub fn unhash(&mut self, idx: u32) -> Result<(), ConnError> {
        self.lock.lock(|| {
            let flow = self.slab.get(idx).ok_or(ConnError::NotExist)?;
            if !flow.is_hashed() {
                return Err(ConnError::NotExist);
            }
            if flow.refcnt() != 2 {
                return Err(ConnError::Busy);
            }
            self.slab.unlink_both(idx);
            let flow = self.slab.get(idx).unwrap();
            flow.clear_flag(F_HASHED);
            flow.refcnt_dec();
            Ok(())
        })
    }

    /// `spec.md` 4.9 `template_in_get`: matches only `TEMPLATE` flows;
    /// `proto == 0` (IP) makes the destination-address match family-agnostic.
    #[allow(clippy::too_many_arguments)]
    pub fn template_in_get(
        &self,
        af: AddressFamily,
        proto: u8,
        s: std::net::IpAddr,
        sp: u16,
        d: std::net::IpAddr,
        dp: u16,
    ) -> Option<u32> {
        self.lock.lock(|| {
            let bucket = self.slab.bucket_for(&TupleNode {
                af,
                proto,
                direction: Direction::In,
                saddr: s,
                sport: sp,
                daddr: d,
                dport: dp,
            });
            let hit = self.slab.lookup_bucket(bucket, |flow, dir| {
                if dir != Direction::In || !flow.is_template() {
                    return false;
                }
                let node = &flow.in_node;
                let daddr_matches = if proto == 0 {
                    crate::conntrack::tuple::addr_to_u32(node.daddr)
                        == crate::conntrack::tuple::addr_to_u32(d)
                } else {
                    node.af == af && node.daddr == d
                };
                node.proto == proto
                    && node.sport == sp
                    && node.dport == dp
                    && node.saddr == s
                    && daddr_matches
            });
            if let Some((slot, _)) = hit {
                self.slab.get(slot).unwrap().refcnt_inc();
                return Some(slot);
            }
            None
        })
    }

    pub fn occupied_slots(&self) -> Vec<u32> {
        self.lock.lock(|| {
            self.slab
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
                .collect()
        })
    }
}

impl Default for TemplateTable {
    fn default() -> Self {
        Self::new(20)
    }
}
