//! Expiration engine (`spec.md` 4.7) and flush (`spec.md` 4.8).
//!
//! The multi-pass state machine below follows `conn_expire` in
//! `examples/original_source/src/ip_vs_conn.c` line for line, including a
//! detail its prose summary in `spec.md` 3 elides: the unhash call's result
//! is never inspected. A hashed flow with no other holder rests at
//! refcount 1 (the creator's own construction-time hold, released once the
//! caller that made it is done with it — see the comment on
//! `dp_vs_conn_new`'s `rte_atomic32_set(&new->refcnt, 1)` in the source:
//! "caller will use it right after created, just like dp_vs_conn_get()").
//! Step 2's self-reference brings that to 2, which is exactly the count
//! `unhash` requires to succeed. If some other holder is also present,
//! unhash fails `BUSY` without unlinking, and the immediately following
//! `hash` call is a harmless no-op (a flow unhash didn't unlink is still
//! hashed, so re-hashing returns `EXIST`, which this engine — like the
//! source — ignores). The terminal/reprieve branch is decided purely by
//! reading the refcount after that attempt, not by its result. `flush`
//! mirrors the same self-reference/threshold pattern, checked against 2
//! (the pre-unhash analogue of expire's post-unhash 1) since it never
//! actually unhashes before taking its own reference.

use std::time::Duration;

use crate::collab::{ForwardMode, InboundTransmit, LocalAddrPool, ProtocolOps, SourceAddrPool, TimerService};
use crate::conntrack::alloc::FlowAllocator;
use crate::conntrack::table::CoreTable;
use crate::stats::{self, StatExt};

const JITTER_MAX_MICROS: u64 = 1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// Reached the terminal branch and was returned to the allocator.
    Freed,
    /// Still referenced (or mid SYN-retry/controlling children); re-armed.
    Reprieved,
}

fn jitter() -> Duration {
    use rand::Rng;
    Duration::from_micros(rand::thread_rng().gen_range(0..JITTER_MAX_MICROS))
}

/// `spec.md` 4.7. Runs on the flow's owning core when its timer fires.
#[allow(clippy::too_many_arguments)]
pub fn expire(
    table: &mut CoreTable,
    idx: u32,
    proto_ops: &dyn ProtocolOps,
    timer: &dyn TimerService,
    source_pool: Option<&dyn SourceAddrPool>,
    laddr_pool: Option<&dyn LocalAddrPool>,
    inbound: &dyn InboundTransmit,
    alloc: &mut FlowAllocator,
) -> ExpireOutcome {
    // 1. Recompute timeout.
    let new_timeout = {
        let flow = table.get(idx).expect("expiring slot occupied");
        let state = flow.state.load(std::sync::atomic::Ordering::Acquire);
        let base = proto_ops
            .get_conn_timeout(flow)
            .unwrap_or_else(|| proto_ops.timeout_for(state));
        base + jitter()
    };
    table.get_mut(idx).unwrap().timeout = new_timeout;

    // 2. Self-reference.
    table.get(idx).unwrap().refcnt_inc();

    // 3. SYN-proxy retransmit phase.
    let retransmit = {
        let flow = table.get(idx).unwrap();
        flow.syn.saved_syn.is_some() && flow.syn.syn_retry_max > 0
    };
    if retransmit {
        let saved = table.get(idx).unwrap().syn.saved_syn.clone().unwrap();
        inbound.retransmit_syn(&saved);
        stats::SYN_RETRANSMITS.inc();
        table.get_mut(idx).unwrap().syn.syn_retry_max -= 1;
        timer.update(idx as u64, new_timeout, false);
        table.get(idx).unwrap().refcnt_dec();
        return ExpireOutcome::Reprieved;
    }

    // 4. Controller phase.
    if table.get(idx).unwrap().n_control() > 0 {
        timer.update(idx as u64, new_timeout, false);
        table.get(idx).unwrap().refcnt_dec();
        return ExpireOutcome::Reprieved;
    }

    // 5. Unhash phase — result deliberately ignored; see module doc.
    let _ = table.unhash(idx);

    // 6. Terminal check.
    if table.get(idx).unwrap().refcnt() == 1 {
        stats::EXPIRE_TERMINAL.inc();
        timer.cancel(idx as u64, false);

        if let Some(parent_idx) = table.get(idx).unwrap().parent {
            if let Some(parent) = table.get_mut(parent_idx) {
                parent.n_control_dec();
            }
        }

        proto_ops.conn_expire(table.get(idx).unwrap());

        let (is_snat_release, caddr, cport, vaddr, vport, oif) = {
            let flow = table.get(idx).unwrap();
            let is_snat = flow.fwdmode == Some(ForwardMode::SourceNat) && flow.proto != 1;
            (
                is_snat,
                flow.caddr,
                flow.cport,
                flow.vaddr,
                flow.vport,
                flow.oif.clone(),
            )
        };
        if is_snat_release {
            if let Some(pool) = source_pool {
                let _ = cport;
                let _ = vport;
                pool.release(oif.as_deref().unwrap_or(""), caddr, vaddr);
            }
        }

        if let Some(pool) = laddr_pool {
            crate::conntrack::bind::unbind_laddr(table.get(idx).unwrap(), pool);
        }
        crate::conntrack::bind::unbind_destination(table.get_mut(idx).unwrap());

        {
            let flow = table.get_mut(idx).unwrap();
            flow.syn.deferred_acks.clear();
            flow.syn.saved_syn = None;
        }

        table.get(idx).unwrap().refcnt_dec();
        let flow = table.remove(idx).expect("flow present for removal");
        alloc.release(flow);
        stats::FLOWS_FREED.inc();
        ExpireOutcome::Freed
    } else {
        stats::EXPIRE_REPRIEVES.inc();
        let _ = table.hash(idx);
        timer.update(idx as u64, new_timeout, false);
        table.get(idx).unwrap().refcnt_dec();
        ExpireOutcome::Reprieved
    }
}

/// `spec.md` 4.8. Loops until a full pass frees nothing (the loop-until-
/// stable variant from the Open Questions in `spec.md` 9 — the source
/// returns after the first eligible flow per call). Returns the total
/// number of flows freed.
pub fn flush(
    table: &mut CoreTable,
    timer: &dyn TimerService,
    source_pool: Option<&dyn SourceAddrPool>,
    laddr_pool: Option<&dyn LocalAddrPool>,
    alloc: &mut FlowAllocator,
) -> usize {
    let mut total = 0;
    loop {
        let freed_this_pass = flush_pass(table, timer, source_pool, laddr_pool, alloc);
        total += freed_this_pass;
        if freed_this_pass == 0 {
            break;
        }
    }
    total
}

fn flush_pass(
    table: &mut CoreTable,
    timer: &dyn TimerService,
    source_pool: Option<&dyn SourceAddrPool>,
    laddr_pool: Option<&dyn LocalAddrPool>,
    alloc: &mut FlowAllocator,
) -> usize {
    let mut freed = 0;
    for idx in table.occupied_slots() {
        timer.cancel(idx as u64, false);
        table.get(idx).unwrap().refcnt_inc();

        if table.get(idx).unwrap().refcnt() == 2 {
            let _ = table.unhash(idx);

            let (is_snat_release, caddr, vaddr, oif) = {
                let flow = table.get(idx).unwrap();
                let is_snat = flow.fwdmode == Some(ForwardMode::SourceNat) && flow.proto != 1;
                (is_snat, flow.caddr, flow.vaddr, flow.oif.clone())
            };
            if is_snat_release {
                if let Some(pool) = source_pool {
                    pool.release(oif.as_deref().unwrap_or(""), caddr, vaddr);
                }
            }
            if let Some(pool) = laddr_pool {
                crate::conntrack::bind::unbind_laddr(table.get(idx).unwrap(), pool);
            }
            crate::conntrack::bind::unbind_destination(table.get_mut(idx).unwrap());
            table.get(idx).unwrap().refcnt_dec();

            let flow = table.remove(idx).expect("flow present for removal");
            alloc.release(flow);
            stats::FLOWS_FREED.inc();
            freed += 1;
        } else {
            table.get(idx).unwrap().refcnt_dec();
        }
    }
    freed
}
