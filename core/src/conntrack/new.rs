//! Flow construction (`spec.md` 4.6).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::collab::{Destination, ForwardMode, LocalAddrPool, TimerService};
use crate::config::HotConfig;
use crate::conntrack::alloc::FlowAllocator;
use crate::conntrack::bind::{bind_destination, bind_laddr, unbind_destination, unbind_laddr};
use crate::conntrack::flow::{ConnParams, Flow, SynProxyState, F_SYNPROXY, F_TEMPLATE};
use crate::conntrack::table::CoreTable;
use crate::conntrack::tuple::{Direction, TupleNode};
use crate::error::ConnError;
use crate::stats::{self, StatExt};

/// The original SYN packet, captured for proxy retransmit and deferred-ACK
/// bookkeeping; populated by the TCP state-machine collaborator that parsed
/// it, since parsing TCP headers is explicitly out of scope for this core.
pub struct SynCapture {
    pub bytes: Vec<u8>,
    pub ack_seq: u32,
    /// The protocol's own encoding of `TCP_SYN_SENT`, passed through rather
    /// than hard-coded (the state machine that owns it is out of scope).
    pub syn_sent_state: u8,
    pub syn_sent_timeout: Duration,
}

const JITTER_MAX_MICROS: u64 = 1000;

/// `spec.md` 4.6 `new`. Returns the new flow's slot index in `table`,
/// unwinding every earlier successful step in reverse order on failure
/// (`spec.md` 7) and always releasing the allocated record back to the
/// allocator rather than leaking it (the fix for the source's documented
/// leak on a late construction failure, `spec.md` 9).
#[allow(clippy::too_many_arguments)]
pub fn conn_new(
    alloc: &mut FlowAllocator,
    table: &mut CoreTable,
    params: &ConnParams,
    dest: Arc<dyn Destination + Send + Sync>,
    flags: u32,
    laddr_pool: Option<&dyn LocalAddrPool>,
    hot: &HotConfig,
    timer: &dyn TimerService,
    syn_capture: Option<SynCapture>,
) -> Result<u32, ConnError> {
    let is_template = flags & F_TEMPLATE != 0;

    let mut flow = alloc.acquire()?;
    *flow = Flow::zeroed();

    let rport = if is_template || params.ct_dport != 0 {
        params.ct_dport
    } else if dest.fwdmode() == ForwardMode::SourceNat {
        match params.l4_src_port {
            Some(p) => p,
            None => {
                alloc.release(flow);
                return Err(ConnError::NotSupp);
            }
        }
    } else {
        dest.port()
    };

    flow.af = params.af;
    flow.proto = params.proto;
    flow.in_node = TupleNode {
        af: params.af,
        proto: params.proto,
        direction: Direction::In,
        saddr: params.caddr,
        sport: params.cport,
        daddr: params.vaddr,
        dport: params.vport,
    };

    let out_saddr = if dest.fwdmode() == ForwardMode::SourceNat {
        params.snat_saddr.unwrap_or_else(|| dest.addr())
    } else {
        dest.addr()
    };
    flow.out_node = TupleNode {
        af: params.af,
        proto: params.proto,
        direction: Direction::Out,
        saddr: out_saddr,
        sport: rport,
        daddr: params.caddr,
        dport: params.cport,
    };

    flow.caddr = params.caddr;
    flow.cport = params.cport;
    flow.vaddr = params.vaddr;
    flow.vport = params.vport;
    flow.laddr = params.caddr;
    flow.lport = params.cport;
    flow.daddr = if dest.fwdmode() == ForwardMode::SourceNat {
        out_saddr
    } else {
        dest.addr()
    };
    flow.dport = rport;
    flow.refcnt_set(1);
    flow.set_flags_raw(flags);

    let is_fullnat = dest.fwdmode() == ForwardMode::FullNat;
    let idx = table.insert(flow);

    if let Err(e) = bind_destination(table.get_mut(idx).unwrap(), dest) {
        let flow = table.remove(idx).unwrap();
        alloc.release(flow);
        return Err(e);
    }

    if is_fullnat {
        if let Some(pool) = laddr_pool {
            if let Err(e) = bind_laddr(table.get_mut(idx).unwrap(), pool) {
                unbind_destination(table.get_mut(idx).unwrap());
                let flow = table.remove(idx).unwrap();
                alloc.release(flow);
                return Err(e);
            }
            let flow_mut = table.get_mut(idx).unwrap();
            flow_mut.out_node.saddr = flow_mut.daddr;
            flow_mut.out_node.sport = flow_mut.dport;
            flow_mut.out_node.daddr = flow_mut.laddr;
            flow_mut.out_node.dport = flow_mut.lport;
        }
    }

    if let Err(e) = table.hash(idx) {
        if is_fullnat {
            if let Some(pool) = laddr_pool {
                unbind_laddr(table.get(idx).unwrap(), pool);
            }
        }
        unbind_destination(table.get_mut(idx).unwrap());
        let flow = table.remove(idx).unwrap();
        alloc.release(flow);
        return Err(e);
    }

    let flow_mut = table.get_mut(idx).unwrap();
    flow_mut.timeout = hot.conn_init_timeout();

    if flags & F_SYNPROXY != 0 && !is_template {
        if let Some(syn) = syn_capture {
            flow_mut.syn = SynProxyState {
                saved_syn: Some(syn.bytes.clone()),
                deferred_acks: vec![syn.bytes],
                syn_retry_max: 0,
                dup_ack_cnt: 0,
                isn: syn.ack_seq.wrapping_sub(1),
                fdata_seq: syn.ack_seq,
            };
            flow_mut
                .state
                .store(syn.syn_sent_state, std::sync::atomic::Ordering::Release);
            flow_mut.timeout = syn.syn_sent_timeout;
        }
    }

    let jitter = Duration::from_micros(rand::thread_rng().gen_range(0..JITTER_MAX_MICROS));
    let deadline = flow_mut.timeout + jitter;
    timer.schedule(idx as u64, deadline, is_template);

    stats::FLOWS_CREATED.inc();
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::alloc::SocketPool;
    use crate::conntrack::tuple::AddressFamily;
    use crate::lcore::SocketId;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    struct FakeDest {
        mode: ForwardMode,
        max_conn: u32,
        refcnt: AtomicI64,
        actconns: AtomicI64,
        inactconns: AtomicI64,
        persistconns: AtomicI64,
        overloaded: AtomicBool,
    }

    impl FakeDest {
        fn new(mode: ForwardMode, max_conn: u32) -> Arc<Self> {
            Arc::new(FakeDest {
                mode,
                max_conn,
                refcnt: AtomicI64::new(0),
                actconns: AtomicI64::new(0),
                inactconns: AtomicI64::new(0),
                persistconns: AtomicI64::new(0),
                overloaded: AtomicBool::new(false),
            })
        }
    }

    impl Destination for FakeDest {
        fn addr(&self) -> IpAddr {
            IpAddr::from([2, 2, 2, 2])
        }
        fn port(&self) -> u16 {
            8080
        }
        fn fwdmode(&self) -> ForwardMode {
            self.mode
        }
        fn conn_flags(&self) -> u32 {
            0
        }
        fn weight(&self) -> u32 {
            1
        }
        fn max_conn(&self) -> u32 {
            self.max_conn
        }
        fn available(&self) -> bool {
            true
        }
        fn refcnt_add(&self, delta: i32) -> u32 {
            (self.refcnt.fetch_add(delta as i64, Ordering::AcqRel) + delta as i64) as u32
        }
        fn actconns_add(&self, delta: i32) -> u32 {
            (self.actconns.fetch_add(delta as i64, Ordering::AcqRel) + delta as i64) as u32
        }
        fn inactconns_add(&self, delta: i32) -> u32 {
            (self.inactconns.fetch_add(delta as i64, Ordering::AcqRel) + delta as i64) as u32
        }
        fn persistconns_add(&self, delta: i32) -> u32 {
            (self.persistconns.fetch_add(delta as i64, Ordering::AcqRel) + delta as i64) as u32
        }
        fn actconns(&self) -> u32 {
            self.actconns.load(Ordering::Acquire) as u32
        }
        fn inactconns(&self) -> u32 {
            self.inactconns.load(Ordering::Acquire) as u32
        }
        fn set_overload(&self, on: bool) {
            self.overloaded.store(on, Ordering::Release);
        }
        fn is_overloaded(&self) -> bool {
            self.overloaded.load(Ordering::Acquire)
        }
    }

    struct FakeLaddrPool {
        addr: IpAddr,
        port: u16,
    }

    impl LocalAddrPool for FakeLaddrPool {
        fn bind(&self, _flow: &Flow) -> Result<(IpAddr, u16), ConnError> {
            Ok((self.addr, self.port))
        }
        fn unbind(&self, _flow: &Flow) {}
    }

    struct FakeTimer;
    impl TimerService for FakeTimer {
        fn schedule(&self, _flow_id: u64, _deadline: Duration, _template: bool) {}
        fn update(&self, _flow_id: u64, _deadline: Duration, _template: bool) {}
        fn cancel(&self, _flow_id: u64, _template: bool) {}
    }

    fn params() -> ConnParams {
        ConnParams {
            af: AddressFamily::V4,
            proto: 6,
            caddr: IpAddr::from([10, 0, 0, 1]),
            cport: 40000,
            vaddr: IpAddr::from([1, 1, 1, 1]),
            vport: 80,
            ct_dport: 0,
            l4_src_port: None,
            snat_saddr: None,
        }
    }

    #[test]
    fn fullnat_happy_path_wires_both_tuples() {
        let pool = SocketPool::new(64);
        let mut alloc = FlowAllocator::new(SocketId(0), pool, 4);
        let mut table = CoreTable::new(4);
        let dest = FakeDest::new(ForwardMode::FullNat, 0);
        let laddr = FakeLaddrPool {
            addr: IpAddr::from([172, 16, 0, 1]),
            port: 50000,
        };
        let hot = HotConfig::new(&crate::config::default_config());
        let timer = FakeTimer;

        let idx = conn_new(
            &mut alloc,
            &mut table,
            &params(),
            dest.clone(),
            0,
            Some(&laddr),
            &hot,
            &timer,
            None,
        )
        .unwrap();

        let flow = table.get(idx).unwrap();
        assert_eq!(flow.out_node.saddr, IpAddr::from([2, 2, 2, 2]));
        assert_eq!(flow.out_node.sport, 8080);
        assert_eq!(flow.out_node.daddr, IpAddr::from([172, 16, 0, 1]));
        assert_eq!(flow.out_node.dport, 50000);
        assert_eq!(dest.inactconns(), 1);
        assert_eq!(dest.refcnt.load(Ordering::Acquire), 1);
        assert!(flow.is_hashed());

        let hit = table.lookup(AddressFamily::V4, 6, params().caddr, params().cport, params().vaddr, params().vport, false);
        assert_eq!(hit.map(|(i, _)| i), Some(idx));
    }

    #[test]
    fn overload_releases_flow_back_to_allocator() {
        let pool = SocketPool::new(1);
        let mut alloc = FlowAllocator::new(SocketId(0), pool, 1);
        let mut table = CoreTable::new(4);
        let dest = FakeDest::new(ForwardMode::FullNat, 1);
        dest.inactconns_add(1);
        let hot = HotConfig::new(&crate::config::default_config());
        let timer = FakeTimer;

        let err = conn_new(
            &mut alloc, &mut table, &params(), dest, 0, None, &hot, &timer, None,
        )
        .unwrap_err();
        assert_eq!(err, ConnError::Overload);
        assert!(alloc.acquire().is_ok());
    }

    #[test]
    fn source_nat_preserves_packet_source_port() {
        let pool = SocketPool::new(64);
        let mut alloc = FlowAllocator::new(SocketId(0), pool, 4);
        let mut table = CoreTable::new(4);
        let dest = FakeDest::new(ForwardMode::SourceNat, 0);
        let hot = HotConfig::new(&crate::config::default_config());
        let timer = FakeTimer;

        let mut p = params();
        p.l4_src_port = Some(54321);
        p.snat_saddr = Some(IpAddr::from([9, 9, 9, 9]));

        let idx = conn_new(
            &mut alloc, &mut table, &p, dest, 0, None, &hot, &timer, None,
        )
        .unwrap();
        let flow = table.get(idx).unwrap();
        assert_eq!(flow.out_node.sport, 54321);
        assert_eq!(flow.out_node.saddr, IpAddr::from([9, 9, 9, 9]));
    }
}
