//! Binder: attaches a flow to a destination and, for full-NAT, a local
//! address (`spec.md` 4.5).

use std::sync::Arc;

use crate::collab::{Destination, ForwardMode, LocalAddrPool};
use crate::conntrack::flow::{Flow, F_INACTIVE};
use crate::error::ConnError;
use crate::stats::{self, StatExt};

/// `spec.md` 4.5 `bind_destination`.
pub fn bind_destination(
    flow: &mut Flow,
    dest: Arc<dyn Destination + Send + Sync>,
) -> Result<(), ConnError> {
    flow.set_flags_raw(flow.flags() | dest.conn_flags());

    let max_conn = dest.max_conn();
    if max_conn != 0 && dest.inactconns() + dest.actconns() >= max_conn {
        dest.set_overload(true);
        stats::BIND_OVERLOAD.inc();
        return Err(ConnError::Overload);
    }

    let mode = dest.fwdmode();
    let (xmit_in, xmit_out) = match mode {
        ForwardMode::DirectRouting => (true, false),
        ForwardMode::FullNat => (true, true),
        ForwardMode::SourceNat => (true, true),
        ForwardMode::Unsupported => return Err(ConnError::NotSupp),
    };

    dest.refcnt_add(1);
    if flow.is_template() {
        dest.persistconns_add(1);
    } else {
        flow.set_flag(F_INACTIVE);
        dest.inactconns_add(1);
    }

    flow.fwdmode = Some(mode);
    flow.xmit_in = xmit_in;
    flow.xmit_out = xmit_out;
    flow.dest = Some(dest);
    Ok(())
}

/// `spec.md` 4.5 `unbind_destination`.
pub fn unbind_destination(flow: &mut Flow) {
    let Some(dest) = flow.dest.take() else {
        return;
    };

    if flow.is_template() {
        dest.persistconns_add(-1);
    } else if flow.flags() & F_INACTIVE != 0 {
        dest.inactconns_add(-1);
    } else {
        dest.actconns_add(-1);
    }

    let max_conn = dest.max_conn();
    if max_conn != 0 && dest.inactconns() + dest.actconns() < max_conn {
        dest.set_overload(false);
    }
    dest.refcnt_add(-1);
}

/// `spec.md` 4.5 full-NAT local-address bind, delegated to the external pool.
pub fn bind_laddr(flow: &mut Flow, pool: &dyn LocalAddrPool) -> Result<(), ConnError> {
    let (laddr, lport) = pool.bind(flow)?;
    flow.laddr = laddr;
    flow.lport = lport;
    Ok(())
}

pub fn unbind_laddr(flow: &Flow, pool: &dyn LocalAddrPool) {
    pool.unbind(flow);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::flow::Flow;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeDest {
        mode: ForwardMode,
        max_conn: u32,
        refcnt: AtomicI64,
        actconns: AtomicI64,
        inactconns: AtomicI64,
        persistconns: AtomicI64,
        overloaded: std::sync::atomic::AtomicBool,
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
                overloaded: std::sync::atomic::AtomicBool::new(false),
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

    #[test]
    fn bind_increments_dest_counters() {
        let mut flow = Flow::zeroed();
        let dest = FakeDest::new(ForwardMode::FullNat, 0);
        bind_destination(&mut flow, dest.clone()).unwrap();
        assert_eq!(dest.refcnt.load(Ordering::Acquire), 1);
        assert_eq!(dest.inactconns(), 1);
        assert!(flow.xmit_in && flow.xmit_out);
    }

    #[test]
    fn direct_routing_has_no_outbound_xmit() {
        let mut flow = Flow::zeroed();
        let dest = FakeDest::new(ForwardMode::DirectRouting, 0);
        bind_destination(&mut flow, dest).unwrap();
        assert!(flow.xmit_in);
        assert!(!flow.xmit_out);
    }

    #[test]
    fn overload_leaves_counters_untouched() {
        let mut flow = Flow::zeroed();
        let dest = FakeDest::new(ForwardMode::FullNat, 1);
        dest.inactconns_add(1);
        let before_refcnt = dest.refcnt.load(Ordering::Acquire);
        let err = bind_destination(&mut flow, dest.clone()).unwrap_err();
        assert_eq!(err, ConnError::Overload);
        assert_eq!(dest.refcnt.load(Ordering::Acquire), before_refcnt);
        assert_eq!(dest.inactconns(), 1);
        assert!(dest.is_overloaded());
    }

    #[test]
    fn unbind_reverses_accounting() {
        let mut flow = Flow::zeroed();
        let dest = FakeDest::new(ForwardMode::FullNat, 0);
        bind_destination(&mut flow, dest.clone()).unwrap();
        unbind_destination(&mut flow);
        assert_eq!(dest.refcnt.load(Ordering::Acquire), 0);
        assert_eq!(dest.inactconns(), 0);
        assert!(flow.dest.is_none());
    }
}
