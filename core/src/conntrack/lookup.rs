//! Lookup API (`spec.md` 4.9).

use crate::collab::TimerService;
use crate::conntrack::flow::Flow;
use crate::conntrack::table::{CoreTable, TemplateTable};
use crate::conntrack::tuple::{AddressFamily, Direction};
use crate::stats::{self, StatExt};

const SENTINEL_PORT: u16 = 0xffff;

/// `get` on the per-core table.
#[allow(clippy::too_many_arguments)]
pub fn get(
    table: &CoreTable,
    af: AddressFamily,
    proto: u8,
    s: std::net::IpAddr,
    sp: u16,
    d: std::net::IpAddr,
    dp: u16,
    reverse: bool,
) -> Option<(u32, Direction)> {
    table.lookup(af, proto, s, sp, d, dp, reverse)
}

/// `template_in_get` on the shared table.
#[allow(clippy::too_many_arguments)]
pub fn template_in_get(
    templates: &TemplateTable,
    af: AddressFamily,
    proto: u8,
    s: std::net::IpAddr,
    sp: u16,
    d: std::net::IpAddr,
    dp: u16,
) -> Option<u32> {
    templates.template_in_get(af, proto, s, sp, d, dp)
}

/// `spec.md` 4.9 `check_template`. The documented source bug — rewriting
/// the sentinel and rehashing even when `unhash` failed with `BUSY` — is
/// avoided here: the rewrite only happens when `unhash` actually succeeds
/// (`spec.md` 9).
pub fn check_template(
    templates: &mut TemplateTable,
    idx: u32,
    expire_quiescent_template: bool,
) -> bool {
    let (available, vport) = {
        let flow = templates.get(idx).expect("template slot occupied");
        let available = match &flow.dest {
            None => false,
            Some(dest) => {
                dest.available() && !(expire_quiescent_template && dest.weight() == 0)
            }
        };
        (available, flow.vport)
    };

    if available {
        return true;
    }

    if vport != SENTINEL_PORT && templates.unhash(idx).is_ok() {
        let flow = templates.get_mut(idx).expect("template slot occupied");
        rewrite_to_sentinel(flow);
        templates.hash(idx).expect("rehash of just-unhashed template");
        stats::TEMPLATE_INVALIDATIONS.inc();
    }

    templates
        .get(idx)
        .expect("template slot occupied")
        .refcnt_dec();
    false
}

fn rewrite_to_sentinel(flow: &mut Flow) {
    flow.dport = SENTINEL_PORT;
    flow.vport = SENTINEL_PORT;
    flow.lport = 0;
    flow.cport = 0;
    flow.in_node.dport = SENTINEL_PORT;
    flow.out_node.sport = SENTINEL_PORT;
    flow.in_node.sport = 0;
    flow.out_node.dport = 0;
}

/// `put_no_reset`: releases a reference without touching the timer.
pub fn put_no_reset(table: &CoreTable, idx: u32) {
    table.get(idx).expect("slot occupied").refcnt_dec();
}

/// `put`: releases a reference and pushes the deadline forward.
pub fn put(
    table: &CoreTable,
    idx: u32,
    timer: &dyn TimerService,
    deadline: std::time::Duration,
    is_template: bool,
) {
    timer.update(idx as u64, deadline, is_template);
    table.get(idx).expect("slot occupied").refcnt_dec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::flow::{Flow, F_TEMPLATE};
    use crate::conntrack::tuple::TupleNode;
    use crate::collab::{Destination, ForwardMode};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Arc;

    struct FakeDest {
        available: AtomicBool,
        weight: AtomicI64,
    }

    impl Destination for FakeDest {
        fn addr(&self) -> IpAddr {
            IpAddr::from([2, 2, 2, 2])
        }
        fn port(&self) -> u16 {
            80
        }
        fn fwdmode(&self) -> ForwardMode {
            ForwardMode::FullNat
        }
        fn conn_flags(&self) -> u32 {
            0
        }
        fn weight(&self) -> u32 {
            self.weight.load(Ordering::Acquire) as u32
        }
        fn max_conn(&self) -> u32 {
            0
        }
        fn available(&self) -> bool {
            self.available.load(Ordering::Acquire)
        }
        fn refcnt_add(&self, _delta: i32) -> u32 {
            0
        }
        fn actconns_add(&self, _delta: i32) -> u32 {
            0
        }
        fn inactconns_add(&self, _delta: i32) -> u32 {
            0
        }
        fn persistconns_add(&self, _delta: i32) -> u32 {
            0
        }
        fn actconns(&self) -> u32 {
            0
        }
        fn inactconns(&self) -> u32 {
            0
        }
        fn set_overload(&self, _on: bool) {}
        fn is_overloaded(&self) -> bool {
            false
        }
    }

    fn make_template(dest_available: bool, weight: u32) -> (TemplateTable, u32) {
        let mut table = TemplateTable::new(4);
        let mut flow = Box::new(Flow::zeroed());
        flow.proto = 0;
        flow.vport = 80;
        flow.cport = 1000;
        flow.in_node = TupleNode {
            af: AddressFamily::V4,
            proto: 0,
            direction: Direction::In,
            saddr: IpAddr::from([10, 0, 0, 1]),
            sport: 1000,
            daddr: IpAddr::from([1, 1, 1, 1]),
            dport: 80,
        };
        flow.out_node = TupleNode {
            af: AddressFamily::V4,
            proto: 0,
            direction: Direction::Out,
            saddr: IpAddr::from([2, 2, 2, 2]),
            sport: 80,
            daddr: IpAddr::from([10, 0, 0, 1]),
            dport: 1000,
        };
        flow.set_flags_raw(F_TEMPLATE);
        flow.refcnt_set(1);
        flow.dest = Some(Arc::new(FakeDest {
            available: AtomicBool::new(dest_available),
            weight: AtomicI64::new(weight as i64),
        }));
        let idx = table.insert(flow);
        table.hash(idx).unwrap();
        (table, idx)
    }

    #[test]
    fn available_destination_passes_check() {
        let (mut table, idx) = make_template(true, 1);
        assert!(check_template(&mut table, idx, false));
    }

    #[test]
    fn quiescent_weight_invalidates_and_hides_from_lookup() {
        let (mut table, idx) = make_template(true, 0);
        let before = table.get(idx).unwrap().refcnt();
        let ok = check_template(&mut table, idx, true);
        assert!(!ok);
        assert_eq!(table.get(idx).unwrap().refcnt(), before - 1);

        let miss = template_in_get(
            &table,
            AddressFamily::V4,
            0,
            IpAddr::from([10, 0, 0, 1]),
            1000,
            IpAddr::from([1, 1, 1, 1]),
            80,
        );
        assert!(miss.is_none());
    }

    #[test]
    fn sentinel_rewrite_is_idempotent_on_second_check() {
        let (mut table, idx) = make_template(false, 1);
        assert!(!check_template(&mut table, idx, false));
        assert_eq!(table.get(idx).unwrap().vport, SENTINEL_PORT);
        // Second call: vport already sentinel, no further unhash attempted.
        assert!(!check_template(&mut table, idx, false));
    }
}
