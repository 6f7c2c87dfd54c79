//! The flow record (`spec.md` 3).

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::collab::{Destination, ForwardMode};
use crate::conntrack::tuple::{AddressFamily, Direction, TupleNode};

pub const F_HASHED: u32 = 1 << 0;
pub const F_TEMPLATE: u32 = 1 << 1;
pub const F_INACTIVE: u32 = 1 << 2;
pub const F_SYNPROXY: u32 = 1 << 3;

/// Parameters for [`super::new::conn_new`] (`spec.md` 4.6 inputs).
#[derive(Debug, Clone)]
pub struct ConnParams {
    pub af: AddressFamily,
    pub proto: u8,
    pub caddr: IpAddr,
    pub cport: u16,
    pub vaddr: IpAddr,
    pub vport: u16,
    /// Explicit real-server port for templates; `0` means "derive it".
    pub ct_dport: u16,
    /// Source-NAT only: the inbound packet's L4 source port, pre-parsed by
    /// the protocol layer (packet parsing is out of scope for this core).
    pub l4_src_port: Option<u16>,
    /// Source-NAT only: the inbound packet's IP source address.
    pub snat_saddr: Option<IpAddr>,
}

/// Saved TCP SYN-proxy state. Buffers are captured as raw bytes rather than
/// kept as live `PacketBuffer`s, so `Flow` stays free of a buffer-pool type
/// parameter that every table/allocator would otherwise have to carry too.
#[derive(Debug, Default, Clone)]
pub struct SynProxyState {
    pub saved_syn: Option<Vec<u8>>,
    pub deferred_acks: Vec<Vec<u8>>,
    pub syn_retry_max: u32,
    pub dup_ack_cnt: u32,
    pub isn: u32,
    pub fdata_seq: u32,
}

pub struct Flow {
    pub af: AddressFamily,
    pub proto: u8,

    // Canonical 4-tuple view (spec.md 3).
    pub caddr: IpAddr,
    pub cport: u16,
    pub vaddr: IpAddr,
    pub vport: u16,
    pub laddr: IpAddr,
    pub lport: u16,
    pub daddr: IpAddr,
    pub dport: u16,

    pub in_node: TupleNode,
    pub out_node: TupleNode,

    flags: AtomicU32,
    pub state: AtomicU8,
    refcnt: AtomicU32,

    pub dest: Option<Arc<dyn Destination + Send + Sync>>,
    pub fwdmode: Option<ForwardMode>,
    pub xmit_in: bool,
    pub xmit_out: bool,

    /// Slab index of the control flow this one is parented to, if any.
    pub parent: Option<u32>,
    pub n_control: AtomicU32,

    pub timeout: Duration,
    pub syn: SynProxyState,

    pub iif: Option<String>,
    pub oif: Option<String>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("af", &self.af)
            .field("proto", &self.proto)
            .field("caddr", &self.caddr)
            .field("cport", &self.cport)
            .field("vaddr", &self.vaddr)
            .field("vport", &self.vport)
            .field("daddr", &self.daddr)
            .field("dport", &self.dport)
            .field("flags", &self.flags())
            .field("refcnt", &self.refcnt())
            .field("has_dest", &self.dest.is_some())
            .field("fwdmode", &self.fwdmode)
            .finish()
    }
}

impl Flow {
    /// A zeroed/empty flow, as the allocator hands back before `new` fills
    /// it in (`spec.md` 4.4/4.6 step 1).
    pub fn zeroed() -> Self {
        let nowhere = IpAddr::from([0, 0, 0, 0]);
        let blank_node = TupleNode {
            af: AddressFamily::V4,
            proto: 0,
            direction: Direction::In,
            saddr: nowhere,
            sport: 0,
            daddr: nowhere,
            dport: 0,
        };
        Flow {
            af: AddressFamily::V4,
            proto: 0,
            caddr: nowhere,
            cport: 0,
            vaddr: nowhere,
            vport: 0,
            laddr: nowhere,
            lport: 0,
            daddr: nowhere,
            dport: 0,
            in_node: blank_node,
            out_node: blank_node,
            flags: AtomicU32::new(0),
            state: AtomicU8::new(0),
            refcnt: AtomicU32::new(0),
            dest: None,
            fwdmode: None,
            xmit_in: false,
            xmit_out: false,
            parent: None,
            n_control: AtomicU32::new(0),
            timeout: Duration::from_secs(0),
            syn: SynProxyState::default(),
            iif: None,
            oif: None,
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn is_hashed(&self) -> bool {
        self.flags() & F_HASHED != 0
    }

    pub fn is_template(&self) -> bool {
        self.flags() & F_TEMPLATE != 0
    }

    pub(crate) fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    pub(crate) fn set_flags_raw(&self, val: u32) {
        self.flags.store(val, Ordering::Release);
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn refcnt_set(&self, val: u32) {
        self.refcnt.store(val, Ordering::Release);
    }

    pub(crate) fn refcnt_inc(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn refcnt_dec(&self) -> u32 {
        self.refcnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn n_control(&self) -> u32 {
        self.n_control.load(Ordering::Acquire)
    }

    pub(crate) fn n_control_inc(&self) -> u32 {
        self.n_control.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn n_control_dec(&self) -> u32 {
        self.n_control.fetch_sub(1, Ordering::AcqRel) - 1
    }
}
