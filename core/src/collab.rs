//! External collaborator seams.
//!
//! The core depends on a packet-parsing/protocol layer, a destination pool
//! and scheduler, address pools, a timer service and a packet-buffer pool —
//! none of which it implements (`spec.md` 1, 6). Each is expressed as a
//! trait here, the same way retina-core's conntrack module is injected with
//! `Trackable`/`ParserRegistry`/`Subscription` rather than depending on
//! concrete framework types.

use std::net::IpAddr;
use std::time::Duration;

use crate::conntrack::flow::Flow;
use crate::error::ConnError;

/// The protocol layer that owns `conn.state` and its timeout table.
pub trait ProtocolOps {
    /// Per-state timeout, consulted when no override applies.
    fn timeout_for(&self, state: u8) -> Duration;

    /// An override timeout for states the protocol wants to drive itself
    /// (TCP ESTABLISHED, UDP NORMAL). `None` falls back to `timeout_for`.
    fn get_conn_timeout(&self, flow: &Flow) -> Option<Duration>;

    /// Called once, on the pass that finally reaps a flow.
    fn conn_expire(&self, flow: &Flow);
}

/// A real server a flow may be bound to.
pub trait Destination {
    fn addr(&self) -> IpAddr;
    fn port(&self) -> u16;
    fn fwdmode(&self) -> ForwardMode;
    fn conn_flags(&self) -> u32;
    fn weight(&self) -> u32;
    fn max_conn(&self) -> u32;
    fn available(&self) -> bool;

    fn refcnt_add(&self, delta: i32) -> u32;
    fn actconns_add(&self, delta: i32) -> u32;
    fn inactconns_add(&self, delta: i32) -> u32;
    fn persistconns_add(&self, delta: i32) -> u32;
    fn actconns(&self) -> u32;
    fn inactconns(&self) -> u32;

    fn set_overload(&self, on: bool);
    fn is_overloaded(&self) -> bool;
}

/// Packet-rewrite strategy a destination dispatches to (`spec.md` 4.5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForwardMode {
    DirectRouting,
    FullNat,
    SourceNat,
    /// Anything else is a configuration error the binder rejects (`NOTSUPP`).
    Unsupported,
}

/// Full-NAT local-address pool.
pub trait LocalAddrPool {
    fn bind(&self, flow: &Flow) -> Result<(IpAddr, u16), ConnError>;
    fn unbind(&self, flow: &Flow);
}

/// Source-NAT source-address pool.
pub trait SourceAddrPool {
    fn release(&self, iface: &str, daddr: IpAddr, saddr: IpAddr);
}

/// Schedules flow deadlines. `template` selects the shared wheel over the
/// owning core's wheel, matching the bucket-policy distinction `put`/
/// `put_no_reset` make in `spec.md` 4.9.
pub trait TimerService {
    fn schedule(&self, flow_id: u64, deadline: Duration, template: bool);
    fn update(&self, flow_id: u64, deadline: Duration, template: bool);
    fn cancel(&self, flow_id: u64, template: bool);
}

/// The `mbuf` seam: a packet buffer the core clones, frees, and reads
/// headers out of without owning the pool it came from.
pub trait PacketBuffer: Sized {
    fn clone_buf(&self) -> Self;
    fn free(self);
    fn header(&self, offset: usize, len: usize) -> Option<&[u8]>;
}

/// The inbound transmitter a flow was bound with. SYN-proxy retransmit
/// resends a saved SYN through this rather than re-deriving a `PacketBuffer`
/// from the generic byte capture stored on the flow.
pub trait InboundTransmit {
    fn retransmit_syn(&self, saved: &[u8]);
}
