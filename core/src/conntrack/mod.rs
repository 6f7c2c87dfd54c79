//! Connection tracking.
//!
//! Wires together the tuple hash ([`tuple`]), the flow record ([`flow`]),
//! the per-core and shared tables ([`table`]), the flow allocator
//! ([`alloc`]), the binder ([`bind`]), construction ([`new`]), lookup
//! ([`lookup`]), the expiration engine ([`expire`]) and a default
//! [`TimerService`](crate::collab::TimerService) implementation
//! ([`timer`]). None of these modules know about packets or a runtime
//! directly; they are driven by a host that owns both (see
//! [`crate::collab`]).

pub mod alloc;
pub mod bind;
pub mod expire;
pub mod flow;
pub mod lookup;
pub mod new;
pub mod table;
pub mod timer;
pub mod tuple;

pub use alloc::{FlowAllocator, SocketPool};
pub use bind::{bind_destination, bind_laddr, unbind_destination, unbind_laddr};
pub use expire::{expire, flush, ExpireOutcome};
pub use flow::{ConnParams, Flow, SynProxyState};
pub use lookup::{check_template, get, put, put_no_reset, template_in_get};
pub use new::{conn_new, SynCapture};
pub use table::{CoreTable, TemplateTable};
pub use timer::WheelTimer;
pub use tuple::{AddressFamily, Direction, TupleNode};
