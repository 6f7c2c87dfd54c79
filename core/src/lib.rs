#![allow(clippy::needless_doctest_main)]

//! A connection-tracking core for a layer-4 virtual server.
//!
//! This crate tracks the flows a load balancer forwards: it allocates and
//! hashes per-core flow records keyed by a bidirectional 5-tuple, binds each
//! one to a scheduled destination under Direct-Routing, Full-NAT or
//! Source-NAT, expires them on a per-flow timer, and exposes the lookup and
//! template-persistence paths a dispatch path needs. It does not parse
//! packets, run a protocol state machine, or schedule destinations itself —
//! those are external collaborators, expressed as the traits in
//! [`collab`].
//!
//! ```
//! use conntrack_core::collab::{Destination, ForwardMode};
//! use conntrack_core::conntrack::{AddressFamily, ConnParams, CoreTable, FlowAllocator, SocketPool};
//! use conntrack_core::config::{default_config, HotConfig};
//! use conntrack_core::lcore::SocketId;
//! use std::net::IpAddr;
//! use std::sync::Arc;
//!
//! # struct ExampleDest;
//! # impl Destination for ExampleDest {
//! #     fn addr(&self) -> IpAddr { IpAddr::from([2, 2, 2, 2]) }
//! #     fn port(&self) -> u16 { 80 }
//! #     fn fwdmode(&self) -> ForwardMode { ForwardMode::DirectRouting }
//! #     fn conn_flags(&self) -> u32 { 0 }
//! #     fn weight(&self) -> u32 { 1 }
//! #     fn max_conn(&self) -> u32 { 0 }
//! #     fn available(&self) -> bool { true }
//! #     fn refcnt_add(&self, _delta: i32) -> u32 { 0 }
//! #     fn actconns_add(&self, _delta: i32) -> u32 { 0 }
//! #     fn inactconns_add(&self, _delta: i32) -> u32 { 0 }
//! #     fn persistconns_add(&self, _delta: i32) -> u32 { 0 }
//! #     fn actconns(&self) -> u32 { 0 }
//! #     fn inactconns(&self) -> u32 { 0 }
//! #     fn set_overload(&self, _on: bool) {}
//! #     fn is_overloaded(&self) -> bool { false }
//! # }
//! # struct NullTimer;
//! # impl conntrack_core::collab::TimerService for NullTimer {
//! #     fn schedule(&self, _id: u64, _deadline: std::time::Duration, _template: bool) {}
//! #     fn update(&self, _id: u64, _deadline: std::time::Duration, _template: bool) {}
//! #     fn cancel(&self, _id: u64, _template: bool) {}
//! # }
//!
//! let pool = SocketPool::new(1024);
//! let mut alloc = FlowAllocator::new(SocketId(0), pool, 64);
//! let mut table = CoreTable::new(16);
//! let hot = HotConfig::new(&default_config());
//!
//! let params = ConnParams {
//!     af: AddressFamily::V4,
//!     proto: 6,
//!     caddr: IpAddr::from([10, 0, 0, 1]),
//!     cport: 40000,
//!     vaddr: IpAddr::from([1, 1, 1, 1]),
//!     vport: 80,
//!     ct_dport: 0,
//!     l4_src_port: None,
//!     snat_saddr: None,
//! };
//!
//! let idx = conntrack_core::conntrack::conn_new(
//!     &mut alloc, &mut table, &params, Arc::new(ExampleDest), 0, None, &hot, &NullTimer, None,
//! ).unwrap();
//! assert!(table.get(idx).unwrap().is_hashed());
//! ```

pub mod collab;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod hash;
pub mod lcore;
pub(crate) mod stats;

pub use self::conntrack::{CoreTable, Flow, FlowAllocator, TemplateTable};
pub use self::error::ConnError;
pub use self::lcore::CoreId;
