//! Core and NUMA-socket identifiers, and thread pinning.
//!
//! The packet-processing runtime this core plugs into pins one worker thread
//! per CPU core and groups cores into NUMA sockets; [`CoreId`] and
//! [`SocketId`] are the two identifiers everything else (the flow
//! allocator's per-socket pools, the per-core flow tables) is keyed by.
//! Real NUMA topology discovery belongs to the runtime's collaborator (DPDK's
//! `rte_lcore_to_socket_id` upstream); here it is approximated by a
//! configurable cores-per-socket stride so the allocator and table types can
//! be exercised without a DPDK dependency.

pub mod pin;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of cores assumed to share a NUMA socket when no topology service
/// is available. Overridable via [`CoreId::socket_id_with_stride`].
const DEFAULT_CORES_PER_SOCKET: u32 = 32;

#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd)]
pub struct SocketId(pub u32);

impl SocketId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* --------------------------------------------------------------------------------- */

#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct CoreId(pub u32);

impl CoreId {
    /// NUMA socket this core belongs to, under the default stride.
    pub fn socket_id(&self) -> SocketId {
        self.socket_id_with_stride(DEFAULT_CORES_PER_SOCKET)
    }

    /// NUMA socket this core belongs to, under a caller-supplied
    /// cores-per-socket stride (for runtimes that know their own topology).
    pub fn socket_id_with_stride(&self, cores_per_socket: u32) -> SocketId {
        SocketId(self.0 / cores_per_socket.max(1))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
