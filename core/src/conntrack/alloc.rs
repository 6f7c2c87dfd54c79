//! Flow allocator (`spec.md` 4.4).
//!
//! One `crossbeam::queue::ArrayQueue<Box<Flow>>` per NUMA socket (capacity
//! from config, power-of-two, 65,536 floor) plus a per-core cache that
//! refills/drains in batches against its socket's queue — the same
//! `crossbeam` dependency retina-core already pulls in for its timer-tick
//! channel, reused here for its lock-free MPMC queue instead.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::conntrack::flow::Flow;
use crate::error::ConnError;
use crate::lcore::SocketId;
use crate::stats::{self, StatExt};

/// Per-socket pool. Shared (via `Arc`) across every core pinned to that
/// socket.
pub struct SocketPool {
    queue: ArrayQueue<Box<Flow>>,
}

impl SocketPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let queue = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = queue.push(Box::new(Flow::zeroed()));
        }
        Arc::new(SocketPool { queue })
    }
}

/// A core's view of the allocator: a small local cache backed by its
/// socket's shared pool.
pub struct FlowAllocator {
    socket: SocketId,
    pool: Arc<SocketPool>,
    cache: Vec<Box<Flow>>,
    cache_size: usize,
}

impl FlowAllocator {
    pub fn new(socket: SocketId, pool: Arc<SocketPool>, cache_size: usize) -> Self {
        FlowAllocator {
            socket,
            pool,
            cache: Vec::with_capacity(cache_size),
            cache_size,
        }
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// `spec.md` 4.4 `acquire`: returns a cleared flow record, or `NOMEM`
    /// if both the local cache and the socket pool are exhausted.
    pub fn acquire(&mut self) -> Result<Box<Flow>, ConnError> {
        if let Some(flow) = self.cache.pop() {
            return Ok(flow);
        }
        // Cache-miss: refill a batch from the socket pool, lock-free.
        for _ in 0..self.cache_size {
            match self.pool.queue.pop() {
                Some(f) => self.cache.push(f),
                None => break,
            }
        }
        match self.cache.pop() {
            Some(flow) => Ok(flow),
            None => {
                stats::ALLOC_NOMEM.inc();
                Err(ConnError::NoMem)
            }
        }
    }

    /// `spec.md` 4.4 `release`: clears the flow and returns it to the
    /// cache, draining overflow back to the socket pool.
    pub fn release(&mut self, mut flow: Box<Flow>) {
        *flow = Flow::zeroed();
        if self.cache.len() < self.cache_size {
            self.cache.push(flow);
        } else if self.pool.queue.push(flow).is_err() {
            log::error!("conntrack: socket {} pool full, dropping flow", self.socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_round_trips() {
        let pool = SocketPool::new(64);
        let mut alloc = FlowAllocator::new(SocketId(0), pool, 4);
        let flow = alloc.acquire().unwrap();
        alloc.release(flow);
        assert!(alloc.acquire().is_ok());
    }

    #[test]
    fn exhausted_pool_returns_nomem() {
        let pool = SocketPool::new(1);
        let mut alloc = FlowAllocator::new(SocketId(0), pool, 1);
        let first = alloc.acquire();
        assert!(first.is_ok());
        assert_eq!(alloc.acquire().unwrap_err(), ConnError::NoMem);
    }
}
