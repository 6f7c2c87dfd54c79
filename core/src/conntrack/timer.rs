//! A bucketed timing wheel, the default [`TimerService`] (`spec.md` 4.2/
//! 4.9's "timer" collaborator).
//!
//! Grounded on the teacher's `TimerWheel` (`conntrack/timerwheel.rs`, since
//! deleted): the same fixed-resolution bucket array, advanced by polling a
//! `std::time::Instant` rather than storing pointers into a connection
//! table directly. Two differences fit this core's shape: entries are keyed
//! by an opaque `flow_id` rather than owning the record, and `update`/
//! `cancel` need to find an already-scheduled entry, so an index map from
//! `flow_id` to its current bucket is kept alongside the bucket array. A
//! single [`WheelTimer`] drives both the per-core wheel (`template: false`)
//! and, behind its own lock, the one shared template wheel — mirroring how
//! [`TemplateTable`](crate::conntrack::table::TemplateTable) is one
//! process-wide structure while [`CoreTable`](crate::conntrack::table::CoreTable)
//! is one per core.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::collab::TimerService;

struct Wheel {
    start: Instant,
    resolution: Duration,
    buckets: Vec<VecDeque<u64>>,
    index: std::collections::HashMap<u64, usize>,
    /// Next tick not yet swept by `poll` (the teacher's `next_bucket`).
    next_tick: u128,
}

impl Wheel {
    fn new(horizon: Duration, resolution: Duration) -> Self {
        let n = (horizon.as_millis() / resolution.as_millis().max(1)).max(1) as usize;
        Wheel {
            start: Instant::now(),
            resolution,
            buckets: vec![VecDeque::new(); n],
            index: std::collections::HashMap::new(),
            next_tick: 0,
        }
    }

    fn tick_for(&self, deadline: Duration) -> u128 {
        deadline.as_millis() / self.resolution.as_millis().max(1)
    }

    fn bucket_for(&self, tick: u128) -> usize {
        (tick as usize) % self.buckets.len()
    }

    fn cancel(&mut self, flow_id: u64) {
        if let Some(bucket) = self.index.remove(&flow_id) {
            self.buckets[bucket].retain(|id| *id != flow_id);
        }
    }

    /// `timeout` is relative to now, matching the `Duration` a flow's own
    /// `timeout` field holds (`spec.md` 3), not an absolute deadline.
    fn schedule(&mut self, flow_id: u64, timeout: Duration) {
        self.cancel(flow_id);
        let target = self.start.elapsed() + timeout;
        let bucket = self.bucket_for(self.tick_for(target));
        self.buckets[bucket].push_back(flow_id);
        self.index.insert(flow_id, bucket);
    }

    /// Sweeps every tick from the last poll position through the current
    /// one, draining their buckets — a single bucket check would silently
    /// skip ticks the wheel wasn't polled on, like the teacher's
    /// `next_bucket..last_expire_bucket` sweep in `remove_inactive`.
    fn poll(&mut self, elapsed: Duration) -> Vec<u64> {
        let now_tick = self.tick_for(elapsed);
        if now_tick < self.next_tick {
            return Vec::new();
        }
        let mut ids = Vec::new();
        let span = (now_tick - self.next_tick + 1).min(self.buckets.len() as u128);
        let start_tick = now_tick + 1 - span;
        for tick in start_tick..=now_tick {
            let bucket = self.bucket_for(tick);
            ids.extend(self.buckets[bucket].drain(..));
        }
        for id in &ids {
            self.index.remove(id);
        }
        self.next_tick = now_tick + 1;
        ids
    }
}

/// Default, in-process [`TimerService`]. A real deployment driven by an
/// external packet-processing runtime would instead tick this (or an
/// equivalent) from its own per-core poll loop; this crate only owns the
/// bucket bookkeeping, not the loop that drains it.
pub struct WheelTimer {
    core: Mutex<Wheel>,
    template: Mutex<Wheel>,
}

impl WheelTimer {
    pub fn new(horizon: Duration, resolution: Duration) -> Self {
        WheelTimer {
            core: Mutex::new(Wheel::new(horizon, resolution)),
            template: Mutex::new(Wheel::new(horizon, resolution)),
        }
    }

    /// Flow ids whose deadline has just rolled past, for the caller's own
    /// per-core or shared-template sweep.
    pub fn poll_expired(&self, template: bool) -> Vec<u64> {
        let wheel = if template { &self.template } else { &self.core };
        let mut wheel = wheel.lock().expect("timer wheel lock poisoned");
        let elapsed = wheel.start.elapsed();
        wheel.poll(elapsed)
    }
}

impl TimerService for WheelTimer {
    fn schedule(&self, flow_id: u64, deadline: Duration, template: bool) {
        let wheel = if template { &self.template } else { &self.core };
        wheel
            .lock()
            .expect("timer wheel lock poisoned")
            .schedule(flow_id, deadline);
    }

    fn update(&self, flow_id: u64, deadline: Duration, template: bool) {
        self.schedule(flow_id, deadline, template);
    }

    fn cancel(&self, flow_id: u64, template: bool) {
        let wheel = if template { &self.template } else { &self.core };
        wheel.lock().expect("timer wheel lock poisoned").cancel(flow_id);
    }
}
