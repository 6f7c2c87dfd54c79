//! Thread-to-core pinning.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use nix::Error;

use super::CoreId;

/// Pins the calling thread to `core`, so every packet of a flow handled by
/// this worker stays on the core its tables live on.
pub fn pin_thread_to_core(core: CoreId) -> Result<(), Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core.raw() as usize)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    Ok(())
}
