//! Process RSS sampling for the memory monitor.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

static SYSTEM: Lazy<Mutex<System>> = Lazy::new(|| Mutex::new(System::new()));

/// Current resident set size of this process in bytes; 0 when the probe
/// fails (unsupported platform, racing process table).
#[must_use]
pub fn current_rss_bytes() -> u64 {
    let pid = Pid::from_u32(std::process::id());
    let mut system = SYSTEM.lock();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map_or(0, |p| p.memory())
}
