//! Ways to die.

use crash_printer::MonitoredSignal;
use std::hint::black_box;

/// Unmapped, non-null and aligned, so the store faults with SIGSEGV
/// instead of tripping a null-pointer check.
const UNMAPPED_ADDRESS: usize = 0x8;

/// Nest `depth` calls deep, then fault with `signal`.
///
/// Returns only if every delivery was survived.
#[inline(never)]
pub fn fault_at_depth(depth: usize, signal: MonitoredSignal) {
    if depth == 0 {
        fault(signal);
        return;
    }
    fault_at_depth(black_box(depth - 1), signal);
    black_box(depth);
}

#[inline(never)]
fn fault(signal: MonitoredSignal) {
    match signal {
        MonitoredSignal::Segv => {
            let target = black_box(UNMAPPED_ADDRESS) as *mut u32;
            // SAFETY: none; this is the point.
            unsafe { std::ptr::write_volatile(target, 42) };
        }
        MonitoredSignal::Abrt => std::process::abort(),
        other => {
            // SAFETY: raise has no preconditions.
            unsafe { libc::raise(other.as_raw()) };
        }
    }

    // A previous handler that resets itself (the Rust runtime's own
    // SIGSEGV/SIGBUS handler does) returns control for raised signals.
    // The disposition is SIG_DFL by now, so one more delivery finishes the
    // job.
    // SAFETY: raise has no preconditions.
    unsafe { libc::raise(signal.as_raw()) };
}
