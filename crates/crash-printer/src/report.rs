//! Rendering of a crash report into the log.
//!
//! A report is a header line naming the signal, one line per frame, and a
//! closing line:
//!
//! ```text
//! *** SIGSEGV (segmentation fault) signal=11 code=1 addr=0x8 pid=4242 tid=4242 time=1760870400 ***
//! #0  0x000055d4c1f0a1b2 _ZN11crash_probe5fault17h0a1b2c3d4e5f6a7bE+0x12 (/usr/bin/crash-probe)
//! #1  0x00007f3a5c0420c0 (/lib/x86_64-linux-gnu/libc.so.6+0x420c0)
//! #2  ... truncated at 2 frames
//! --- end of report ---
//! ```
//!
//! Lines are rendered one at a time into a stack buffer and written with a
//! single `write` each.

use crate::signal::MonitoredSignal;
use crate::stack::{self, Backtrace, CaptureOptions, Frame, FrameEntry};
use crate::writer::{LineBuf, SignalSafeWriter};

/// Capacity of one rendered line. Longer lines are cut short.
pub const LINE_CAPACITY: usize = 512;

const FOOTER: &[u8] = b"--- end of report ---\n";

/// Everything known about one fault occurrence apart from its stack.
///
/// Lives on the handler's stack for the duration of one delivery.
#[derive(Debug, Clone, Copy)]
pub struct CrashReport {
    pub signal: MonitoredSignal,
    /// `si_code` from the delivered siginfo.
    pub code: i32,
    /// Faulting address, for kernel-generated faults.
    pub fault_address: Option<usize>,
    pub pid: u32,
    pub tid: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

impl CrashReport {
    /// Collect the report fields for the current delivery.
    ///
    /// # Safety
    ///
    /// `info` must be null or point to the siginfo the kernel passed to
    /// the handler.
    pub unsafe fn from_siginfo(signal: MonitoredSignal, info: *const libc::siginfo_t) -> Self {
        // SAFETY: forwarded from the caller.
        let (code, fault_address) = unsafe { siginfo_fields(info) };
        CrashReport {
            signal,
            code,
            fault_address,
            // SAFETY: getpid is async-signal-safe and cannot fail.
            pid: unsafe { libc::getpid() } as u32,
            tid: current_tid(),
            timestamp: wall_clock_seconds(),
        }
    }

    /// Write the report with the frames of an already captured backtrace.
    ///
    /// Returns `false` if any line could not be written.
    pub fn write_to(&self, writer: &SignalSafeWriter, backtrace: &Backtrace) -> bool {
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        let mut ok = self.write_header(writer, &mut line);
        for entry in backtrace.entries() {
            ok &= write_entry(writer, &entry, &mut line);
        }
        ok &= writer.write(FOOTER);
        ok
    }

    /// Walk the current stack and write the report frame by frame.
    ///
    /// Only one line buffer and one frame are live at a time, so this fits
    /// on a small alternate signal stack whatever the frame bound.
    #[inline(never)]
    pub fn write_live(&self, writer: &SignalSafeWriter, options: CaptureOptions) -> bool {
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        let mut ok = self.write_header(writer, &mut line);
        stack::walk(options, |entry| {
            ok &= write_entry(writer, &entry, &mut line);
        });
        ok &= writer.write(FOOTER);
        ok
    }

    fn write_header(&self, writer: &SignalSafeWriter, line: &mut LineBuf<LINE_CAPACITY>) -> bool {
        line.clear();
        self.render_header(line);
        writer.write(line.finish())
    }

    pub fn render_header<const N: usize>(&self, line: &mut LineBuf<N>) {
        line.push_str("*** ")
            .push_str(self.signal.name())
            .push_str(" (")
            .push_str(self.signal.description())
            .push_str(") signal=")
            .push_signed(signal_number(self.signal))
            .push_str(" code=")
            .push_signed(self.code as i64);
        if let Some(address) = self.fault_address {
            line.push_str(" addr=").push_hex(address as u64);
        }
        line.push_str(" pid=")
            .push_dec(self.pid as u64)
            .push_str(" tid=")
            .push_dec(self.tid)
            .push_str(" time=")
            .push_signed(self.timestamp)
            .push_str(" ***");
    }
}

fn signal_number(signal: MonitoredSignal) -> i64 {
    signal.as_raw() as i64
}

fn write_entry(
    writer: &SignalSafeWriter,
    entry: &FrameEntry,
    line: &mut LineBuf<LINE_CAPACITY>,
) -> bool {
    line.clear();
    render_entry(entry, line);
    writer.write(line.finish())
}

/// Render one backtrace entry, without the trailing newline.
pub fn render_entry<const N: usize>(entry: &FrameEntry, line: &mut LineBuf<N>) {
    match entry {
        FrameEntry::Frame { index, frame } => render_frame(*index, frame, line),
        FrameEntry::Truncated { bound } => {
            line.push_str("#")
                .push_dec(*bound as u64)
                .push_str("  ... truncated at ")
                .push_dec(*bound as u64)
                .push_str(" frames");
        }
    }
}

fn render_frame<const N: usize>(index: usize, frame: &Frame, line: &mut LineBuf<N>) {
    line.push_str("#").push_dec(index as u64);
    line.push_str(if index < 10 { "  " } else { " " });
    line.push_hex_padded(frame.address() as u64, 2 * size_of::<usize>());

    if let Some(symbol) = frame.symbol() {
        line.push_str(" ").push_cstr(symbol);
        if frame.symbol_offset() != 0 {
            line.push_str("+").push_hex(frame.symbol_offset() as u64);
        }
        if let Some(module) = frame.module() {
            line.push_str(" (").push_cstr(module).push_str(")");
        }
    } else if let Some(module) = frame.module() {
        line.push_str(" (")
            .push_cstr(module)
            .push_str("+")
            .push_hex(frame.module_offset() as u64)
            .push_str(")");
    }
}

/// Extract `si_code` and, for kernel-generated faults, the fault address.
unsafe fn siginfo_fields(info: *const libc::siginfo_t) -> (i32, Option<usize>) {
    if info.is_null() {
        return (0, None);
    }
    // SAFETY: non-null and valid per the caller.
    let info = unsafe { &*info };
    let code = info.si_code;
    if !sent_by_kernel(code) {
        return (code, None);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: for kernel-generated SIGSEGV/SIGBUS/SIGILL/SIGFPE the union
    // holds the fault address.
    let address = unsafe { info.si_addr() } as usize;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let address = info.si_addr as usize;

    (code, Some(address))
}

/// Whether `si_code` says the kernel raised the signal (a real fault)
/// rather than `kill`, `raise` or `sigqueue`.
pub fn sent_by_kernel(code: i32) -> bool {
    code > 0
}

fn current_tid() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: the gettid syscall has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
    #[cfg(target_vendor = "apple")]
    {
        let mut tid: u64 = 0;
        // SAFETY: a null thread means the calling thread.
        unsafe { libc::pthread_threadid_np(0, &mut tid) };
        tid
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
    {
        0
    }
}

fn wall_clock_seconds() -> i64 {
    // SAFETY: timespec is plain data; all-zeroes is a valid value.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: clock_gettime is async-signal-safe; `now` is a valid out
    // pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return 0;
    }
    now.tv_sec as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    fn report() -> CrashReport {
        CrashReport {
            signal: MonitoredSignal::Segv,
            code: 1,
            fault_address: Some(0x8),
            pid: 4242,
            tid: 4243,
            timestamp: 1_760_870_400,
        }
    }

    fn read_back(file: &mut std::fs::File) -> String {
        file.seek(SeekFrom::Start(0)).unwrap();
        std::io::read_to_string(file).unwrap()
    }

    fn render(entry: FrameEntry) -> String {
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        render_entry(&entry, &mut line);
        String::from_utf8(line.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_header_names_signal() {
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        report().render_header(&mut line);
        let header = String::from_utf8(line.as_bytes().to_vec()).unwrap();
        assert_eq!(
            header,
            format!(
                "*** SIGSEGV (segmentation fault) signal={} code=1 addr=0x8 pid=4242 tid=4243 time=1760870400 ***",
                libc::SIGSEGV
            )
        );
    }

    #[test]
    fn test_header_without_address() {
        let mut r = report();
        r.signal = MonitoredSignal::Abrt;
        r.code = -6;
        r.fault_address = None;
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        r.render_header(&mut line);
        let header = String::from_utf8(line.as_bytes().to_vec()).unwrap();
        assert!(header.starts_with("*** SIGABRT (abort) signal="));
        assert!(header.contains(" code=-6 pid=4242"));
        assert!(!header.contains("addr="));
    }

    #[test]
    fn test_bare_frame_rendering() {
        let bt = Backtrace::from_addresses(&[0x1234, 0xabc], 8);
        let entries: Vec<_> = bt.entries().map(render).collect();
        let width = 2 * size_of::<usize>();
        assert_eq!(entries[0], format!("#0  0x{:0width$x}", 0x1234, width = width));
        assert_eq!(entries[1], format!("#1  0x{:0width$x}", 0xabc, width = width));
    }

    #[test]
    fn test_truncation_sentinel_rendering() {
        let bt = Backtrace::from_addresses(&[1, 2, 3, 4], 2);
        let entries: Vec<_> = bt.entries().map(render).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], "#2  ... truncated at 2 frames");
    }

    #[test]
    fn test_kernel_code_detection() {
        assert!(sent_by_kernel(1));
        assert!(!sent_by_kernel(0));
        assert!(!sent_by_kernel(-6));
    }

    #[test]
    fn test_null_siginfo() {
        let (code, address) = unsafe { siginfo_fields(std::ptr::null()) };
        assert_eq!(code, 0);
        assert_eq!(address, None);
    }

    #[test]
    fn test_write_full_report() {
        let mut file = tempfile::tempfile().unwrap();
        let writer = SignalSafeWriter::new(file.as_raw_fd());
        let bt = Backtrace::from_addresses(&[0x10, 0x20, 0x30], 2);

        assert!(report().write_to(&writer, &bt));

        let content = read_back(&mut file);
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("*** SIGSEGV"));
        assert!(lines[1].starts_with("#0  0x"));
        assert!(lines[2].starts_with("#1  0x"));
        assert_eq!(lines[3], "#2  ... truncated at 2 frames");
        assert_eq!(lines[4], "--- end of report ---");
    }

    #[test]
    fn test_live_report_streams_frames() {
        let mut file = tempfile::tempfile().unwrap();
        let writer = SignalSafeWriter::new(file.as_raw_fd());
        let options = CaptureOptions {
            max_frames: 2,
            skip: 0,
            symbolize: false,
        };

        assert!(report().write_live(&writer, options));

        let content = read_back(&mut file);
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with("*** SIGSEGV"));
        assert!(lines[1].starts_with("#0  0x"));
        assert!(lines[2].starts_with("#1  0x"));
        assert_eq!(lines[3], "#2  ... truncated at 2 frames");
        assert_eq!(lines[4], "--- end of report ---");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_live_report_fields() {
        let r = unsafe { CrashReport::from_siginfo(MonitoredSignal::Fpe, std::ptr::null()) };
        assert_eq!(r.pid, std::process::id());
        assert!(r.tid > 0);
        assert!(r.timestamp > 0);
        assert_eq!(r.fault_address, None);
    }
}
