//! Signal-safe output.
//!
//! Everything here is usable from inside a signal handler: no heap
//! allocation, no locks, no `std::fmt`. Text is assembled in a fixed-size
//! [`LineBuf`] and handed to [`SignalSafeWriter`], which issues raw
//! `write(2)` calls against an already-open descriptor.
//!
//! See <https://man7.org/linux/man-pages/man7/signal-safety.7.html>.

use nix::errno::Errno;
use std::ffi::CStr;
use std::os::fd::RawFd;

/// How many times a write interrupted by `EINTR` is retried.
const MAX_EINTR_RETRIES: usize = 8;

/// Unbuffered writer over a raw descriptor.
///
/// The descriptor is expected to be opened with `O_APPEND`, so each
/// `write` lands atomically at the end of the file even when several
/// threads report at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSafeWriter {
    fd: RawFd,
}

impl SignalSafeWriter {
    pub const fn new(fd: RawFd) -> Self {
        SignalSafeWriter { fd }
    }

    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// Write all of `bytes`.
    ///
    /// Returns `false` if the write was abandoned (descriptor error, a
    /// zero-length write, or too many interruptions). There is nobody to
    /// report that to, so callers are free to ignore it.
    pub fn write(&self, bytes: &[u8]) -> bool {
        let mut remaining = bytes;
        let mut interruptions = 0;

        while !remaining.is_empty() {
            // SAFETY: `remaining` is a valid readable slice for its length.
            let written = unsafe {
                libc::write(self.fd, remaining.as_ptr().cast(), remaining.len())
            };

            if written > 0 {
                remaining = &remaining[written as usize..];
                continue;
            }

            if written < 0 && Errno::last() == Errno::EINTR && interruptions < MAX_EINTR_RETRIES {
                interruptions += 1;
                continue;
            }

            return false;
        }

        true
    }
}

/// Fixed-capacity byte buffer for rendering one line of text.
///
/// Pushing past the capacity drops the excess and marks the line as
/// truncated; [`LineBuf::finish`] always leaves room for the newline.
pub struct LineBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> Default for LineBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LineBuf<N> {
    pub const fn new() -> Self {
        LineBuf {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let room = N - self.len;
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        if take < bytes.len() {
            self.truncated = true;
        }
        self
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    pub fn push_cstr(&mut self, s: &CStr) -> &mut Self {
        self.push_bytes(s.to_bytes())
    }

    /// Unsigned decimal.
    pub fn push_dec(&mut self, value: u64) -> &mut Self {
        let mut digits = [0u8; 20];
        let mut pos = digits.len();
        let mut value = value;
        loop {
            pos -= 1;
            digits[pos] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        self.push_bytes(&digits[pos..])
    }

    /// Signed decimal.
    pub fn push_signed(&mut self, value: i64) -> &mut Self {
        if value < 0 {
            self.push_bytes(b"-");
        }
        self.push_dec(value.unsigned_abs())
    }

    /// `0x`-prefixed lowercase hex, no padding.
    pub fn push_hex(&mut self, value: u64) -> &mut Self {
        self.push_hex_padded(value, 1)
    }

    /// `0x`-prefixed lowercase hex, zero-padded to at least `width` digits.
    pub fn push_hex_padded(&mut self, value: u64, width: usize) -> &mut Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut digits = [0u8; 16];
        let mut pos = digits.len();
        let mut value = value;
        loop {
            pos -= 1;
            digits[pos] = HEX[(value & 0xf) as usize];
            value >>= 4;
            if value == 0 {
                break;
            }
        }
        let width = width.min(digits.len());
        while digits.len() - pos < width {
            pos -= 1;
            digits[pos] = b'0';
        }
        self.push_bytes(b"0x");
        self.push_bytes(&digits[pos..])
    }

    /// Terminate the line with `\n`, overwriting the last byte if full.
    pub fn finish(&mut self) -> &[u8] {
        if N == 0 {
            return &[];
        }
        if self.len == N {
            self.len -= 1;
            self.truncated = true;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
        self.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_push_dec() {
        let mut line = LineBuf::<64>::new();
        line.push_dec(0).push_str(" ").push_dec(1234567890).push_str(" ");
        line.push_dec(u64::MAX);
        assert_eq!(line.as_bytes(), b"0 1234567890 18446744073709551615");
    }

    #[test]
    fn test_push_signed() {
        let mut line = LineBuf::<64>::new();
        line.push_signed(-42).push_str(",").push_signed(i64::MIN);
        assert_eq!(line.as_bytes(), b"-42,-9223372036854775808");
    }

    #[test]
    fn test_push_hex() {
        let mut line = LineBuf::<64>::new();
        line.push_hex(0).push_str(" ").push_hex(0xdead_beef);
        line.push_str(" ").push_hex_padded(0x1a, 8);
        line.push_str(" ").push_hex_padded(u64::MAX, 4);
        assert_eq!(
            line.as_bytes(),
            b"0x0 0xdeadbeef 0x0000001a 0xffffffffffffffff"
        );
    }

    #[test]
    fn test_overflow_truncates_and_keeps_newline() {
        let mut line = LineBuf::<8>::new();
        line.push_str("abcdefghijkl");
        assert!(line.is_truncated());
        assert_eq!(line.len(), 8);
        assert_eq!(line.finish(), b"abcdefg\n");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut line = LineBuf::<4>::new();
        line.push_str("overflowing");
        line.clear();
        assert!(line.is_empty());
        assert!(!line.is_truncated());
        assert_eq!(line.push_str("ok").finish(), b"ok\n");
    }

    #[test]
    fn test_writer_appends_to_file() {
        let mut file = tempfile::tempfile().unwrap();
        let writer = SignalSafeWriter::new(file.as_raw_fd());

        assert!(writer.write(b"first\n"));
        assert!(writer.write(b"second\n"));
        assert!(writer.write(b""));

        file.seek(SeekFrom::Start(0)).unwrap();
        let content = std::io::read_to_string(&mut file).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn test_writer_gives_up_on_bad_descriptor() {
        assert!(!SignalSafeWriter::new(-1).write(b"lost\n"));
    }

    #[test]
    fn test_writer_gives_up_on_read_only_descriptor() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let read_only = fs::File::open(file.path()).unwrap();
        let writer = SignalSafeWriter::new(read_only.as_raw_fd());
        assert!(!writer.write(b"lost\n"));
        assert_eq!(fs::read(file.path()).unwrap(), b"");
    }
}
