use std::io;
use std::os::unix::io::RawFd;

/// Application-level byte buffer with a prepend area.
///
/// Layout is three contiguous regions over one backing allocation:
///
/// ```text
/// | prependable | readable | writable |
/// ^ 0           ^ reader   ^ writer   ^ storage.len()
/// ```
///
/// Invariant: `RESERVED_PREPEND <= reader <= writer <= storage.len()` once any
/// data has flowed through; the prepend floor never shrinks below the fixed
/// reserve.
pub struct Buffer {
    storage: Vec<u8>,
    reader: usize,
    writer: usize,
}

/// Fixed prepend reserve, enough for a length header.
pub const RESERVED_PREPEND: usize = 8;
/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;
/// Auxiliary stack region used by the scattered read.
const EXTRA_BUF_SIZE: usize = 65536;

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            storage: vec![0; RESERVED_PREPEND + initial],
            reader: RESERVED_PREPEND,
            writer: RESERVED_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// View over the readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader..self.writer]
    }

    /// Advance the reader index by `len` bytes.
    ///
    /// Retrieving everything collapses both indices back to the prepend floor.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = RESERVED_PREPEND;
        self.writer = RESERVED_PREPEND;
    }

    /// Copy out and consume `len` readable bytes.
    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    /// Consume the readable region as a string, replacing invalid UTF-8.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_vec()).into_owned()
    }

    /// Append bytes, growing or compacting the backing storage as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Write into the prepend area, immediately before the readable region.
    ///
    /// Callers must not prepend more than `prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        let reader = self.reader;
        self.storage[reader..reader + data.len()].copy_from_slice(data);
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Growth policy: if the slack in front of the readable region plus the
    /// writable region can hold `len`, slide the readable bytes down to the
    /// prepend floor; otherwise resize to `writer + len`.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + RESERVED_PREPEND {
            self.storage.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader..self.writer, RESERVED_PREPEND);
            self.reader = RESERVED_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Fill the buffer from `fd` with one vectored read.
    ///
    /// The read scatters into the writable region plus a 64 KiB stack region,
    /// so a single call drains whatever the kernel has queued without first
    /// probing the socket for its queued length. Overflow that landed in the
    /// stack region is appended (which grows the buffer exactly once).
    ///
    /// Returns the byte count; `Ok(0)` is end-of-stream.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.storage[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];
        // Skip the stack region entirely when the writable region is already
        // at least as large.
        let iovcnt: libc::c_int = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Issue one write of up to `readable_bytes()` to `fd`.
    ///
    /// Does not retrieve; the caller retrieves after inspecting the count.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.storage[self.reader..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.storage.len()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
