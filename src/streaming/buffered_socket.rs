//! Buffered reads and writes over a stream socket
//!
//! `peek`/`read` block until enough bytes are buffered. A zero-length receive
//! means the peer closed the connection and is reported as `Ok(None)`, while a
//! read timeout surfaces as an `Err` the caller may treat as transient (see
//! [`is_timeout`]).

use crate::error::{Error, Result};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};

/// Default buffer capacity
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Read/write buffering over a byte stream
pub struct BufferedSocket<S = TcpStream> {
    stream: S,
    capacity: usize,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
}

impl<S> BufferedSocket<S> {
    /// Wrap `stream` with the default capacity
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            capacity: DEFAULT_BUFFER_SIZE,
            read_buffer: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            write_buffer: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Wrap `stream`, rounding `size` up to the next power of two
    pub fn with_capacity(stream: S, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidBufferSize(size));
        }
        let capacity = size.next_power_of_two();
        Ok(Self {
            stream,
            capacity,
            read_buffer: Vec::with_capacity(capacity),
            write_buffer: Vec::with_capacity(capacity),
        })
    }

    /// Buffer capacity (receive chunk size and write flush threshold)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes received but not yet consumed
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Bytes queued but not yet sent
    pub fn pending_write(&self) -> usize {
        self.write_buffer.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: Read> BufferedSocket<S> {
    /// Receive until at least `n` bytes are buffered.
    ///
    /// Returns `Ok(false)` if the peer closed first.
    fn fill(&mut self, n: usize) -> io::Result<bool> {
        while self.read_buffer.len() < n {
            let start = self.read_buffer.len();
            self.read_buffer.resize(start + self.capacity, 0);
            let result = self.stream.read(&mut self.read_buffer[start..]);
            let received = match result {
                Ok(received) => received,
                Err(e) => {
                    self.read_buffer.truncate(start);
                    if e.kind() == ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(e);
                }
            };
            self.read_buffer.truncate(start + received);
            if received == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Look at the next `n` bytes without consuming them.
    ///
    /// `Ok(None)` if the peer closed before `n` bytes arrived.
    pub fn peek(&mut self, n: usize) -> io::Result<Option<&[u8]>> {
        if !self.fill(n)? {
            return Ok(None);
        }
        Ok(Some(&self.read_buffer[..n]))
    }

    /// Consume exactly `n` bytes.
    ///
    /// `Ok(None)` if the peer closed before `n` bytes arrived. Bytes already
    /// buffered stay buffered in that case.
    pub fn read(&mut self, n: usize) -> io::Result<Option<Vec<u8>>> {
        if !self.fill(n)? {
            return Ok(None);
        }
        Ok(Some(self.read_buffer.drain(..n).collect()))
    }

    /// Consume exactly `N` bytes into an array
    pub fn read_array<const N: usize>(&mut self) -> io::Result<Option<[u8; N]>> {
        if !self.fill(N)? {
            return Ok(None);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.read_buffer[..N]);
        self.read_buffer.drain(..N);
        Ok(Some(out))
    }
}

impl<S: Write> BufferedSocket<S> {
    /// Queue `bytes`, flushing if requested or once the queue exceeds capacity
    pub fn write(&mut self, bytes: &[u8], flush: bool) -> io::Result<()> {
        self.write_buffer.extend_from_slice(bytes);
        if flush || self.write_buffer.len() > self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    /// Send everything queued. A send that accepts zero bytes is a failure.
    pub fn flush(&mut self) -> io::Result<()> {
        let mut sent = 0;
        let result = loop {
            if sent == self.write_buffer.len() {
                break self.stream.flush();
            }
            match self.stream.write(&self.write_buffer[sent..]) {
                Ok(0) => {
                    break Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ));
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.write_buffer.drain(..sent);
        result
    }
}

impl BufferedSocket<TcpStream> {
    /// Shut down both directions. Errors from an already closed socket are ignored.
    pub fn close(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::trace!("Shutdown on closed socket: {}", e);
        }
    }
}

/// Whether `e` is a read/write timeout rather than a broken connection
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that returns at most `chunk` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        calls: usize,
    }

    impl Trickle {
        fn new(data: &[u8], chunk: usize) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                chunk,
                calls: 0,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Writer that accepts nothing
    struct Stuck;

    impl Write for Stuck {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Reader that always times out
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::WouldBlock, "timed out"))
        }
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let sock = BufferedSocket::with_capacity(&b""[..], 1000).unwrap();
        assert_eq!(sock.capacity(), 1024);
        let sock = BufferedSocket::with_capacity(&b""[..], 4096).unwrap();
        assert_eq!(sock.capacity(), 4096);
        assert!(matches!(
            BufferedSocket::with_capacity(&b""[..], 0),
            Err(Error::InvalidBufferSize(0))
        ));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut sock = BufferedSocket::new(&b"abcdef"[..]);
        assert_eq!(sock.peek(3).unwrap(), Some(&b"abc"[..]));
        assert_eq!(sock.peek(3).unwrap(), Some(&b"abc"[..]));
        assert_eq!(sock.read(4).unwrap(), Some(b"abcd".to_vec()));
        assert_eq!(sock.read(2).unwrap(), Some(b"ef".to_vec()));
    }

    #[test]
    fn test_read_accumulates_small_chunks() {
        let data: Vec<u8> = (0..100).collect();
        let mut sock = BufferedSocket::with_capacity(Trickle::new(&data, 7), 16).unwrap();
        assert_eq!(sock.read(50).unwrap(), Some(data[..50].to_vec()));
        assert!(sock.get_ref().calls >= 8);
        assert_eq!(sock.read_array::<4>().unwrap(), Some([50, 51, 52, 53]));
    }

    #[test]
    fn test_closed_peer_is_none() {
        let mut sock = BufferedSocket::new(&b"ab"[..]);
        assert_eq!(sock.peek(3).unwrap(), None);
        assert_eq!(sock.read(3).unwrap(), None);
        // partial data stays available
        assert_eq!(sock.buffered(), 2);
        assert_eq!(sock.read(2).unwrap(), Some(b"ab".to_vec()));
    }

    #[test]
    fn test_timeout_is_error() {
        let mut sock = BufferedSocket::new(Silent);
        let err = sock.read(1).unwrap_err();
        assert!(is_timeout(&err));
        assert_eq!(sock.buffered(), 0);
    }

    #[test]
    fn test_write_flushes_over_capacity() {
        let mut sock = BufferedSocket::with_capacity(Vec::new(), 8).unwrap();
        sock.write(b"1234", false).unwrap();
        assert!(sock.get_ref().is_empty());
        assert_eq!(sock.pending_write(), 4);

        sock.write(b"56789", false).unwrap();
        assert_eq!(sock.get_ref().as_slice(), b"123456789");
        assert_eq!(sock.pending_write(), 0);

        sock.write(b"x", true).unwrap();
        assert_eq!(sock.get_ref().as_slice(), b"123456789x");
    }

    #[test]
    fn test_zero_byte_send_fails() {
        let mut sock = BufferedSocket::new(Stuck);
        let err = sock.write(b"data", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteZero);
    }
}
