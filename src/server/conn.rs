//! Per-connection state.
//!
//! One [`Connection`] exists per accepted socket. The orchestrator's
//! `all_sockets` map holds the canonical strong reference; stage jobs clone
//! the `Arc` for their duration, so the socket cannot be freed under a
//! running job. The descriptor closes when the last clone drops.
//!
//! All mutable state lives behind a single mutex (rank 2 in the lock
//! hierarchy): the phase machine, both buffers, the parse cursor, and the
//! close-after-drain flag. The descriptor and peer address are fixed at
//! construction and readable without the lock.
//!
//! ```text
//!        ┌──────┐  readable   ┌─────────┐  frames   ┌─────────┐
//!        │ Idle │────────────>│ Reading │──────────>│ Parsing │
//!        └──────┘             └─────────┘           └────┬────┘
//!            ▲                                           │ replies queued
//!            │         out_buf drained                   ▼
//!            │                 ┌─────────┐          ┌─────────┐
//!            └─────────────────│ Writing │<─────────│         │
//!                              └────┬────┘          └─────────┘
//!                                   │ error / EOF / cap
//!                                   ▼
//!                              ┌─────────┐
//!                              │ Closing │
//!                              └─────────┘
//! ```

use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

/// Ceiling on either buffer; a connection that exceeds it is dropped.
pub const DEFAULT_BUFFER_CAP: usize = 16 * 1024 * 1024;

/// Consumed input is dropped once the cursor passes this, or once it covers
/// at least half the buffer.
const COMPACT_THRESHOLD: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

/// Where a connection currently is in the read → parse → write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Reading,
    Parsing,
    Writing,
    Closing,
}

/// Result of draining the socket's receive buffer.
pub enum ReadOutcome {
    /// Read until EAGAIN; `0` bytes is possible on a spurious wakeup.
    Progress(usize),
    /// Orderly close from the peer.
    Eof,
    /// `in_buf` hit the cap.
    Overflow,
    Failed(io::Error),
}

/// Result of flushing `out_buf` to the socket.
pub enum WriteOutcome {
    /// Everything queued went out.
    Drained(usize),
    /// Short write; the kernel buffer filled after `n` bytes.
    Blocked(usize),
    Failed(io::Error),
}

/// State guarded by the connection mutex.
#[derive(Debug)]
pub struct ConnState {
    pub phase: Phase,
    /// Bytes read but not yet consumed. `in_buf[..parse_cursor]` has been
    /// parsed and replied to; the rest may hold partial frames.
    pub in_buf: BytesMut,
    /// Reply bytes not yet written; drained front-first on short writes.
    pub out_buf: BytesMut,
    pub parse_cursor: usize,
    /// Set on framing errors: flush the error reply, then tear down.
    pub close_after_drain: bool,
}

impl ConnState {
    pub fn unparsed(&self) -> &[u8] {
        &self.in_buf[self.parse_cursor..]
    }

    pub fn has_unparsed(&self) -> bool {
        self.parse_cursor < self.in_buf.len()
    }

    /// Drops the consumed prefix of `in_buf` when it has grown past the
    /// threshold or covers at least half the buffer.
    pub fn compact(&mut self) {
        if self.parse_cursor == 0 {
            return;
        }
        if self.parse_cursor >= COMPACT_THRESHOLD || self.parse_cursor * 2 >= self.in_buf.len() {
            self.in_buf.advance(self.parse_cursor);
            self.parse_cursor = 0;
        }
    }
}

/// One accepted client socket plus its guarded state.
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    stream: TcpStream,
    state: Mutex<ConnState>,
}

impl Connection {
    /// Wraps an already non-blocking stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            fd: stream.as_raw_fd(),
            peer,
            stream,
            state: Mutex::new(ConnState {
                phase: Phase::Idle,
                in_buf: BytesMut::with_capacity(READ_CHUNK),
                out_buf: BytesMut::new(),
                parse_cursor: 0,
                close_after_drain: false,
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Locks the state. Callers enter `Rank::Conn` first.
    pub fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock()
    }

    /// Reads until the socket would block, appending to `in_buf`.
    pub fn fill(&self, st: &mut ConnState, cap: usize) -> ReadOutcome {
        let mut stream = &self.stream;
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => {
                    st.in_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                    if st.in_buf.len() > cap {
                        return ReadOutcome::Overflow;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::Progress(total)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    /// Writes from `out_buf` until drained or the socket would block.
    pub fn flush(&self, st: &mut ConnState) -> WriteOutcome {
        let mut stream = &self.stream;
        let mut total = 0;
        while !st.out_buf.is_empty() {
            match stream.write(&st.out_buf) {
                Ok(0) => {
                    return WriteOutcome::Failed(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ))
                }
                Ok(n) => {
                    st.out_buf.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return WriteOutcome::Blocked(total)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return WriteOutcome::Failed(e),
            }
        }
        WriteOutcome::Drained(total)
    }

    /// Severs the TCP conversation. The descriptor itself closes when the
    /// last `Arc<Connection>` drops.
    pub fn sever(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(input: &[u8], cursor: usize) -> ConnState {
        ConnState {
            phase: Phase::Idle,
            in_buf: BytesMut::from(input),
            out_buf: BytesMut::new(),
            parse_cursor: cursor,
            close_after_drain: false,
        }
    }

    #[test]
    fn compact_is_a_noop_below_half() {
        let mut st = state_with(&[0u8; 100], 10);
        st.compact();
        assert_eq!(st.parse_cursor, 10);
        assert_eq!(st.in_buf.len(), 100);
    }

    #[test]
    fn compact_drops_consumed_prefix_at_half() {
        let mut st = state_with(&[7u8; 100], 60);
        st.compact();
        assert_eq!(st.parse_cursor, 0);
        assert_eq!(st.in_buf.len(), 40);
    }

    #[test]
    fn compact_resets_fully_consumed_buffer() {
        let mut st = state_with(b"abcdef", 6);
        st.compact();
        assert_eq!(st.parse_cursor, 0);
        assert!(st.in_buf.is_empty());
        assert!(!st.has_unparsed());
    }

    #[test]
    fn compact_fires_past_threshold_even_below_half() {
        let mut st = state_with(&vec![1u8; 64 * 1024], 17 * 1024);
        st.compact();
        assert_eq!(st.parse_cursor, 0);
        assert_eq!(st.in_buf.len(), 64 * 1024 - 17 * 1024);
    }

    #[test]
    fn unparsed_tracks_cursor() {
        let mut st = state_with(b"+OK\r\n:1\r\n", 5);
        assert_eq!(st.unparsed(), b":1\r\n");
        assert!(st.has_unparsed());
        st.parse_cursor = 9;
        assert!(!st.has_unparsed());
    }
}
