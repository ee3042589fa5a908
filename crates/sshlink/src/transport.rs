//! Transport adapter over a raw TCP socket.
//!
//! The protocol engine never owns the socket; it reads and writes through the
//! [`TransportIo`] hooks, which return `io::ErrorKind::WouldBlock` whenever an
//! operation cannot complete immediately. Peer close is surfaced as the
//! adapter becoming disconnected, never as a short read handed to the engine.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;

/// Read chunk size for readiness probes.
const PROBE_CHUNK: usize = 16 * 1024;

/// Low-level byte hooks handed to the protocol engine.
pub trait TransportIo: Send {
    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(n)` with `n > 0`, or `Err` with kind `WouldBlock` when no
    /// bytes are available yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes from `buf`.
    ///
    /// Returns the number of bytes accepted, or `Err` with kind `WouldBlock`
    /// when the socket cannot accept more.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Whether the underlying socket is still connected.
    fn is_connected(&self) -> bool;

    /// Pull readable bytes into an internal staging area and refresh the
    /// connection status.
    ///
    /// The driver calls this after a readiness event so that peer close is
    /// detected even when the engine has nothing to do. Adapters without
    /// staging report zero.
    fn probe(&mut self) -> io::Result<usize> {
        Ok(0)
    }
}

/// Transport adapter over a connected `TcpStream`.
///
/// The stream is shared with the session driver (which awaits readiness on
/// its own clone); all actual reads and writes go through this adapter.
pub struct TcpTransport {
    stream: Arc<TcpStream>,
    staged: BytesMut,
    eof: bool,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("staged_len", &self.staged.len())
            .field("eof", &self.eof)
            .finish()
    }
}

impl TcpTransport {
    /// Wrap an established stream.
    #[must_use]
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self {
            stream,
            staged: BytesMut::with_capacity(PROBE_CHUNK),
            eof: false,
        }
    }

    /// Bytes staged but not yet consumed by the engine.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

impl TransportIo for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Drain staged bytes first so probe() and engine reads never reorder.
        if !self.staged.is_empty() {
            let n = self.staged.len().min(buf.len());
            buf[..n].copy_from_slice(&self.staged[..n]);
            self.staged.advance(n);
            return Ok(n);
        }
        match self.stream.try_read(buf) {
            // Peer close is reported through is_connected(), not as a read.
            Ok(0) => {
                self.eof = true;
                Err(io::ErrorKind::WouldBlock.into())
            }
            other => other,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn is_connected(&self) -> bool {
        !self.eof
    }

    fn probe(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut chunk = [0u8; PROBE_CHUNK];
        match self.stream.try_read(&mut chunk) {
            // Clean EOF marks the adapter disconnected.
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(n) => {
                self.staged.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.eof = true;
                Err(e)
            }
        }
    }
}
