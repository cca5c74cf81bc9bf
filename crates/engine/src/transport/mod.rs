pub mod sock;

use std::net::SocketAddr;

pub use sock::SystemTransport;

/// Opaque identifier for one socket owned by a [`Transport`].
///
/// This is what the host's event loop passes back into
/// [`Channel::tick`](crate::Channel::tick) as readiness information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

/// Result of opening a socket toward a server.
#[derive(Debug, Clone, Copy)]
pub struct OpenedSocket {
    pub handle: SocketHandle,
    /// False for TCP sockets whose handshake is still in flight; the
    /// engine defers writes until the host signals writability.
    pub connected: bool,
    /// True when initial data may ride along with the TCP handshake
    /// (TCP Fast Open).
    pub tfo_initial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The operation would block; try again on the next readiness signal.
    WouldBlock,
    Refused,
    BadFamily,
    /// Peer closed the stream.
    Closed,
    OutOfMemory,
    Io(String),
}

/// Non-blocking socket I/O consumed by the engine.
///
/// All calls must return immediately. Reads and writes operate on whole
/// DNS messages for UDP (one datagram per call) and on raw stream bytes
/// for TCP.
pub trait Transport: Send {
    fn open(&mut self, server: SocketAddr, kind: TransportKind)
        -> Result<OpenedSocket, TransportError>;

    fn read(&mut self, socket: SocketHandle, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write(&mut self, socket: SocketHandle, buf: &[u8]) -> Result<usize, TransportError>;

    fn close(&mut self, socket: SocketHandle);

    /// Whether the engine may keep reading a readable socket until it
    /// reports `WouldBlock`. Implementations wrapping sockets they do not
    /// fully own should return false so a blocking read is never risked.
    fn read_to_exhaustion(&self) -> bool {
        true
    }
}
