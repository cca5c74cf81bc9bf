use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::{OpenedSocket, SocketHandle, Transport, TransportError, TransportKind};

enum Sock {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

/// Production [`Transport`] over non-blocking OS sockets.
///
/// UDP sockets are connected to their server so reads only yield datagrams
/// from that peer. TCP connects are initiated non-blocking; the pending
/// handshake is reported through [`OpenedSocket::connected`].
pub struct SystemTransport {
    socks: HashMap<u64, Sock>,
    next_handle: u64,
}

impl SystemTransport {
    pub fn new() -> Self {
        Self {
            socks: HashMap::new(),
            next_handle: 1,
        }
    }

    fn open_udp(server: SocketAddr) -> Result<UdpSocket, TransportError> {
        let domain = if server.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(map_io)?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        socket.bind(&bind_addr.into()).map_err(map_io)?;
        socket.set_nonblocking(true).map_err(map_io)?;

        let udp: UdpSocket = socket.into();
        udp.connect(server).map_err(map_io)?;
        Ok(udp)
    }

    fn open_tcp(server: SocketAddr) -> Result<(TcpStream, bool), TransportError> {
        let domain = if server.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(map_io)?;
        socket.set_nonblocking(true).map_err(map_io)?;
        socket.set_nodelay(true).map_err(map_io)?;

        // Non-blocking connect: in-progress is the normal outcome.
        let connected = match socket.connect(&server.into()) {
            Ok(()) => true,
            Err(e) if connect_in_progress(&e) => false,
            Err(e) => return Err(map_io(e)),
        };
        Ok((socket.into(), connected))
    }
}

impl Default for SystemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SystemTransport {
    fn open(
        &mut self,
        server: SocketAddr,
        kind: TransportKind,
    ) -> Result<OpenedSocket, TransportError> {
        let (sock, connected) = match kind {
            TransportKind::Udp => (Sock::Udp(Self::open_udp(server)?), true),
            TransportKind::Tcp => {
                let (stream, connected) = Self::open_tcp(server)?;
                (Sock::Tcp(stream), connected)
            }
        };

        let handle = SocketHandle(self.next_handle);
        self.next_handle += 1;
        self.socks.insert(handle.0, sock);
        debug!(server = %server, kind = kind.as_str(), handle = handle.0, "Socket opened");

        Ok(OpenedSocket {
            handle,
            connected,
            tfo_initial: false,
        })
    }

    fn read(&mut self, socket: SocketHandle, buf: &mut [u8]) -> Result<usize, TransportError> {
        let sock = self
            .socks
            .get_mut(&socket.0)
            .ok_or(TransportError::Closed)?;
        let result = match sock {
            Sock::Udp(udp) => udp.recv(buf),
            Sock::Tcp(tcp) => match tcp.read(buf) {
                Ok(0) => return Err(TransportError::Closed),
                other => other,
            },
        };
        result.map_err(map_io)
    }

    fn write(&mut self, socket: SocketHandle, buf: &[u8]) -> Result<usize, TransportError> {
        let sock = self
            .socks
            .get_mut(&socket.0)
            .ok_or(TransportError::Closed)?;
        let result = match sock {
            Sock::Udp(udp) => udp.send(buf),
            Sock::Tcp(tcp) => tcp.write(buf),
        };
        result.map_err(map_io)
    }

    fn close(&mut self, socket: SocketHandle) {
        if self.socks.remove(&socket.0).is_some() {
            debug!(handle = socket.0, "Socket closed");
        }
    }
}

fn map_io(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::WouldBlock => TransportError::WouldBlock,
        io::ErrorKind::ConnectionRefused => TransportError::Refused,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => TransportError::Closed,
        io::ErrorKind::AddrNotAvailable => TransportError::BadFamily,
        io::ErrorKind::OutOfMemory => TransportError::OutOfMemory,
        _ => TransportError::Io(e.to_string()),
    }
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
