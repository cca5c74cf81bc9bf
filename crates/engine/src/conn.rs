use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use rustc_hash::FxHashMap;
use tracing::debug;

use quiver_dns_domain::ResolveError;

use crate::channel::ChannelInner;
use crate::clock::Timestamp;
use crate::server::ServerId;
use crate::transport::{
    OpenedSocket, SocketHandle, Transport, TransportError, TransportKind,
};

pub(crate) type ConnId = u64;

/// One open socket toward one server, with its I/O buffers and the FIFO of
/// queries currently in flight on it.
#[derive(Debug)]
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) server: ServerId,
    pub(crate) kind: TransportKind,
    pub(crate) socket: SocketHandle,
    pub(crate) connected: bool,
    pub(crate) tfo_initial: bool,
    /// Inbound bytes, always framed as length-prefixed DNS messages. UDP
    /// reads synthesize the prefix; TCP reads carry it on the wire.
    pub(crate) in_buf: BytesMut,
    /// Outbound bytes, length-prefixed DNS messages awaiting flush.
    pub(crate) out_buf: BytesMut,
    /// Lifetime count of queries written to this connection.
    pub(crate) total_queries: u32,
    /// Transaction ids attached to this connection, oldest first.
    pub(crate) queries: VecDeque<u16>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, server: ServerId, kind: TransportKind, opened: OpenedSocket) -> Self {
        Self {
            id,
            server,
            kind,
            socket: opened.handle,
            connected: opened.connected,
            tfo_initial: opened.tfo_initial,
            in_buf: BytesMut::new(),
            out_buf: BytesMut::new(),
            total_queries: 0,
            queries: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn total_queries(&self) -> u32 {
        self.total_queries
    }

    pub(crate) fn is_tcp(&self) -> bool {
        self.kind == TransportKind::Tcp
    }

    pub(crate) fn detach(&mut self, qid: u16) {
        if let Some(pos) = self.queries.iter().position(|&q| q == qid) {
            self.queries.remove(pos);
        }
    }

    /// A connection is reclaimable once nothing references it: no queries
    /// in flight and no bytes waiting in either direction.
    pub(crate) fn is_idle(&self) -> bool {
        self.queries.is_empty() && self.out_buf.is_empty() && self.in_buf.is_empty()
    }
}

/// All live connections, addressable by id and by socket handle.
#[derive(Debug, Default)]
pub(crate) struct ConnTable {
    map: FxHashMap<ConnId, Connection>,
    by_socket: FxHashMap<SocketHandle, ConnId>,
    next_id: ConnId,
}

impl ConnTable {
    pub(crate) fn allocate_id(&mut self) -> ConnId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn insert(&mut self, conn: Connection) {
        self.by_socket.insert(conn.socket, conn.id);
        self.map.insert(conn.id, conn);
    }

    pub(crate) fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let conn = self.map.remove(&id)?;
        self.by_socket.remove(&conn.socket);
        Some(conn)
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<&Connection> {
        self.map.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.map.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: ConnId) -> bool {
        self.map.contains_key(&id)
    }

    pub(crate) fn for_socket(&self, socket: SocketHandle) -> Option<ConnId> {
        self.by_socket.get(&socket).copied()
    }

    pub(crate) fn ids(&self) -> Vec<ConnId> {
        self.map.keys().copied().collect()
    }
}

impl ChannelInner {
    /// Drain a connection's outbound buffer as far as the transport will
    /// take it. UDP sends one datagram per buffered frame (prefix
    /// stripped); TCP streams the buffer as-is.
    pub(crate) fn flush_conn(&mut self, conn_id: ConnId) -> Result<(), ResolveError> {
        let (socket, kind, connected, tfo_initial) = match self.conns.get(conn_id) {
            Some(c) => (c.socket, c.kind, c.connected, c.tfo_initial),
            None => return Ok(()),
        };
        if kind == TransportKind::Tcp && !connected && !tfo_initial {
            return Ok(());
        }

        let mut buf = match self.conns.get_mut(conn_id) {
            Some(c) => std::mem::take(&mut c.out_buf),
            None => return Ok(()),
        };
        let result = match kind {
            TransportKind::Udp => flush_datagrams(self.transport.as_mut(), socket, &mut buf),
            TransportKind::Tcp => flush_stream(self.transport.as_mut(), socket, &mut buf),
        };
        if let Some(c) = self.conns.get_mut(conn_id) {
            c.out_buf = buf;
        }
        result
    }

    /// Mark connections the host reported writable as connected and flush
    /// their pending bytes.
    pub(crate) fn process_write(&mut self, ready: &[SocketHandle], now: Timestamp) {
        for &handle in ready {
            let Some(conn_id) = self.conns.for_socket(handle) else {
                continue;
            };
            if let Some(conn) = self.conns.get_mut(conn_id) {
                if !conn.tfo_initial {
                    conn.connected = true;
                }
            }
            if let Err(status) = self.flush_conn(conn_id) {
                self.handle_conn_error(conn_id, true, status, now);
            }
        }
    }

    /// A connection broke. Penalize the server when the failure says
    /// something about it, then close; closing requeues every query that
    /// was in flight on the connection.
    pub(crate) fn handle_conn_error(
        &mut self,
        conn_id: ConnId,
        critical: bool,
        status: ResolveError,
        now: Timestamp,
    ) {
        let Some((server_id, used_tcp)) = self.conns.get(conn_id).map(|c| (c.server, c.is_tcp()))
        else {
            return;
        };
        // Penalize before requeueing so the retry lands elsewhere.
        if critical {
            self.server_failed(server_id, used_tcp, now);
        }
        self.close_connection(conn_id, Some(status), now);
    }

    /// Close a connection and route every attached query back through the
    /// dispatcher with `requeue_status`.
    pub(crate) fn close_connection(
        &mut self,
        conn_id: ConnId,
        requeue_status: Option<ResolveError>,
        now: Timestamp,
    ) {
        let Some(conn) = self.conns.remove(conn_id) else {
            return;
        };
        let server = self.servers.get_mut(conn.server);
        server.connections.retain(|&id| id != conn_id);
        if server.tcp_conn == Some(conn_id) {
            server.tcp_conn = None;
        }
        self.transport.close(conn.socket);
        debug!(
            server = %self.servers.get(conn.server).address(),
            kind = conn.kind.as_str(),
            in_flight = conn.queries.len(),
            "Connection closed"
        );

        for qid in conn.queries.iter().copied() {
            // The connection is already gone; clear the back-reference by
            // hand before requeueing.
            if let Some(query) = self.queries.get_mut(qid) {
                query.conn = None;
            }
            self.queries.clear_deadline(qid);
            let _ = self.requeue_query(qid, now, requeue_status.clone(), true, None);
        }
    }

    /// Reclaim connections nothing references anymore. A capped-out UDP
    /// connection is always closed; otherwise idle connections survive
    /// only when `stay_open` is configured.
    pub(crate) fn cleanup_conns(&mut self, now: Timestamp) {
        let stay_open = self.opts.stay_open;
        let cap = self.opts.udp_max_queries;

        let mut doomed = Vec::new();
        for id in self.conns.ids() {
            let Some(conn) = self.conns.get(id) else {
                continue;
            };
            if !conn.is_idle() {
                continue;
            }
            let capped =
                conn.kind == TransportKind::Udp && cap > 0 && conn.total_queries >= cap;
            if capped || !stay_open {
                doomed.push(id);
            }
        }
        for id in doomed {
            self.close_connection(id, None, now);
        }
    }
}

fn flush_datagrams(
    transport: &mut dyn Transport,
    socket: SocketHandle,
    buf: &mut BytesMut,
) -> Result<(), ResolveError> {
    while buf.len() >= 2 {
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + len {
            break;
        }
        match transport.write(socket, &buf[2..2 + len]) {
            Ok(_) => buf.advance(2 + len),
            Err(TransportError::WouldBlock) => break,
            Err(e) => return Err(write_error(e)),
        }
    }
    Ok(())
}

fn flush_stream(
    transport: &mut dyn Transport,
    socket: SocketHandle,
    buf: &mut BytesMut,
) -> Result<(), ResolveError> {
    while !buf.is_empty() {
        match transport.write(socket, &buf[..]) {
            Ok(0) => break,
            Ok(n) => buf.advance(n),
            Err(TransportError::WouldBlock) => break,
            Err(e) => return Err(write_error(e)),
        }
    }
    Ok(())
}

fn write_error(e: TransportError) -> ResolveError {
    match e {
        TransportError::Refused | TransportError::Closed => ResolveError::ConnRefused,
        TransportError::BadFamily => ResolveError::BadFamily,
        TransportError::OutOfMemory => ResolveError::OutOfMemory,
        TransportError::WouldBlock => ResolveError::Io("write returned WouldBlock".into()),
        TransportError::Io(s) => ResolveError::Io(s),
    }
}
