//! Inbound path: pull bytes off readable sockets, frame them as DNS
//! messages, and hand each frame to the answer handler.
//!
//! Both transports converge on one framing: every message in a
//! connection's inbound buffer is preceded by a two-byte length. TCP
//! carries that prefix on the wire; UDP gets one synthesized per datagram.

use bytes::{Buf, BufMut};
use tracing::trace;

use quiver_dns_domain::ResolveError;

use crate::channel::ChannelInner;
use crate::clock::Timestamp;
use crate::conn::ConnId;
use crate::transport::{SocketHandle, TransportError};

impl ChannelInner {
    pub(crate) fn process_read(&mut self, ready: &[SocketHandle], now: Timestamp) {
        for &handle in ready {
            let Some(conn_id) = self.conns.for_socket(handle) else {
                continue;
            };
            self.read_conn(conn_id, now);
        }
    }

    pub(crate) fn read_conn(&mut self, conn_id: ConnId, now: Timestamp) {
        let read_status = self.read_conn_packets(conn_id);
        // Frames that arrived before a failure still get processed; a
        // response followed by a disconnect completes its query.
        self.read_answers(conn_id, now);
        if let Err(status) = read_status {
            if self.conns.contains(conn_id) {
                self.handle_conn_error(conn_id, true, status, now);
            }
        }
    }

    /// Read until the socket would block, the transport forbids greedy
    /// reads, or a TCP read comes back short (nothing more is pending).
    fn read_conn_packets(&mut self, conn_id: ConnId) -> Result<(), ResolveError> {
        loop {
            let (socket, is_udp) = match self.conns.get(conn_id) {
                Some(c) => (c.socket, !c.is_tcp()),
                None => return Ok(()),
            };

            let n = match self.transport.read(socket, &mut self.read_scratch) {
                Ok(n) => n,
                Err(TransportError::WouldBlock) => return Ok(()),
                Err(_) => return Err(ResolveError::ConnRefused),
            };

            let scratch_len = self.read_scratch.len();
            let Some(conn) = self.conns.get_mut(conn_id) else {
                return Ok(());
            };
            if is_udp {
                conn.in_buf.reserve(2 + n);
                conn.in_buf.put_u16(n as u16);
            }
            conn.in_buf.extend_from_slice(&self.read_scratch[..n]);
            trace!(conn = conn_id, bytes = n, "Read");

            let read_again = self.transport.read_to_exhaustion() && (is_udp || n == scratch_len);
            if !read_again {
                return Ok(());
            }
        }
    }

    /// Dispatch every complete frame in the inbound buffer. A processing
    /// failure tears the connection down; stale or mismatched responses
    /// are dropped without consequence.
    fn read_answers(&mut self, conn_id: ConnId, now: Timestamp) {
        loop {
            let frame: Option<Vec<u8>> = {
                let Some(conn) = self.conns.get_mut(conn_id) else {
                    return;
                };
                if conn.in_buf.len() < 2 {
                    None
                } else {
                    let len = u16::from_be_bytes([conn.in_buf[0], conn.in_buf[1]]) as usize;
                    if conn.in_buf.len() < 2 + len {
                        None
                    } else {
                        conn.in_buf.advance(2);
                        Some(conn.in_buf.split_to(len).to_vec())
                    }
                }
            };
            let Some(data) = frame else {
                return;
            };

            if let Err(status) = self.process_answer(&data, conn_id, now) {
                self.handle_conn_error(conn_id, true, status, now);
                return;
            }
        }
    }
}
