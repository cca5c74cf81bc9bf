//! Shared test harness: a fully scripted transport, deterministic
//! randomness, and DNS message builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{RData, Record, RecordType};

use quiver_dns_engine::{
    build_query, Channel, ChannelBuilder, OpenedSocket, QueryOutcome, RandomSource,
    ResolverConfig, SocketHandle, Timestamp, Transport, TransportError, TransportKind,
};

pub fn t(ms: u64) -> Timestamp {
    Timestamp::from_millis(ms)
}

pub fn test_config(servers: usize) -> ResolverConfig {
    let servers = (0..servers)
        .map(|i| format!("198.51.100.{}:53", i + 1).parse().unwrap())
        .collect();
    ResolverConfig::with_servers(servers)
}

pub fn server_addr(i: usize) -> SocketAddr {
    format!("198.51.100.{}:53", i + 1).parse().unwrap()
}

/// RNG producing 0, 1, 2, ... per byte: transaction ids are predictable
/// and retry jitter collapses to a fixed value.
pub struct CountingRng(pub u8);

impl RandomSource for CountingRng {
    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.0;
            self.0 = self.0.wrapping_add(1);
        }
    }
}

/// RNG that always draws zero: no retry jitter, qid 0.
pub struct ZeroRng;

impl RandomSource for ZeroRng {
    fn fill(&mut self, buf: &mut [u8]) {
        buf.fill(0);
    }
}

pub struct MockSock {
    pub server: SocketAddr,
    pub kind: Option<TransportKind>,
    /// Payload of every `write` call, in order. For UDP each entry is one
    /// datagram (no length prefix); for TCP each entry is a stream chunk.
    pub writes: Vec<Vec<u8>>,
    /// Scripted reads, one entry per `read` call.
    pub rx: VecDeque<Vec<u8>>,
    /// Returned once after `rx` drains, instead of `WouldBlock`.
    pub rx_error: Option<TransportError>,
    pub closed: bool,
}

impl Default for MockSock {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([0, 0, 0, 0], 0)),
            kind: None,
            writes: Vec::new(),
            rx: VecDeque::new(),
            rx_error: None,
            closed: false,
        }
    }
}

pub struct MockState {
    pub socks: HashMap<u64, MockSock>,
    /// `(address, kind)` per successful open, in order.
    pub opens: Vec<(SocketAddr, TransportKind)>,
    /// Scripted failures consumed by upcoming `open` calls.
    pub open_failures: VecDeque<TransportError>,
    /// When false, opened TCP sockets report a handshake in flight.
    pub tcp_connects_immediately: bool,
    next_handle: u64,
}

impl MockState {
    pub fn handle_for(&self, address: SocketAddr, kind: TransportKind) -> SocketHandle {
        let (id, _) = self
            .socks
            .iter()
            .find(|(_, s)| s.server == address && s.kind == Some(kind) && !s.closed)
            .expect("no live socket for server");
        SocketHandle(*id)
    }

    pub fn sock(&self, handle: SocketHandle) -> &MockSock {
        &self.socks[&handle.0]
    }

    /// All message payloads written toward `address`, stripped of TCP
    /// framing, parsed. Includes closed sockets.
    pub fn sent_messages(&self, address: SocketAddr) -> Vec<Message> {
        let mut ids: Vec<&u64> = self
            .socks
            .iter()
            .filter(|(_, s)| s.server == address)
            .map(|(id, _)| id)
            .collect();
        ids.sort();

        let mut messages = Vec::new();
        for id in ids {
            let sock = &self.socks[id];
            match sock.kind {
                Some(TransportKind::Udp) => {
                    for w in &sock.writes {
                        messages.push(Message::from_vec(w).expect("datagram parses"));
                    }
                }
                Some(TransportKind::Tcp) => {
                    // Reassemble the stream, then split frames.
                    let stream: Vec<u8> = sock.writes.iter().flatten().copied().collect();
                    let mut rest = &stream[..];
                    while rest.len() >= 2 {
                        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                        messages.push(Message::from_vec(&rest[2..2 + len]).expect("frame parses"));
                        rest = &rest[2 + len..];
                    }
                }
                None => {}
            }
        }
        messages
    }

    /// Queue an inbound datagram on a UDP socket.
    pub fn inject_udp(&mut self, handle: SocketHandle, message: &Message) {
        let sock = self.socks.get_mut(&handle.0).expect("socket");
        sock.rx.push_back(message.to_vec().unwrap());
    }

    /// Queue inbound stream bytes (length-prefixed) on a TCP socket.
    pub fn inject_tcp(&mut self, handle: SocketHandle, message: &Message) {
        let wire = message.to_vec().unwrap();
        let mut framed = (wire.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&wire);
        let sock = self.socks.get_mut(&handle.0).expect("socket");
        sock.rx.push_back(framed);
    }
}

pub struct MockTransport(pub Arc<Mutex<MockState>>);

pub fn mock_transport() -> (MockTransport, Arc<Mutex<MockState>>) {
    let state = Arc::new(Mutex::new(MockState {
        socks: HashMap::new(),
        opens: Vec::new(),
        open_failures: VecDeque::new(),
        tcp_connects_immediately: true,
        next_handle: 1,
    }));
    (MockTransport(Arc::clone(&state)), state)
}

impl Transport for MockTransport {
    fn open(
        &mut self,
        server: SocketAddr,
        kind: TransportKind,
    ) -> Result<OpenedSocket, TransportError> {
        let mut state = self.0.lock().unwrap();
        if let Some(err) = state.open_failures.pop_front() {
            return Err(err);
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.opens.push((server, kind));
        state.socks.insert(
            handle,
            MockSock {
                server,
                kind: Some(kind),
                ..MockSock::default()
            },
        );
        let connected = kind == TransportKind::Udp || state.tcp_connects_immediately;
        Ok(OpenedSocket {
            handle: SocketHandle(handle),
            connected,
            tfo_initial: false,
        })
    }

    fn read(&mut self, socket: SocketHandle, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.0.lock().unwrap();
        let sock = state.socks.get_mut(&socket.0).ok_or(TransportError::Closed)?;
        if sock.closed {
            return Err(TransportError::Closed);
        }
        match sock.rx.pop_front() {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => match sock.rx_error.take() {
                Some(err) => Err(err),
                None => Err(TransportError::WouldBlock),
            },
        }
    }

    fn write(&mut self, socket: SocketHandle, buf: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.0.lock().unwrap();
        let sock = state.socks.get_mut(&socket.0).ok_or(TransportError::Closed)?;
        if sock.closed {
            return Err(TransportError::Closed);
        }
        sock.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&mut self, socket: SocketHandle) {
        let mut state = self.0.lock().unwrap();
        if let Some(sock) = state.socks.get_mut(&socket.0) {
            sock.closed = true;
        }
    }
}

/// Channel over the mock transport with predictable randomness.
pub fn test_channel(
    config: ResolverConfig,
) -> (Channel, Arc<Mutex<MockState>>, Arc<Mutex<Vec<QueryOutcome>>>) {
    let (transport, state) = mock_transport();
    let channel = ChannelBuilder::new(config)
        .transport(transport)
        .random(CountingRng(0))
        .build();
    (channel, state, Arc::new(Mutex::new(Vec::new())))
}

/// Callback that appends its outcome to `results`.
pub fn recorder(
    results: &Arc<Mutex<Vec<QueryOutcome>>>,
) -> Box<dyn FnOnce(QueryOutcome) + Send + 'static> {
    let results = Arc::clone(results);
    Box::new(move |outcome| results.lock().unwrap().push(outcome))
}

pub fn a_query(domain: &str) -> Message {
    build_query(domain, RecordType::A, false).unwrap()
}

pub fn edns_query(domain: &str) -> Message {
    build_query(domain, RecordType::A, true).unwrap()
}

/// A NOERROR response echoing the query's id and questions.
pub fn response_for(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(true);
    response.set_recursion_available(true);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

pub fn with_a_record(mut response: Message) -> Message {
    let name = response.queries()[0].name().clone();
    response.add_answer(Record::from_rdata(
        name,
        300,
        RData::A(Ipv4Addr::new(192, 0, 2, 17).into()),
    ));
    response
}

pub fn with_rcode(mut response: Message, rcode: ResponseCode) -> Message {
    response.set_response_code(rcode);
    response
}

pub fn truncated(mut response: Message) -> Message {
    response.set_truncated(true);
    response
}
