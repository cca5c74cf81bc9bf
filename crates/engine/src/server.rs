use std::net::SocketAddr;

use crate::clock::Timestamp;
use crate::conn::ConnId;
use crate::rng::RandomSource;

pub(crate) type ServerId = usize;

/// Point-in-time view of one server's health, as reported by
/// [`Channel::server_info`](crate::Channel::server_info).
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub address: SocketAddr,
    pub consec_failures: u32,
    pub next_retry_time: Option<Timestamp>,
    pub connections: usize,
}

/// One upstream recursive server and its health accounting.
#[derive(Debug)]
pub struct Server {
    pub(crate) address: SocketAddr,
    /// Position in the configured server list; ties in failure count are
    /// broken in favor of the lower priority index.
    pub(crate) priority: usize,
    pub(crate) consec_failures: u32,
    /// While set, the failover policy will not probe this server.
    pub(crate) next_retry_time: Option<Timestamp>,
    /// Open connections, newest first.
    pub(crate) connections: Vec<ConnId>,
    /// The single TCP connection, if one is open.
    pub(crate) tcp_conn: Option<ConnId>,
}

impl Server {
    fn new(address: SocketAddr, priority: usize) -> Self {
        Self {
            address,
            priority,
            consec_failures: 0,
            next_retry_time: None,
            connections: Vec::new(),
            tcp_conn: None,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn consec_failures(&self) -> u32 {
        self.consec_failures
    }

    fn sort_key(&self) -> (u32, usize) {
        (self.consec_failures, self.priority)
    }
}

/// Ranked set of upstream servers.
///
/// `order` is kept sorted by `(consec_failures, priority)`; every mutation
/// of a failure counter goes through [`record_failure`]/[`record_success`]
/// so the ranking can be restored immediately.
///
/// [`record_failure`]: ServerRegistry::record_failure
/// [`record_success`]: ServerRegistry::record_success
#[derive(Debug, Default)]
pub(crate) struct ServerRegistry {
    slots: Vec<Server>,
    order: Vec<ServerId>,
}

impl ServerRegistry {
    pub(crate) fn from_addresses(addresses: &[SocketAddr]) -> Self {
        let slots: Vec<Server> = addresses
            .iter()
            .enumerate()
            .map(|(idx, addr)| Server::new(*addr, idx))
            .collect();
        let order = (0..slots.len()).collect();
        Self { slots, order }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn get(&self, id: ServerId) -> &Server {
        &self.slots[id]
    }

    pub(crate) fn get_mut(&mut self, id: ServerId) -> &mut Server {
        &mut self.slots[id]
    }

    pub(crate) fn first(&self) -> Option<ServerId> {
        self.order.first().copied()
    }

    pub(crate) fn last(&self) -> Option<ServerId> {
        self.order.last().copied()
    }

    /// Server ids in ranked order.
    pub(crate) fn iter_ranked(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.order.iter().copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Server> {
        self.slots.iter()
    }

    fn resort(&mut self) {
        let slots = &self.slots;
        self.order.sort_by_key(|&id| slots[id].sort_key());
    }

    /// Count a failed exchange: bump the failure counter, restore the
    /// ranking, and start the probe-penalty window.
    pub(crate) fn record_failure(&mut self, id: ServerId, now: Timestamp, retry_delay_ms: u64) {
        let server = &mut self.slots[id];
        server.consec_failures += 1;
        server.next_retry_time = Some(now.add_millis(retry_delay_ms));
        self.resort();
    }

    /// Count a successful exchange; returns true if the ranking changed.
    pub(crate) fn record_success(&mut self, id: ServerId) -> bool {
        let server = &mut self.slots[id];
        server.next_retry_time = None;
        if server.consec_failures > 0 {
            server.consec_failures = 0;
            self.resort();
            true
        } else {
            false
        }
    }
}

/// Pick the server for the next dispatch.
///
/// `rotate` draws uniformly. The default failover policy prefers the
/// best-ranked server, but with probability `1/retry_chance` probes the
/// first failed server whose penalty window has elapsed, so a recovered
/// server is not starved until everything else has failed past it.
pub(crate) fn pick_server(
    registry: &ServerRegistry,
    rotate: bool,
    retry_chance: u16,
    now: Timestamp,
    rng: &mut dyn RandomSource,
) -> Option<ServerId> {
    if registry.is_empty() {
        return None;
    }

    if rotate {
        let idx = rng.next_u16() as usize % registry.len();
        return registry.iter_ranked().nth(idx);
    }

    let first = registry.first()?;
    let last = registry.last()?;

    // All healthy: take the ranked head.
    if registry.get(last).consec_failures == 0 {
        return Some(first);
    }

    if retry_chance == 0 {
        return Some(first);
    }

    if rng.next_u16() % retry_chance == 0 {
        for id in registry.iter_ranked() {
            let server = registry.get(id);
            if server.consec_failures == 0 {
                continue;
            }
            let due = match server.next_retry_time {
                None => true,
                Some(t) => now >= t,
            };
            if due {
                return Some(id);
            }
        }
    }

    Some(first)
}
