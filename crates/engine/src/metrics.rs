use std::net::SocketAddr;

use rustc_hash::FxHashMap;

use quiver_dns_domain::ResolveError;

use crate::clock::Timestamp;
use crate::server::Server;

/// Latency bookkeeping and the per-attempt timeout it feeds back into the
/// dispatcher.
pub trait Metrics: Send {
    /// Base timeout for the next attempt against `server`, in
    /// milliseconds. The dispatcher scales this for later retry rounds.
    fn server_timeout(&self, server: &Server, now: Timestamp, base_ms: u64) -> u64;

    /// Called once per finished query. `latency_ms` is present for
    /// answered queries; `error` for failed ones.
    fn record(
        &mut self,
        server: Option<&Server>,
        error: Option<&ResolveError>,
        latency_ms: Option<u64>,
    );
}

/// Fixed timeouts: every attempt starts from the configured base.
pub struct NoMetrics;

impl Metrics for NoMetrics {
    fn server_timeout(&self, _server: &Server, _now: Timestamp, base_ms: u64) -> u64 {
        base_ms
    }

    fn record(
        &mut self,
        _server: Option<&Server>,
        _error: Option<&ResolveError>,
        _latency_ms: Option<u64>,
    ) {
    }
}

/// Smallest timeout an adaptive estimate may produce.
const MIN_ADAPTIVE_TIMEOUT_MS: u64 = 250;

/// Weight of the newest sample in the smoothed RTT.
const SRTT_GAIN: f64 = 0.2;

/// Multiple of the smoothed RTT allowed before an attempt is considered
/// lost.
const SRTT_TIMEOUT_FACTOR: f64 = 5.0;

/// Adaptive per-server timeouts from a smoothed round-trip estimate.
///
/// A server that answers in 12ms gets its next attempt bounded well below
/// the configured base, so a lost packet is retried quickly; a server with
/// no samples yet falls back to the base.
pub struct RttMetrics {
    srtt_ms: FxHashMap<SocketAddr, f64>,
}

impl RttMetrics {
    pub fn new() -> Self {
        Self {
            srtt_ms: FxHashMap::default(),
        }
    }
}

impl Default for RttMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics for RttMetrics {
    fn server_timeout(&self, server: &Server, _now: Timestamp, base_ms: u64) -> u64 {
        match self.srtt_ms.get(&server.address()) {
            None => base_ms,
            Some(srtt) => {
                let adaptive = (srtt * SRTT_TIMEOUT_FACTOR) as u64;
                adaptive.clamp(MIN_ADAPTIVE_TIMEOUT_MS, base_ms.max(MIN_ADAPTIVE_TIMEOUT_MS))
            }
        }
    }

    fn record(
        &mut self,
        server: Option<&Server>,
        error: Option<&ResolveError>,
        latency_ms: Option<u64>,
    ) {
        let (Some(server), None, Some(latency)) = (server, error, latency_ms) else {
            return;
        };
        let sample = latency as f64;
        self.srtt_ms
            .entry(server.address())
            .and_modify(|srtt| *srtt = *srtt * (1.0 - SRTT_GAIN) + sample * SRTT_GAIN)
            .or_insert(sample);
    }
}
