use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Static configuration for a resolver channel.
///
/// Servers are ranked by their position in `servers`: earlier entries are
/// preferred when their failure counts are equal.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    /// Upstream recursive servers, in priority order (e.g. "9.9.9.9:53").
    #[serde(default)]
    pub servers: Vec<SocketAddr>,

    #[serde(default)]
    pub options: ResolverOptions,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: vec![],
            options: ResolverOptions::default(),
        }
    }
}

impl ResolverConfig {
    pub fn with_servers(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers,
            options: ResolverOptions::default(),
        }
    }
}

/// Tunables governing retries, timeouts, and transport behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverOptions {
    /// Pick a random server for every dispatch instead of the ranked
    /// failover policy.
    #[serde(default)]
    pub rotate: bool,

    /// Attempts per server before a query is surfaced as failed.
    #[serde(default = "default_tries")]
    pub tries: usize,

    /// A failed server is probed again with probability
    /// `1/server_retry_chance` per dispatch. 0 disables probing.
    #[serde(default = "default_server_retry_chance")]
    pub server_retry_chance: u16,

    /// Penalty window after a failure during which a server is not probed.
    #[serde(default = "default_server_retry_delay_ms")]
    pub server_retry_delay_ms: u64,

    /// First-attempt timeout; later attempts scale it up.
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,

    /// Upper bound on any single attempt's timeout. 0 = unbounded.
    #[serde(default)]
    pub max_timeout_ms: u64,

    /// Retire a UDP connection after this many queries. 0 = unbounded.
    #[serde(default)]
    pub udp_max_queries: u32,

    /// Accept truncated UDP responses instead of upgrading to TCP.
    #[serde(default)]
    pub ignore_truncation: bool,

    /// Hand SERVFAIL/NOTIMP/REFUSED responses to the caller instead of
    /// retrying them against another server.
    #[serde(default)]
    pub no_check_response: bool,

    /// Randomize question-name letter case and require the server to echo
    /// it verbatim (spoofing mitigation, UDP only).
    #[serde(default)]
    pub dns0x20: bool,

    /// Start every query over TCP.
    #[serde(default)]
    pub use_tcp: bool,

    /// Keep idle connections open between bursts of queries.
    #[serde(default)]
    pub stay_open: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            rotate: false,
            tries: default_tries(),
            server_retry_chance: default_server_retry_chance(),
            server_retry_delay_ms: default_server_retry_delay_ms(),
            base_timeout_ms: default_base_timeout_ms(),
            max_timeout_ms: 0,
            udp_max_queries: 0,
            ignore_truncation: false,
            no_check_response: false,
            dns0x20: false,
            use_tcp: false,
            stay_open: false,
        }
    }
}

fn default_tries() -> usize {
    3
}

fn default_server_retry_chance() -> u16 {
    10
}

fn default_server_retry_delay_ms() -> u64 {
    5000
}

fn default_base_timeout_ms() -> u64 {
    2000
}
