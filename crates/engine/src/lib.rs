//! Event-driven query engine for a DNS stub resolver.
//!
//! The engine multiplexes many concurrent queries over pooled UDP and TCP
//! connections to a ranked set of upstream servers. It owns retries,
//! server failover with probabilistic rehabilitation, per-attempt
//! deadlines, truncation-driven TCP upgrades, and EDNS downgrades; the
//! host supplies the event loop and (optionally) the transport, cache,
//! cookie, and metrics collaborators.
//!
//! ```no_run
//! use quiver_dns_engine::{Channel, ResolverConfig, Timestamp};
//! use hickory_proto::rr::RecordType;
//!
//! let config = ResolverConfig::with_servers(vec!["9.9.9.9:53".parse().unwrap()]);
//! let channel = Channel::new(config);
//! channel.query("example.com", RecordType::A, |outcome| {
//!     println!("resolved: {:?}", outcome);
//! }).unwrap();
//! // ... drive channel.tick(...) from the event loop ...
//! ```

pub mod cache;
pub mod channel;
pub mod clock;
pub mod conn;
pub mod cookie;
pub mod message;
pub mod metrics;
pub mod query;
pub mod rng;
pub mod server;
pub mod transport;

mod answer;
mod dispatch;
mod reader;
mod timeout;

pub use cache::{NoCache, QueryCache};
pub use channel::{Channel, ChannelBuilder};
pub use clock::Timestamp;
pub use conn::Connection;
pub use cookie::{CookieAction, CookieEngine, NoCookies};
pub use message::build_query;
pub use metrics::{Metrics, NoMetrics, RttMetrics};
pub use query::{QueryCallback, QueryOutcome};
pub use rng::{FastRandom, RandomSource};
pub use server::{Server, ServerSnapshot};
pub use transport::{
    OpenedSocket, SocketHandle, SystemTransport, Transport, TransportError, TransportKind,
};

pub use quiver_dns_domain::{ResolveError, ResolverConfig, ResolverOptions};
