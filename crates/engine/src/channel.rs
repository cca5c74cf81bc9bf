use std::sync::{Mutex, MutexGuard, PoisonError};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tracing::{debug, info};

use quiver_dns_domain::{ResolveError, ResolverConfig, ResolverOptions};

use crate::cache::{NoCache, QueryCache};
use crate::clock::Timestamp;
use crate::conn::{ConnId, ConnTable};
use crate::cookie::{CookieEngine, NoCookies};
use crate::message;
use crate::metrics::{Metrics, RttMetrics};
use crate::query::{Query, QueryCallback, QueryOutcome, QueryTable};
use crate::rng::{FastRandom, RandomSource};
use crate::server::{ServerId, ServerRegistry, ServerSnapshot};
use crate::transport::{SocketHandle, SystemTransport, Transport, TransportKind};

/// Largest inbound read the engine will attempt in one call; also the
/// largest framed DNS message.
pub(crate) const MAX_READ: usize = 65535;

pub(crate) struct Completion {
    pub(crate) callback: QueryCallback,
    pub(crate) outcome: QueryOutcome,
}

/// Terminal disposition of a query, handed to [`ChannelInner::end_query`].
pub(crate) enum EndResult {
    Answered(Message),
    /// A failed query may still carry the response that failed it.
    Failed(ResolveError, Option<Message>),
}

/// Optional host callbacks.
///
/// `server_state` and `pending_write` run under the channel lock and must
/// not call back into the channel. `queue_empty` and query completions run
/// after the lock is released and may submit new queries.
#[derive(Default)]
pub(crate) struct Observers {
    pub(crate) server_state: Option<Box<dyn FnMut(&str, bool, TransportKind) + Send>>,
    pub(crate) pending_write: Option<Box<dyn FnMut() + Send>>,
    pub(crate) queue_empty: Option<Box<dyn FnMut() + Send>>,
}

/// A resolver channel: the shared context all queries on one configuration
/// run through.
///
/// The channel is driven by the host's event loop. Each wake-up calls
/// [`tick`] with the sockets that became readable or writable and a
/// freshly sampled [`Timestamp`]; the engine performs every read, retry,
/// timeout, and completion due at that instant and returns.
///
/// [`tick`]: Channel::tick
pub struct Channel {
    inner: Mutex<ChannelInner>,
}

pub struct ChannelBuilder {
    config: ResolverConfig,
    transport: Option<Box<dyn Transport>>,
    cookies: Box<dyn CookieEngine>,
    cache: Box<dyn QueryCache>,
    metrics: Box<dyn Metrics>,
    rng: Box<dyn RandomSource>,
    observers: Observers,
}

impl ChannelBuilder {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            transport: None,
            cookies: Box::new(NoCookies),
            cache: Box::new(NoCache),
            metrics: Box::new(RttMetrics::new()),
            rng: Box::new(FastRandom::new()),
            observers: Observers::default(),
        }
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn cookies(mut self, cookies: impl CookieEngine + 'static) -> Self {
        self.cookies = Box::new(cookies);
        self
    }

    pub fn cache(mut self, cache: impl QueryCache + 'static) -> Self {
        self.cache = Box::new(cache);
        self
    }

    pub fn metrics(mut self, metrics: impl Metrics + 'static) -> Self {
        self.metrics = Box::new(metrics);
        self
    }

    pub fn random(mut self, rng: impl RandomSource + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Observe server health transitions as `(address, success, transport)`.
    pub fn on_server_state(
        mut self,
        cb: impl FnMut(&str, bool, TransportKind) + Send + 'static,
    ) -> Self {
        self.observers.server_state = Some(Box::new(cb));
        self
    }

    /// Defer TCP writes until the host calls
    /// [`Channel::process_pending_write`].
    pub fn on_pending_write(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.observers.pending_write = Some(Box::new(cb));
        self
    }

    /// Invoked whenever the last outstanding query finishes.
    pub fn on_queue_empty(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.observers.queue_empty = Some(Box::new(cb));
        self
    }

    pub fn build(self) -> Channel {
        let servers = ServerRegistry::from_addresses(&self.config.servers);
        info!(
            servers = servers.len(),
            rotate = self.config.options.rotate,
            tries = self.config.options.tries,
            "Resolver channel created"
        );

        Channel {
            inner: Mutex::new(ChannelInner {
                opts: self.config.options,
                servers,
                conns: ConnTable::default(),
                queries: QueryTable::default(),
                transport: self
                    .transport
                    .unwrap_or_else(|| Box::new(SystemTransport::new())),
                cookies: self.cookies,
                cache: self.cache,
                metrics: self.metrics,
                rng: self.rng,
                observers: self.observers,
                notify_pending_write: false,
                completions: Vec::new(),
                pending_empty_check: false,
                read_scratch: vec![0u8; MAX_READ],
            }),
        }
    }
}

impl Channel {
    pub fn builder(config: ResolverConfig) -> ChannelBuilder {
        ChannelBuilder::new(config)
    }

    /// A channel over the default OS socket transport.
    pub fn new(config: ResolverConfig) -> Self {
        ChannelBuilder::new(config).build()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a prepared query message. The transaction id is assigned by
    /// the channel; the callback fires exactly once, possibly before this
    /// call returns (cache hit, no servers).
    pub fn send(&self, message: Message, callback: impl FnOnce(QueryOutcome) + Send + 'static) {
        let now = Timestamp::now();
        self.send_at(message, Box::new(callback), now);
    }

    /// [`send`](Channel::send) with an explicit time source.
    pub fn send_at(&self, message: Message, callback: QueryCallback, now: Timestamp) {
        self.lock().submit(message, callback, now);
        self.deliver_completions();
    }

    /// Build and submit a single-question query (RD set, EDNS0 enabled).
    pub fn query(
        &self,
        domain: &str,
        record_type: RecordType,
        callback: impl FnOnce(QueryOutcome) + Send + 'static,
    ) -> Result<(), ResolveError> {
        let message = message::build_query(domain, record_type, true)?;
        self.send(message, callback);
        Ok(())
    }

    /// Drive the engine: process readable sockets, expire overdue
    /// attempts, flush writable sockets, and reclaim idle connections.
    pub fn tick(&self, read_ready: &[SocketHandle], write_ready: &[SocketHandle], now: Timestamp) {
        {
            let mut inner = self.lock();
            inner.process_read(read_ready, now);
            inner.process_timeouts(now);
            inner.process_write(write_ready, now);
            inner.cleanup_conns(now);
        }
        self.deliver_completions();
    }

    /// Flush the TCP writes deferred through the pending-write observer.
    pub fn process_pending_write(&self, now: Timestamp) {
        {
            let mut inner = self.lock();
            if inner.notify_pending_write {
                // Clear before flushing: a flush failure can enqueue more
                // data and needs to be able to re-arm the notification.
                inner.notify_pending_write = false;
                let targets: Vec<ConnId> =
                    inner.servers.iter().filter_map(|s| s.tcp_conn).collect();
                for conn_id in targets {
                    if let Err(status) = inner.flush_conn(conn_id) {
                        inner.handle_conn_error(conn_id, true, status, now);
                    }
                }
            }
        }
        self.deliver_completions();
    }

    /// Earliest deadline among in-flight queries, for event-loop
    /// scheduling. `None` when nothing is in flight.
    pub fn next_timeout(&self) -> Option<Timestamp> {
        self.lock().queries.first_deadline().map(|(t, _)| t)
    }

    pub fn active_queries(&self) -> usize {
        self.lock().queries.len()
    }

    /// Terminate every outstanding query; callbacks fire with
    /// [`ResolveError::Cancelled`].
    pub fn cancel_all(&self) {
        let now = Timestamp::now();
        {
            let mut inner = self.lock();
            for qid in inner.queries.qids() {
                inner.end_query(
                    qid,
                    None,
                    EndResult::Failed(ResolveError::Cancelled, None),
                    now,
                );
            }
        }
        self.deliver_completions();
    }

    /// Health snapshot of the configured servers, best-ranked first.
    pub fn server_info(&self) -> Vec<ServerSnapshot> {
        let inner = self.lock();
        inner
            .servers
            .iter_ranked()
            .map(|id| {
                let server = inner.servers.get(id);
                ServerSnapshot {
                    address: server.address(),
                    consec_failures: server.consec_failures(),
                    next_retry_time: server.next_retry_time,
                    connections: server.connections.len(),
                }
            })
            .collect()
    }

    /// Run queued completion callbacks outside the lock, then the
    /// queue-empty observer if the table drained. Callbacks may submit new
    /// queries; those re-enter through the public API and queue their own
    /// completions, which the loop picks up.
    fn deliver_completions(&self) {
        loop {
            let batch = {
                let mut inner = self.lock();
                std::mem::take(&mut inner.completions)
            };
            if batch.is_empty() {
                break;
            }
            for completion in batch {
                (completion.callback)(completion.outcome);
            }
        }

        let observer = {
            let mut inner = self.lock();
            if inner.pending_empty_check {
                inner.pending_empty_check = false;
                if inner.queries.is_empty() {
                    inner.observers.queue_empty.take()
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(mut cb) = observer {
            cb();
            let mut inner = self.lock();
            if inner.observers.queue_empty.is_none() {
                inner.observers.queue_empty = Some(cb);
            }
        }
    }
}

pub(crate) struct ChannelInner {
    pub(crate) opts: ResolverOptions,
    pub(crate) servers: ServerRegistry,
    pub(crate) conns: ConnTable,
    pub(crate) queries: QueryTable,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) cookies: Box<dyn CookieEngine>,
    pub(crate) cache: Box<dyn QueryCache>,
    pub(crate) metrics: Box<dyn Metrics>,
    pub(crate) rng: Box<dyn RandomSource>,
    pub(crate) observers: Observers,
    pub(crate) notify_pending_write: bool,
    pub(crate) completions: Vec<Completion>,
    /// Set when a query ends; tells the delivery pass to consider the
    /// queue-empty observer.
    pub(crate) pending_empty_check: bool,
    pub(crate) read_scratch: Vec<u8>,
}

impl ChannelInner {
    fn submit(&mut self, mut message: Message, callback: QueryCallback, now: Timestamp) {
        if let Some(response) = self.cache.lookup(now, &message) {
            debug!("Query answered from cache");
            self.completions.push(Completion {
                callback,
                outcome: QueryOutcome::Answer {
                    response,
                    timeouts: 0,
                },
            });
            self.pending_empty_check = true;
            return;
        }

        if self.queries.len() > u16::MAX as usize {
            self.completions.push(Completion {
                callback,
                outcome: QueryOutcome::Failed {
                    error: ResolveError::OutOfMemory,
                    response: None,
                    timeouts: 0,
                },
            });
            self.pending_empty_check = true;
            return;
        }

        // Transaction ids must be unique across live queries; redraw on
        // collision.
        let qid = loop {
            let candidate = self.rng.next_u16();
            if !self.queries.contains(candidate) {
                break candidate;
            }
        };
        message.set_id(qid);

        if self.opts.dns0x20 {
            message::randomize_question_case(&mut message, self.rng.as_mut());
        }

        let query = Query::new(qid, message, self.opts.use_tcp, callback);
        self.queries.insert(query);
        debug!(qid, "Query submitted");
        let _ = self.send_query(qid, now);
    }

    /// Bind a query to a connection and schedule its deadline. All three
    /// index views change together.
    pub(crate) fn attach_query(&mut self, qid: u16, conn_id: ConnId, deadline: Timestamp) {
        if let Some(conn) = self.conns.get_mut(conn_id) {
            conn.queries.push_back(qid);
        }
        self.queries.set_deadline(qid, deadline);
        if let Some(query) = self.queries.get_mut(qid) {
            query.conn = Some(conn_id);
        }
    }

    /// Undo [`attach_query`](Self::attach_query). Detaching a query that
    /// is not attached is a no-op.
    pub(crate) fn detach_query(&mut self, qid: u16) {
        let Some(query) = self.queries.get_mut(qid) else {
            return;
        };
        let conn_id = query.conn.take();
        self.queries.clear_deadline(qid);
        if let Some(conn_id) = conn_id {
            if let Some(conn) = self.conns.get_mut(conn_id) {
                conn.detach(qid);
            }
        }
    }

    /// Finish a query: record metrics, release it from every index, and
    /// queue the completion for delivery after the lock is dropped.
    pub(crate) fn end_query(
        &mut self,
        qid: u16,
        server: Option<ServerId>,
        result: EndResult,
        now: Timestamp,
    ) {
        self.detach_query(qid);
        let Some(mut query) = self.queries.remove(qid) else {
            return;
        };

        let (error, response) = match result {
            EndResult::Answered(response) => (None, Some(response)),
            EndResult::Failed(error, response) => (Some(error), response),
        };

        let latency = match (&error, query.sent_at) {
            (None, Some(sent)) => Some(now.millis_since(sent)),
            _ => None,
        };
        let server_ref = server.map(|id| self.servers.get(id));
        self.metrics.record(server_ref, error.as_ref(), latency);

        let timeouts = query.timeouts;
        if let Some(callback) = query.callback.take() {
            let outcome = match (error, response) {
                (None, Some(response)) => QueryOutcome::Answer { response, timeouts },
                (Some(error), response) => QueryOutcome::Failed {
                    error,
                    response,
                    timeouts,
                },
                // An answered query always carries its response.
                (None, None) => QueryOutcome::Failed {
                    error: ResolveError::BadResponse,
                    response: None,
                    timeouts,
                },
            };
            self.completions.push(Completion { callback, outcome });
        }
        self.pending_empty_check = true;
    }

    /// Count a failed exchange against a server and tell the observer.
    pub(crate) fn server_failed(&mut self, server: ServerId, used_tcp: bool, now: Timestamp) {
        let delay = self.opts.server_retry_delay_ms;
        self.servers.record_failure(server, now, delay);
        let kind = transport_of(used_tcp);
        debug!(
            server = %self.servers.get(server).address(),
            failures = self.servers.get(server).consec_failures(),
            transport = kind.as_str(),
            "Server exchange failed"
        );
        self.emit_server_state(server, false, kind);
    }

    /// Count a successful exchange and tell the observer.
    pub(crate) fn server_ok(&mut self, server: ServerId, used_tcp: bool) {
        self.servers.record_success(server);
        self.emit_server_state(server, true, transport_of(used_tcp));
    }

    fn emit_server_state(&mut self, server: ServerId, success: bool, kind: TransportKind) {
        if self.observers.server_state.is_none() {
            return;
        }
        let address = self.servers.get(server).address().to_string();
        if let Some(cb) = self.observers.server_state.as_mut() {
            cb(&address, success, kind);
        }
    }
}

fn transport_of(used_tcp: bool) -> TransportKind {
    if used_tcp {
        TransportKind::Tcp
    } else {
        TransportKind::Udp
    }
}
