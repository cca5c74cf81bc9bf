//! Dispatch and retry: placing a query on a server connection, computing
//! its deadline, and feeding failed attempts back through the retry
//! budget.

use hickory_proto::op::Message;
use tracing::debug;

use quiver_dns_domain::ResolveError;

use crate::channel::{ChannelInner, EndResult};
use crate::clock::Timestamp;
use crate::conn::{ConnId, Connection};
use crate::message;
use crate::server::{pick_server, ServerId};
use crate::transport::{TransportError, TransportKind};

impl ChannelInner {
    /// Place a query on some server's connection. On success the query is
    /// attached with a fresh deadline; on failure it has been requeued or
    /// ended, and the returned error describes why this attempt failed.
    pub(crate) fn send_query(&mut self, qid: u16, now: Timestamp) -> Result<(), ResolveError> {
        let Some(server_id) = pick_server(
            &self.servers,
            self.opts.rotate,
            self.opts.server_retry_chance,
            now,
            self.rng.as_mut(),
        ) else {
            self.end_query(
                qid,
                None,
                EndResult::Failed(ResolveError::NoServers, None),
                now,
            );
            return Err(ResolveError::NoServers);
        };

        let using_tcp = self
            .queries
            .get(qid)
            .map(|q| q.using_tcp)
            .unwrap_or(false);

        let conn_id = match self.fetch_connection(server_id, using_tcp) {
            Some(id) => id,
            None => match self.open_connection(server_id, using_tcp) {
                Ok(id) => id,
                Err(status) if status.is_server_specific() => {
                    self.server_failed(server_id, using_tcp, now);
                    return self.requeue_query(qid, now, Some(status), true, None);
                }
                Err(status) => {
                    self.end_query(
                        qid,
                        Some(server_id),
                        EndResult::Failed(status.clone(), None),
                        now,
                    );
                    return Err(status);
                }
            },
        };

        match self.conn_query_write(conn_id, qid, now) {
            Ok(()) => {}
            Err(status @ ResolveError::OutOfMemory) => {
                // The connection is fine; only this query dies.
                self.end_query(
                    qid,
                    Some(server_id),
                    EndResult::Failed(status.clone(), None),
                    now,
                );
                return Err(status);
            }
            Err(status) if status.is_server_specific() => {
                self.handle_conn_error(conn_id, true, status.clone(), now);
                return match self.requeue_query(qid, now, Some(status), true, None) {
                    // Exhaustion here is better described by what broke.
                    Err(ResolveError::TimedOut) => Err(ResolveError::ConnRefused),
                    other => other,
                };
            }
            Err(status) => {
                self.server_failed(server_id, using_tcp, now);
                return self.requeue_query(qid, now, Some(status), true, None);
            }
        }

        let timeplus = self.calc_query_timeout(qid, server_id, now);
        let deadline = now.add_millis(timeplus);
        self.detach_query(qid);
        self.attach_query(qid, conn_id, deadline);
        if let Some(query) = self.queries.get_mut(qid) {
            query.sent_at = Some(now);
        }
        if let Some(conn) = self.conns.get_mut(conn_id) {
            conn.total_queries += 1;
        }
        debug!(
            qid,
            server = %self.servers.get(server_id).address(),
            tcp = using_tcp,
            timeout_ms = timeplus,
            "Query dispatched"
        );
        Ok(())
    }

    /// Put a query back through dispatch, or surface its sticky error once
    /// the retry budget is spent. `Err(TimedOut)` means the query ended.
    pub(crate) fn requeue_query(
        &mut self,
        qid: u16,
        now: Timestamp,
        status: Option<ResolveError>,
        inc_try: bool,
        response: Option<&Message>,
    ) -> Result<(), ResolveError> {
        self.detach_query(qid);

        let max_tries = self.servers.len() * self.opts.tries;
        let Some(query) = self.queries.get_mut(qid) else {
            return Ok(());
        };
        if let Some(status) = status {
            query.error = Some(status);
        }
        if inc_try {
            query.try_count += 1;
        }

        if query.try_count < max_tries && !query.no_retries {
            return self.send_query(qid, now);
        }

        let error = query.error.clone().unwrap_or(ResolveError::TimedOut);
        debug!(qid, error = %error, tries = query.try_count, "Retry budget exhausted");
        self.end_query(
            qid,
            None,
            EndResult::Failed(error, response.cloned()),
            now,
        );
        Err(ResolveError::TimedOut)
    }

    /// Reusable connection on `server` for the requested transport, if one
    /// exists and is still serviceable.
    pub(crate) fn fetch_connection(&self, server_id: ServerId, using_tcp: bool) -> Option<ConnId> {
        let server = self.servers.get(server_id);
        if using_tcp {
            return server.tcp_conn.filter(|id| self.conns.contains(*id));
        }

        let first = *server.connections.first()?;
        let conn = self.conns.get(first)?;
        if conn.is_tcp() {
            return None;
        }
        let cap = self.opts.udp_max_queries;
        if cap > 0 && conn.total_queries >= cap {
            return None;
        }
        Some(first)
    }

    pub(crate) fn open_connection(
        &mut self,
        server_id: ServerId,
        using_tcp: bool,
    ) -> Result<ConnId, ResolveError> {
        let address = self.servers.get(server_id).address();
        let kind = if using_tcp {
            TransportKind::Tcp
        } else {
            TransportKind::Udp
        };

        let opened = self.transport.open(address, kind).map_err(open_error)?;
        let id = self.conns.allocate_id();
        self.conns
            .insert(Connection::new(id, server_id, kind, opened));

        let server = self.servers.get_mut(server_id);
        server.connections.insert(0, id);
        if kind == TransportKind::Tcp {
            server.tcp_conn = Some(id);
        }
        debug!(server = %address, kind = kind.as_str(), "Connection opened");
        Ok(id)
    }

    /// Serialize the query onto the connection's outbound buffer and flush
    /// unless the write must wait (unconnected TCP, or the host asked for
    /// deferred writes).
    pub(crate) fn conn_query_write(
        &mut self,
        conn_id: ConnId,
        qid: u16,
        now: Timestamp,
    ) -> Result<(), ResolveError> {
        {
            let Some(conn) = self.conns.get(conn_id) else {
                return Err(ResolveError::ConnRefused);
            };
            let Some(query) = self.queries.get_mut(qid) else {
                return Err(ResolveError::Cancelled);
            };
            self.cookies.apply(&mut query.message, conn, now)?;
        }
        {
            let Some(query) = self.queries.get(qid) else {
                return Err(ResolveError::Cancelled);
            };
            let Some(conn) = self.conns.get_mut(conn_id) else {
                return Err(ResolveError::ConnRefused);
            };
            message::write_framed(&query.message, &mut conn.out_buf)?;
        }

        let (is_tcp, connected, tfo_initial) = {
            let Some(conn) = self.conns.get(conn_id) else {
                return Err(ResolveError::ConnRefused);
            };
            (conn.is_tcp(), conn.connected, conn.tfo_initial)
        };

        // TCP handshake still in flight: the data goes out when the host
        // reports the socket writable.
        if is_tcp && !connected && !tfo_initial {
            return Ok(());
        }

        if is_tcp && self.observers.pending_write.is_some() {
            let first = !self.notify_pending_write;
            self.notify_pending_write = true;
            if first {
                if let Some(cb) = self.observers.pending_write.as_mut() {
                    cb();
                }
            }
            return Ok(());
        }

        self.flush_conn(conn_id)
    }

    /// Deadline for the next attempt: the metric-provided base, doubled
    /// for every full trip through the server list, capped, then jittered
    /// downward into `[tp/2, tp]` so synchronized clients don't retry in
    /// lockstep.
    pub(crate) fn calc_query_timeout(
        &mut self,
        qid: u16,
        server_id: ServerId,
        now: Timestamp,
    ) -> u64 {
        let base = {
            let server = self.servers.get(server_id);
            self.metrics
                .server_timeout(server, now, self.opts.base_timeout_ms)
        };

        let num_servers = self.servers.len().max(1);
        let try_count = self.queries.get(qid).map(|q| q.try_count).unwrap_or(0);
        let rounds = (try_count / num_servers) as u32;

        let mut timeplus = base.checked_shl(rounds.min(32)).unwrap_or(u64::MAX);

        if self.opts.max_timeout_ms > 0 && timeplus > self.opts.max_timeout_ms {
            timeplus = self.opts.max_timeout_ms;
        }

        if rounds > 0 {
            let r = self.rng.next_u16();
            let delta = (r as f32 / u16::MAX as f32) * 0.5;
            timeplus -= (timeplus as f32 * delta) as u64;
        }

        if timeplus < base {
            timeplus = base;
        }
        timeplus
    }
}

fn open_error(e: TransportError) -> ResolveError {
    match e {
        TransportError::Refused | TransportError::Closed => ResolveError::ConnRefused,
        TransportError::BadFamily => ResolveError::BadFamily,
        TransportError::OutOfMemory => ResolveError::OutOfMemory,
        TransportError::WouldBlock => ResolveError::Io("open returned WouldBlock".into()),
        TransportError::Io(s) => ResolveError::Io(s),
    }
}
