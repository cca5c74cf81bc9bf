//! Deadline expiry: overdue attempts count against their server and go
//! back through the dispatcher.

use tracing::debug;

use quiver_dns_domain::ResolveError;

use crate::channel::ChannelInner;
use crate::clock::Timestamp;

impl ChannelInner {
    pub(crate) fn process_timeouts(&mut self, now: Timestamp) {
        // Always re-examine the head: every requeue reshapes the deadline
        // index, so a cached "next" entry could be stale.
        while let Some((deadline, qid)) = self.queries.first_deadline() {
            if now < deadline {
                break;
            }

            let conn_info = self
                .queries
                .get(qid)
                .and_then(|q| q.conn)
                .and_then(|conn_id| self.conns.get(conn_id))
                .map(|c| (c.server, c.is_tcp()));

            if let Some(query) = self.queries.get_mut(qid) {
                query.timeouts += 1;
            }
            debug!(qid, "Attempt timed out");

            if let Some((server_id, used_tcp)) = conn_info {
                self.server_failed(server_id, used_tcp, now);
            }
            let _ = self.requeue_query(qid, now, Some(ResolveError::TimedOut), true, None);
        }
    }
}
