//! Response classification: match a parsed message to its query, then
//! accept it, rewrite and resend the query, or push it to another server.

use hickory_proto::op::{Message, ResponseCode};
use tracing::{debug, trace};

use quiver_dns_domain::ResolveError;

use crate::channel::{ChannelInner, EndResult};
use crate::clock::Timestamp;
use crate::conn::ConnId;
use crate::cookie::CookieAction;
use crate::message;

impl ChannelInner {
    /// Handle one inbound message. This never closes the connection
    /// itself; a returned error tells the reader to do so.
    pub(crate) fn process_answer(
        &mut self,
        data: &[u8],
        conn_id: ConnId,
        now: Timestamp,
    ) -> Result<(), ResolveError> {
        // Zero-byte UDP datagrams exist; drop them to the ground.
        if data.is_empty() {
            return Ok(());
        }

        let parsed = match Message::from_vec(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "Unparseable response");
                return Err(ResolveError::BadResponse);
            }
        };
        let qid = parsed.id();

        let Some((server_id, conn_is_udp)) =
            self.conns.get(conn_id).map(|c| (c.server, !c.is_tcp()))
        else {
            return Ok(());
        };

        // The query may have finished or been cancelled already.
        let Some(query) = self.queries.get(qid) else {
            trace!(qid, "Response for unknown transaction; dropped");
            return Ok(());
        };
        let using_tcp = query.using_tcp;

        // Spoof resistance: id match is not enough, the questions must
        // agree too. Case-sensitively when this query's randomized
        // spelling is in force.
        let case_sensitive = self.opts.dns0x20 && !using_tcp;
        if !message::same_questions(&query.message, &parsed, case_sensitive) {
            debug!(qid, "Question mismatch; response dropped");
            return Ok(());
        }

        let action = {
            let Some(conn) = self.conns.get(conn_id) else {
                return Ok(());
            };
            let Some(query) = self.queries.get(qid) else {
                return Ok(());
            };
            self.cookies.validate(&query.message, &parsed, conn, now)
        };
        match action {
            CookieAction::Drop => return Ok(()),
            CookieAction::Resend => {
                self.detach_query(qid);
                let _ = self.send_query(qid, now);
                return Ok(());
            }
            CookieAction::Accept => {}
        }

        // This is our answer; release the connection slot before deciding
        // what the answer means.
        self.detach_query(qid);

        let rcode = parsed.response_code();

        // FORMERR from a server that ignored our OPT record means it does
        // not speak EDNS; strip the extension and ask again.
        if rcode == ResponseCode::FormErr {
            let downgrade = self
                .queries
                .get(qid)
                .map(|q| q.message.extensions().is_some())
                .unwrap_or(false)
                && parsed.extensions().is_none();
            if downgrade {
                if let Some(query) = self.queries.get_mut(qid) {
                    *query.message.extensions_mut() = None;
                }
                debug!(qid, "FORMERR without OPT; retrying without EDNS");
                let _ = self.send_query(qid, now);
                return Ok(());
            }
        }

        // Truncated over UDP: the full answer only fits over TCP.
        if parsed.truncated() && conn_is_udp && !self.opts.ignore_truncation {
            if let Some(query) = self.queries.get_mut(qid) {
                query.using_tcp = true;
            }
            debug!(qid, "Truncated response; upgrading to TCP");
            let _ = self.send_query(qid, now);
            return Ok(());
        }

        // Server-side failures count against the server and go back
        // through dispatch; the connection itself stays healthy.
        if !self.opts.no_check_response {
            let status = match rcode {
                ResponseCode::ServFail => Some(ResolveError::ServFail),
                ResponseCode::NotImp => Some(ResolveError::NotImplemented),
                ResponseCode::Refused => Some(ResolveError::Refused),
                _ => None,
            };
            if let Some(status) = status {
                debug!(qid, rcode = ?rcode, "Error response; trying another server");
                self.server_failed(server_id, using_tcp, now);
                let _ = self.requeue_query(qid, now, Some(status), true, Some(&parsed));
                return Ok(());
            }
        }

        // Accepted.
        let cached = match self.queries.get(qid) {
            Some(query) => self.cache.insert(now, &query.message, &parsed),
            None => false,
        };
        if cached {
            trace!(qid, "Response cached");
        }
        self.server_ok(server_id, using_tcp);
        self.end_query(qid, Some(server_id), EndResult::Answered(parsed), now);
        Ok(())
    }
}
