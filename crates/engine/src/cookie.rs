use hickory_proto::op::Message;

use quiver_dns_domain::ResolveError;

use crate::clock::Timestamp;
use crate::conn::Connection;

/// What to do with a response after cookie validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieAction {
    /// Cookie is acceptable (or absent and not required); keep processing.
    Accept,
    /// Silently discard the response; the query stays in flight.
    Drop,
    /// Discard the response and dispatch the query again (e.g. to echo a
    /// fresh server cookie).
    Resend,
}

/// DNS cookie (RFC 7873) handling at the send and receive edges.
///
/// The engine calls [`apply`] before serializing every outbound query and
/// [`validate`] on every matched response. The default implementation,
/// [`NoCookies`], does neither.
///
/// [`apply`]: CookieEngine::apply
/// [`validate`]: CookieEngine::validate
pub trait CookieEngine: Send {
    fn apply(
        &mut self,
        _query: &mut Message,
        _conn: &Connection,
        _now: Timestamp,
    ) -> Result<(), ResolveError> {
        Ok(())
    }

    fn validate(
        &mut self,
        _query: &Message,
        _response: &Message,
        _conn: &Connection,
        _now: Timestamp,
    ) -> CookieAction {
        CookieAction::Accept
    }
}

/// Cookie processing disabled.
pub struct NoCookies;

impl CookieEngine for NoCookies {}
