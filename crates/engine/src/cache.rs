use hickory_proto::op::Message;

use crate::clock::Timestamp;

/// Response cache consulted at submission and offered every accepted
/// answer.
///
/// `insert` returns true when the cache retained a copy; the engine's
/// behavior is identical either way, the flag exists for observability.
pub trait QueryCache: Send {
    fn insert(&mut self, _now: Timestamp, _query: &Message, _response: &Message) -> bool {
        false
    }

    /// A hit short-circuits dispatch entirely; the caller sees a normal
    /// completion with zero timeouts.
    fn lookup(&mut self, _now: Timestamp, _query: &Message) -> Option<Message> {
        None
    }
}

/// Caching disabled.
pub struct NoCache;

impl QueryCache for NoCache {}
