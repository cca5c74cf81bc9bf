use std::collections::BTreeSet;

use hickory_proto::op::Message;
use rustc_hash::FxHashMap;

use quiver_dns_domain::ResolveError;

use crate::clock::Timestamp;
use crate::conn::ConnId;

/// Terminal result delivered to a query's completion callback.
///
/// A failed query may still carry the last response seen (e.g. the
/// SERVFAIL answer that exhausted the retry budget).
#[derive(Debug)]
pub enum QueryOutcome {
    Answer {
        response: Message,
        /// Number of attempts that expired before this answer arrived.
        timeouts: usize,
    },
    Failed {
        error: ResolveError,
        response: Option<Message>,
        timeouts: usize,
    },
}

impl QueryOutcome {
    pub fn is_answer(&self) -> bool {
        matches!(self, Self::Answer { .. })
    }

    pub fn timeouts(&self) -> usize {
        match self {
            Self::Answer { timeouts, .. } | Self::Failed { timeouts, .. } => *timeouts,
        }
    }
}

pub type QueryCallback = Box<dyn FnOnce(QueryOutcome) + Send>;

/// One outstanding request and everything needed to retry or finish it.
pub(crate) struct Query {
    pub(crate) qid: u16,
    /// The outbound record; rewritten in place for the EDNS downgrade.
    pub(crate) message: Message,
    pub(crate) using_tcp: bool,
    pub(crate) try_count: usize,
    pub(crate) timeouts: usize,
    pub(crate) sent_at: Option<Timestamp>,
    pub(crate) deadline: Option<Timestamp>,
    /// Back-reference to the connection currently carrying this query.
    /// `None` between retries.
    pub(crate) conn: Option<ConnId>,
    pub(crate) no_retries: bool,
    /// Best error seen so far; reported if every attempt fails.
    pub(crate) error: Option<ResolveError>,
    pub(crate) callback: Option<QueryCallback>,
}

impl Query {
    pub(crate) fn new(qid: u16, message: Message, using_tcp: bool, callback: QueryCallback) -> Self {
        Self {
            qid,
            message,
            using_tcp,
            try_count: 0,
            timeouts: 0,
            sent_at: None,
            deadline: None,
            conn: None,
            no_retries: false,
            error: None,
            callback: Some(callback),
        }
    }
}

/// The live query set with its secondary index by deadline.
///
/// The per-connection FIFO (the third view of this set) lives on
/// [`Connection`](crate::conn::Connection); attachment and detachment are
/// coordinated by the channel so the three views never disagree.
#[derive(Default)]
pub(crate) struct QueryTable {
    by_qid: FxHashMap<u16, Query>,
    by_deadline: BTreeSet<(Timestamp, u16)>,
}

impl QueryTable {
    pub(crate) fn insert(&mut self, query: Query) {
        debug_assert!(!self.by_qid.contains_key(&query.qid));
        self.by_qid.insert(query.qid, query);
    }

    pub(crate) fn get(&self, qid: u16) -> Option<&Query> {
        self.by_qid.get(&qid)
    }

    pub(crate) fn get_mut(&mut self, qid: u16) -> Option<&mut Query> {
        self.by_qid.get_mut(&qid)
    }

    pub(crate) fn contains(&self, qid: u16) -> bool {
        self.by_qid.contains_key(&qid)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_qid.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_qid.is_empty()
    }

    pub(crate) fn qids(&self) -> Vec<u16> {
        self.by_qid.keys().copied().collect()
    }

    /// Remove a query entirely, clearing its deadline entry if present.
    pub(crate) fn remove(&mut self, qid: u16) -> Option<Query> {
        let query = self.by_qid.remove(&qid)?;
        if let Some(deadline) = query.deadline {
            self.by_deadline.remove(&(deadline, qid));
        }
        Some(query)
    }

    pub(crate) fn set_deadline(&mut self, qid: u16, deadline: Timestamp) {
        if let Some(query) = self.by_qid.get_mut(&qid) {
            if let Some(old) = query.deadline.take() {
                self.by_deadline.remove(&(old, qid));
            }
            query.deadline = Some(deadline);
            self.by_deadline.insert((deadline, qid));
        }
    }

    pub(crate) fn clear_deadline(&mut self, qid: u16) {
        if let Some(query) = self.by_qid.get_mut(&qid) {
            if let Some(old) = query.deadline.take() {
                self.by_deadline.remove(&(old, qid));
            }
        }
    }

    /// Earliest pending deadline, if any query is in flight.
    pub(crate) fn first_deadline(&self) -> Option<(Timestamp, u16)> {
        self.by_deadline.iter().next().copied()
    }

    /// The deadline stored on a query and its index entry agree.
    #[cfg(test)]
    pub(crate) fn deadline_index_consistent(&self, qid: u16) -> bool {
        match self.by_qid.get(&qid) {
            None => !self.by_deadline.iter().any(|&(_, id)| id == qid),
            Some(query) => match query.deadline {
                None => !self.by_deadline.iter().any(|&(_, id)| id == qid),
                Some(deadline) => self.by_deadline.contains(&(deadline, qid)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Message;

    fn query(qid: u16) -> Query {
        Query::new(qid, Message::new(), false, Box::new(|_| {}))
    }

    #[test]
    fn deadlines_pop_in_order() {
        let mut table = QueryTable::default();
        table.insert(query(1));
        table.insert(query(2));
        table.insert(query(3));

        table.set_deadline(2, Timestamp::from_millis(50));
        table.set_deadline(1, Timestamp::from_millis(200));
        table.set_deadline(3, Timestamp::from_millis(100));

        assert_eq!(table.first_deadline(), Some((Timestamp::from_millis(50), 2)));
        table.clear_deadline(2);
        assert_eq!(
            table.first_deadline(),
            Some((Timestamp::from_millis(100), 3))
        );
    }

    #[test]
    fn set_deadline_replaces_previous_entry() {
        let mut table = QueryTable::default();
        table.insert(query(7));
        table.set_deadline(7, Timestamp::from_millis(100));
        table.set_deadline(7, Timestamp::from_millis(300));

        assert_eq!(
            table.first_deadline(),
            Some((Timestamp::from_millis(300), 7))
        );
        // Only one deadline entry survives the reschedule.
        table.clear_deadline(7);
        assert_eq!(table.first_deadline(), None);
    }

    #[test]
    fn remove_strips_deadline_entry() {
        let mut table = QueryTable::default();
        table.insert(query(9));
        table.set_deadline(9, Timestamp::from_millis(10));
        let removed = table.remove(9).unwrap();
        assert_eq!(removed.qid, 9);
        assert_eq!(table.first_deadline(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn identical_deadlines_coexist() {
        let mut table = QueryTable::default();
        table.insert(query(1));
        table.insert(query(2));
        let t = Timestamp::from_millis(42);
        table.set_deadline(1, t);
        table.set_deadline(2, t);

        assert_eq!(table.first_deadline(), Some((t, 1)));
        table.clear_deadline(1);
        assert_eq!(table.first_deadline(), Some((t, 2)));
    }
}
