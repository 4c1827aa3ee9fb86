use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;

use crate::{relay::NormRelayUrl, Filter, Note, QueryId};

/// How a query's grouping delay combines with the delay a batch is already
/// waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayType {
    /// wait at least this long, later queries may push the deadline out
    AtLeast,
    /// wait at most this long, later queries may only pull it in
    AtMost,
}

pub const DEFAULT_GROUPABLE_DELAY: Duration = Duration::from_millis(10);

/// A consumer's request for events, possibly served by several relays over
/// shared wire subscriptions.
#[derive(Debug, Clone)]
pub struct LogicalQuery {
    pub id: QueryId,
    pub filters: Vec<Filter>,
    pub close_on_eose: bool,
    pub groupable: bool,
    pub groupable_delay: Duration,
    pub groupable_delay_type: DelayType,
    /// readable prefix folded into the wire subscription id
    pub sub_id: Option<String>,
    /// only accept events that came from one of these relays
    pub exclusive_relays: Option<HashSet<NormRelayUrl>>,
    /// accept locally published events that no relay has echoed yet, even
    /// with `exclusive_relays` set
    pub accept_optimistic: bool,
}

impl LogicalQuery {
    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }

    pub fn matches(&self, note: &Note) -> bool {
        self.filters.iter().any(|f| f.matches(note))
    }
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    filters: Vec<Filter>,
    close_on_eose: bool,
    groupable: bool,
    groupable_delay: Duration,
    groupable_delay_type: DelayType,
    sub_id: Option<String>,
    exclusive_relays: Option<HashSet<NormRelayUrl>>,
    accept_optimistic: bool,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            close_on_eose: false,
            groupable: true,
            groupable_delay: DEFAULT_GROUPABLE_DELAY,
            groupable_delay_type: DelayType::AtMost,
            sub_id: None,
            exclusive_relays: None,
            accept_optimistic: true,
        }
    }
}

impl QueryBuilder {
    pub fn new() -> Self {
        QueryBuilder::default()
    }

    pub fn filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn close_on_eose(mut self, close_on_eose: bool) -> Self {
        self.close_on_eose = close_on_eose;
        self
    }

    pub fn groupable(mut self, groupable: bool) -> Self {
        self.groupable = groupable;
        self
    }

    pub fn delay(mut self, delay: Duration, delay_type: DelayType) -> Self {
        self.groupable_delay = delay;
        self.groupable_delay_type = delay_type;
        self
    }

    pub fn sub_id(mut self, sub_id: impl Into<String>) -> Self {
        self.sub_id = Some(sub_id.into());
        self
    }

    /// An empty set leaves the query unrestricted.
    pub fn exclusive_relays(mut self, relays: impl IntoIterator<Item = NormRelayUrl>) -> Self {
        let relays: HashSet<NormRelayUrl> = relays.into_iter().collect();
        self.exclusive_relays = (!relays.is_empty()).then_some(relays);
        self
    }

    pub fn accept_optimistic(mut self, accept: bool) -> Self {
        self.accept_optimistic = accept;
        self
    }

    pub fn build(self) -> LogicalQuery {
        LogicalQuery {
            id: QueryId::next(),
            filters: self.filters,
            close_on_eose: self.close_on_eose,
            groupable: self.groupable,
            groupable_delay: self.groupable_delay,
            groupable_delay_type: self.groupable_delay_type,
            sub_id: self.sub_id,
            exclusive_relays: self.exclusive_relays,
            accept_optimistic: self.accept_optimistic,
        }
    }
}

/// What a [`crate::QuerySubscription`] yields.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Event {
        note: Arc<Note>,
        /// `None` for events from the cache or from a local publish
        relay: Option<NormRelayUrl>,
        optimistic: bool,
    },
    /// one relay finished sending stored events
    RelayEose(NormRelayUrl),
    /// every relay the query was sent to finished sending stored events
    Eose,
    /// a relay closed the subscription with a reason
    Closed { relay: NormRelayUrl, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let query = QueryBuilder::new().filter(Filter::new().kinds([1])).build();
        assert!(query.groupable);
        assert!(!query.close_on_eose);
        assert!(query.accept_optimistic);
        assert_eq!(query.groupable_delay, Duration::from_millis(10));
        assert_eq!(query.groupable_delay_type, DelayType::AtMost);
        assert!(query.exclusive_relays.is_none());
    }

    #[test]
    fn empty_exclusive_set_is_unrestricted() {
        let query = QueryBuilder::new()
            .filter(Filter::new().kinds([1]))
            .exclusive_relays(Vec::new())
            .build();
        assert!(query.exclusive_relays.is_none());
    }
}
