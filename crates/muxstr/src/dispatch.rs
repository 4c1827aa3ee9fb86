//! Delivery of inbound events to every interested query, regardless of which
//! batch or relay the event arrived through.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::config::LedgerConfig;
use crate::query::{LogicalQuery, QueryEvent};
use crate::relay::NormRelayUrl;
use crate::{Note, NoteId, QueryId};

#[derive(Debug)]
struct SeenEntry {
    first_seen: Instant,
    relays: HashSet<NormRelayUrl>,
}

/// Which relays delivered which event, bounded in size and age.
///
/// This is provenance only. It answers "did this event come from relay X"
/// for queries restricted to certain relays, and is never consulted to drop
/// an event as a duplicate.
#[derive(Debug)]
pub struct SeenLedger {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<NoteId, SeenEntry>,
    order: VecDeque<(NoteId, Instant)>,
}

impl SeenLedger {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            capacity: config.capacity,
            ttl: config.ttl(),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn record(&mut self, id: NoteId, relay: &NormRelayUrl, now: Instant) {
        self.evict_expired(now);

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.relays.insert(relay.clone());
            return;
        }

        let mut relays = HashSet::new();
        relays.insert(relay.clone());
        self.entries.insert(
            id,
            SeenEntry {
                first_seen: now,
                relays,
            },
        );
        self.order.push_back((id, now));

        while self.entries.len() > self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }
    }

    pub fn relays(&self, id: &NoteId, now: Instant) -> Option<&HashSet<NormRelayUrl>> {
        self.entries
            .get(id)
            .filter(|entry| now.saturating_duration_since(entry.first_seen) < self.ttl)
            .map(|entry| &entry.relays)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&(_, seen)) = self.order.front() {
            if now.saturating_duration_since(seen) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) -> bool {
        let Some((id, seen)) = self.order.pop_front() else {
            return false;
        };

        if self
            .entries
            .get(&id)
            .is_some_and(|entry| entry.first_seen == seen)
        {
            self.entries.remove(&id);
        }
        true
    }
}

#[derive(Debug)]
struct QueryEntry {
    query: Arc<LogicalQuery>,
    sender: UnboundedSender<QueryEvent>,
    relays: HashSet<NormRelayUrl>,
    eosed: HashSet<NormRelayUrl>,
}

impl QueryEntry {
    fn accepts_provenance(
        &self,
        id: &NoteId,
        origin: Option<&NormRelayUrl>,
        optimistic: bool,
        seen: &SeenLedger,
        now: Instant,
    ) -> bool {
        let Some(exclusive) = self
            .query
            .exclusive_relays
            .as_ref()
            .filter(|relays| !relays.is_empty())
        else {
            return true;
        };

        if optimistic {
            return self.query.accept_optimistic;
        }

        match origin {
            Some(relay) => exclusive.contains(relay),
            None => seen
                .relays(id, now)
                .is_some_and(|relays| relays.iter().any(|r| exclusive.contains(r))),
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    queries: HashMap<QueryId, QueryEntry>,
    seen: SeenLedger,
}

/// Every active query in the process, shared by all relay endpoints.
#[derive(Debug)]
pub struct DispatchRegistry {
    inner: Mutex<RegistryInner>,
}

impl DispatchRegistry {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                queries: HashMap::new(),
                seen: SeenLedger::new(config),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `relays` are the relays the query is sent to; its aggregate EOSE is
    /// emitted once all of them have sent theirs.
    pub fn register(
        &self,
        query: Arc<LogicalQuery>,
        relays: impl IntoIterator<Item = NormRelayUrl>,
        sender: UnboundedSender<QueryEvent>,
    ) {
        let entry = QueryEntry {
            query: query.clone(),
            sender,
            relays: relays.into_iter().collect(),
            eosed: HashSet::new(),
        };
        self.lock().queries.insert(query.id, entry);
    }

    pub fn unregister(&self, id: QueryId) -> bool {
        self.lock().queries.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: QueryId) -> bool {
        self.lock().queries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queries.is_empty()
    }

    /// Relays known to have delivered `id` recently.
    pub fn seen_on(&self, id: &NoteId) -> Vec<NormRelayUrl> {
        self.lock()
            .seen
            .relays(id, Instant::now())
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `note` to every registered query that matches it. Returns the
    /// number of queries it was delivered to.
    ///
    /// `origin` is the relay the note arrived from, `None` for the cache and
    /// for local publishes. `optimistic` marks a local publish no relay has
    /// confirmed yet.
    #[profiling::function]
    pub fn dispatch(
        &self,
        note: &Arc<Note>,
        origin: Option<&NormRelayUrl>,
        optimistic: bool,
    ) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let RegistryInner { queries, seen } = &mut *inner;

        if let Some(relay) = origin {
            seen.record(note.id, relay, now);
        }

        let mut delivered = 0;
        let mut gone = Vec::new();

        for (id, entry) in queries.iter() {
            if !entry.query.matches(note) {
                continue;
            }

            if !entry.accepts_provenance(&note.id, origin, optimistic, seen, now) {
                trace!("{} rejects {:?} by provenance", id, note.id);
                continue;
            }

            let event = QueryEvent::Event {
                note: note.clone(),
                relay: origin.cloned(),
                optimistic,
            };

            if entry.sender.send(event).is_err() {
                gone.push(*id);
            } else {
                delivered += 1;
            }
        }

        for id in gone {
            debug!("{} consumer went away, unregistering", id);
            queries.remove(&id);
        }

        delivered
    }

    /// A relay sent EOSE for one of the batches serving `query`.
    pub fn relay_eose(&self, query: QueryId, relay: &NormRelayUrl) {
        let mut inner = self.lock();
        let Some(entry) = inner.queries.get_mut(&query) else {
            return;
        };

        if !entry.eosed.insert(relay.clone()) {
            return;
        }

        let mut alive = entry
            .sender
            .send(QueryEvent::RelayEose(relay.clone()))
            .is_ok();

        let complete = entry.relays.iter().all(|r| entry.eosed.contains(r));
        if alive && complete {
            alive = entry.sender.send(QueryEvent::Eose).is_ok();
            if entry.query.close_on_eose {
                debug!("{} done after EOSE from all relays", query);
                alive = false;
            }
        }

        if !alive {
            inner.queries.remove(&query);
        }
    }

    pub fn relay_closed(&self, query: QueryId, relay: &NormRelayUrl, reason: &str) {
        let mut inner = self.lock();
        let Some(entry) = inner.queries.get(&query) else {
            return;
        };

        let event = QueryEvent::Closed {
            relay: relay.clone(),
            reason: reason.to_owned(),
        };
        if entry.sender.send(event).is_err() {
            inner.queries.remove(&query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryBuilder;
    use crate::Filter;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn relay(name: &str) -> NormRelayUrl {
        NormRelayUrl::new(&format!("wss://{name}.example")).expect("relay url")
    }

    fn note(id: u8, kind: u64, pubkey: &str) -> Arc<Note> {
        Arc::new(Note {
            id: NoteId::new([id; 32]),
            pubkey: pubkey.to_owned(),
            created_at: 1_700_000_000,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        })
    }

    fn registry() -> DispatchRegistry {
        DispatchRegistry::new(&LedgerConfig::default())
    }

    fn register(
        registry: &DispatchRegistry,
        query: LogicalQuery,
        relays: &[NormRelayUrl],
    ) -> (QueryId, UnboundedReceiver<QueryEvent>) {
        let (tx, rx) = unbounded_channel();
        let id = query.id;
        registry.register(Arc::new(query), relays.iter().cloned(), tx);
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<QueryEvent>) -> Vec<QueryEvent> {
        let mut events = vec![];
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[track_caller]
    fn delivered_ids(
        rx: &mut UnboundedReceiver<QueryEvent>,
    ) -> Vec<(NoteId, Option<NormRelayUrl>)> {
        drain(rx)
            .into_iter()
            .filter_map(|ev| match ev {
                QueryEvent::Event { note, relay, .. } => Some((note.id, relay)),
                _ => None,
            })
            .collect()
    }

    // ==== dispatch tests ====

    #[test]
    fn every_matching_query_gets_the_event_once_per_arrival() {
        let reg = registry();
        let a = relay("a");
        let b = relay("b");

        // two queries that would live in different batches
        let (_, mut kinds_rx) = register(
            &reg,
            QueryBuilder::new().filter(Filter::new().kinds([1])).build(),
            &[a.clone()],
        );
        let (_, mut author_rx) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().authors(["alice"]))
                .build(),
            &[b.clone()],
        );
        let (_, mut other_rx) = register(
            &reg,
            QueryBuilder::new().filter(Filter::new().kinds([7])).build(),
            &[a.clone()],
        );

        let ev = note(1, 1, "alice");
        assert_eq!(reg.dispatch(&ev, Some(&a), false), 2);
        // the same event arriving again is delivered again
        assert_eq!(reg.dispatch(&ev, Some(&b), false), 2);

        assert_eq!(
            delivered_ids(&mut kinds_rx),
            vec![(ev.id, Some(a.clone())), (ev.id, Some(b.clone()))]
        );
        assert_eq!(
            delivered_ids(&mut author_rx),
            vec![(ev.id, Some(a.clone())), (ev.id, Some(b.clone()))]
        );
        assert!(delivered_ids(&mut other_rx).is_empty());
        assert_eq!(reg.seen_on(&ev.id).len(), 2);
    }

    #[test]
    fn exclusive_query_only_sees_its_relays() {
        let reg = registry();
        let a = relay("a");
        let b = relay("b");
        let (_, mut rx) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().kinds([1]))
                .exclusive_relays([a.clone()])
                .build(),
            &[a.clone()],
        );

        let from_b = note(1, 1, "x");
        let from_a = note(2, 1, "x");
        reg.dispatch(&from_b, Some(&b), false);
        reg.dispatch(&from_a, Some(&a), false);

        assert_eq!(delivered_ids(&mut rx), vec![(from_a.id, Some(a))]);
    }

    #[test]
    fn exclusive_query_checks_ledger_for_cached_events() {
        let reg = registry();
        let a = relay("a");
        let b = relay("b");
        let (_, mut rx) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().kinds([1]))
                .exclusive_relays([a.clone()])
                .build(),
            &[a.clone()],
        );

        let seen_on_a = note(1, 1, "x");
        let seen_on_b = note(2, 1, "x");
        let never_seen = note(3, 1, "x");
        reg.dispatch(&seen_on_a, Some(&a), false);
        reg.dispatch(&seen_on_b, Some(&b), false);
        drain(&mut rx);

        reg.dispatch(&seen_on_a, None, false);
        reg.dispatch(&seen_on_b, None, false);
        reg.dispatch(&never_seen, None, false);

        assert_eq!(delivered_ids(&mut rx), vec![(seen_on_a.id, None)]);
    }

    #[test]
    fn empty_exclusive_set_does_not_restrict() {
        let reg = registry();
        let a = relay("a");

        let mut query = QueryBuilder::new().filter(Filter::new().kinds([1])).build();
        query.exclusive_relays = Some(HashSet::new());
        let (_, mut rx) = register(&reg, query, &[a.clone()]);
        let (_, mut built_rx) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().kinds([1]))
                .exclusive_relays(Vec::new())
                .build(),
            &[a.clone()],
        );

        let ev = note(1, 1, "x");
        assert_eq!(reg.dispatch(&ev, Some(&a), false), 2);
        assert_eq!(reg.dispatch(&ev, None, false), 2);

        let expected = vec![(ev.id, Some(a)), (ev.id, None)];
        assert_eq!(delivered_ids(&mut rx), expected);
        assert_eq!(delivered_ids(&mut built_rx), expected);
    }

    #[test]
    fn late_query_receives_a_repeated_event() {
        let reg = registry();
        let r = relay("r");
        let (_, mut first_rx) = register(
            &reg,
            QueryBuilder::new().filter(Filter::new().kinds([1])).build(),
            &[r.clone()],
        );

        let ev = note(1, 1, "x");
        assert_eq!(reg.dispatch(&ev, Some(&r), false), 1);

        // registered after the event was already seen once
        let (_, mut late_rx) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().authors(["x"]))
                .build(),
            &[r.clone()],
        );
        assert_eq!(reg.dispatch(&ev, Some(&r), false), 2);

        assert_eq!(
            delivered_ids(&mut first_rx),
            vec![(ev.id, Some(r.clone())), (ev.id, Some(r.clone()))]
        );
        assert_eq!(delivered_ids(&mut late_rx), vec![(ev.id, Some(r))]);
    }

    #[test]
    fn optimistic_publish_respects_opt_out() {
        let reg = registry();
        let a = relay("a");
        let (_, mut accepting) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().kinds([1]))
                .exclusive_relays([a.clone()])
                .build(),
            &[a.clone()],
        );
        let (_, mut refusing) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().kinds([1]))
                .exclusive_relays([a.clone()])
                .accept_optimistic(false)
                .build(),
            &[a.clone()],
        );

        let ev = note(9, 1, "me");
        assert_eq!(reg.dispatch(&ev, None, true), 1);
        assert_eq!(delivered_ids(&mut accepting), vec![(ev.id, None)]);
        assert!(delivered_ids(&mut refusing).is_empty());
    }

    #[test]
    fn dropped_consumer_is_unregistered() {
        let reg = registry();
        let (id, rx) = register(
            &reg,
            QueryBuilder::new().filter(Filter::new().kinds([1])).build(),
            &[],
        );
        drop(rx);

        assert_eq!(reg.dispatch(&note(1, 1, "x"), None, false), 0);
        assert!(!reg.is_registered(id));
    }

    // ==== eose tests ====

    #[test]
    fn eose_is_aggregated_across_relays() {
        let reg = registry();
        let a = relay("a");
        let b = relay("b");
        let (id, mut rx) = register(
            &reg,
            QueryBuilder::new().filter(Filter::new().kinds([1])).build(),
            &[a.clone(), b.clone()],
        );

        reg.relay_eose(id, &a);
        reg.relay_eose(id, &a);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], QueryEvent::RelayEose(r) if *r == a));

        reg.relay_eose(id, &b);
        let events = drain(&mut rx);
        assert!(matches!(&events[..], [QueryEvent::RelayEose(r), QueryEvent::Eose] if *r == b));
        assert!(reg.is_registered(id));
    }

    #[test]
    fn one_shot_query_ends_after_eose() {
        let reg = registry();
        let a = relay("a");
        let (id, mut rx) = register(
            &reg,
            QueryBuilder::new()
                .filter(Filter::new().kinds([1]))
                .close_on_eose(true)
                .build(),
            &[a.clone()],
        );

        reg.relay_eose(id, &a);
        assert!(!reg.is_registered(id));
        assert_eq!(drain(&mut rx).len(), 2);
        // the sender is gone so the stream has ended
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn closed_reason_is_forwarded() {
        let reg = registry();
        let a = relay("a");
        let (id, mut rx) = register(
            &reg,
            QueryBuilder::new().filter(Filter::new().kinds([1])).build(),
            &[a.clone()],
        );

        reg.relay_closed(id, &a, "auth-required: nope");
        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [QueryEvent::Closed { relay, reason }] if *relay == a && reason == "auth-required: nope"
        ));
    }

    // ==== ledger tests ====

    #[test]
    fn ledger_is_bounded() {
        let mut ledger = SeenLedger::new(&LedgerConfig {
            capacity: 3,
            ..LedgerConfig::default()
        });
        let a = relay("a");
        let t0 = Instant::now();

        for i in 0..5u8 {
            ledger.record(NoteId::new([i; 32]), &a, t0);
        }

        assert_eq!(ledger.len(), 3);
        assert!(ledger.relays(&NoteId::new([0; 32]), t0).is_none());
        assert!(ledger.relays(&NoteId::new([4; 32]), t0).is_some());
    }

    #[test]
    fn ledger_entries_expire() {
        let mut ledger = SeenLedger::new(&LedgerConfig::default());
        let a = relay("a");
        let b = relay("b");
        let t0 = Instant::now();
        let id = NoteId::new([1; 32]);

        ledger.record(id, &a, t0);
        ledger.record(id, &b, t0 + Duration::from_secs(60));
        assert_eq!(
            ledger.relays(&id, t0 + Duration::from_secs(60)).map(|r| r.len()),
            Some(2)
        );

        let later = t0 + Duration::from_secs(5 * 60);
        assert!(ledger.relays(&id, later).is_none());

        ledger.record(NoteId::new([2; 32]), &a, later);
        assert_eq!(ledger.len(), 1);
    }
}
