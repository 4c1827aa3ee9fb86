use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, error};

use crate::fingerprint::{fingerprint, FilterFingerprint};
use crate::query::LogicalQuery;
use crate::relay::batch::{BatchState, Effects, RelayReadiness, RelaySubscriptionBatch};
use crate::relay::BatchId;
use crate::{Filter, QueryId, Result};

/// Assigns queries to batches on a single relay.
///
/// Groupable queries with the same fingerprint share the first batch that
/// has not started running yet. A fingerprint never maps to a closed batch.
#[derive(Debug)]
pub struct SubscriptionRouter {
    next_batch: u64,
    max_filters: usize,
    batches: HashMap<BatchId, RelaySubscriptionBatch>,
    by_fingerprint: HashMap<FilterFingerprint, Vec<BatchId>>,
}

impl SubscriptionRouter {
    pub fn new(max_filters: usize) -> Self {
        Self {
            next_batch: 0,
            max_filters,
            batches: HashMap::new(),
            by_fingerprint: HashMap::new(),
        }
    }

    pub fn attach(
        &mut self,
        query: Arc<LogicalQuery>,
        filters: Vec<Filter>,
        now: Instant,
        relay: RelayReadiness,
        out: &mut Effects,
    ) -> Result<BatchId> {
        let fingerprint = if query.groupable {
            fingerprint(&filters, query.close_on_eose)
        } else {
            None
        };

        let reusable = fingerprint.as_ref().and_then(|fp| {
            self.by_fingerprint.get(fp)?.iter().copied().find(|id| {
                self.batches
                    .get(id)
                    .is_some_and(|b| b.state() < BatchState::Running)
            })
        });

        let batch_id = match reusable {
            Some(id) => id,
            None => self.create_batch(fingerprint),
        };

        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return Err(crate::Error::Generic(format!("batch {batch_id:?} vanished")));
        };

        if let Err(err) = batch.add_item(query, filters, now, relay, out) {
            debug_assert!(false, "router handed out a closed batch: {err}");
            error!("router handed out a closed batch: {err}");
            return Err(err);
        }

        Ok(batch_id)
    }

    fn create_batch(&mut self, fingerprint: Option<FilterFingerprint>) -> BatchId {
        let id = BatchId(self.next_batch);
        self.next_batch += 1;

        if let Some(fp) = &fingerprint {
            self.by_fingerprint.entry(fp.clone()).or_default().push(id);
        }

        let batch = RelaySubscriptionBatch::new(id, fingerprint, self.max_filters);
        debug!("new batch {:?} '{}'", id, batch.fingerprint());
        self.batches.insert(id, batch);
        id
    }

    /// Remove `query` from every batch it belongs to.
    pub fn detach(&mut self, query: QueryId, out: &mut Effects) {
        for batch in self.batches.values_mut().filter(|b| b.contains(query)) {
            batch.remove_item(query, out);
        }
    }

    /// Forget a finalized batch.
    pub fn on_batch_closed(&mut self, id: BatchId) {
        let Some(batch) = self.batches.remove(&id) else {
            return;
        };

        let fp = batch.fingerprint();
        let Some(ids) = self.by_fingerprint.get_mut(fp) else {
            return;
        };
        ids.retain(|other| *other != id);
        if ids.is_empty() {
            self.by_fingerprint.remove(fp);
        }
    }

    pub fn batch(&self, id: BatchId) -> Option<&RelaySubscriptionBatch> {
        self.batches.get(&id)
    }

    pub fn batch_mut(&mut self, id: BatchId) -> Option<&mut RelaySubscriptionBatch> {
        self.batches.get_mut(&id)
    }

    pub fn batches(&self) -> impl Iterator<Item = &RelaySubscriptionBatch> {
        self.batches.values()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn on_relay_open(&mut self, relay: RelayReadiness, out: &mut Effects) {
        for batch in self.batches.values_mut() {
            batch.on_reconnect(relay, out);
        }
        for batch in self.batches.values_mut() {
            batch.on_relay_ready(relay, out);
        }
    }

    pub fn on_authenticated(&mut self, relay: RelayReadiness, out: &mut Effects) {
        for batch in self.batches.values_mut() {
            batch.on_authenticated(relay, out);
        }
    }

    pub fn poll_timers(&mut self, now: Instant, relay: RelayReadiness, out: &mut Effects) {
        for batch in self.batches.values_mut() {
            batch.poll_timer(now, relay, out);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.batches
            .values()
            .filter_map(RelaySubscriptionBatch::next_deadline)
            .min()
    }
}
