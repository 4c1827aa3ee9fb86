use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use rand::{distr::Alphanumeric, Rng};
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::dispatch::DispatchRegistry;
use crate::fingerprint::{merge_filters, FilterFingerprint};
use crate::query::{DelayType, LogicalQuery};
use crate::relay::{BatchId, NormRelayUrl, WireSubId};
use crate::{Error, Filter, Note, QueryId, Result};

const SUB_ID_PART_LEN: usize = 10;
const SUB_ID_MAX_LEN: usize = 20;
const SUB_ID_FALLBACK_LEN: usize = 15;
const SUB_ID_SUFFIX_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    Initial,
    /// a fire is scheduled
    Pending,
    /// fired while the relay was not ready
    Waiting,
    Running,
    Closed,
}

/// What the batch needs to know about its relay to decide whether a REQ can
/// go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayReadiness {
    pub connected: bool,
    pub authenticated: bool,
}

/// Side effects requested by a batch. The owner of the transport and the
/// dispatch registry applies them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEffect {
    Req {
        sub_id: WireSubId,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: WireSubId,
    },
    Eose {
        query: QueryId,
    },
    Closed {
        query: QueryId,
        reason: String,
    },
    /// The batch is done and can be forgotten. `abandoned` ids are still
    /// open on the relay and must be closed once they EOSE.
    Finalized {
        abandoned: Vec<WireSubId>,
    },
}

pub type Effects = Vec<(BatchId, BatchEffect)>;

#[derive(Debug)]
struct BatchItem {
    query: Arc<LogicalQuery>,
    filters: Vec<Filter>,
}

/// Pending fire deadlines. Only an at-least deadline can be withdrawn; every
/// at-most deadline ever armed stays, and whichever comes first fires.
#[derive(Debug)]
struct FireSchedule {
    fire_at: Instant,
    delay_type: DelayType,
    at_least: Option<Instant>,
    at_most: Vec<Instant>,
}

impl FireSchedule {
    fn earliest(&self) -> Option<Instant> {
        self.at_least.iter().chain(self.at_most.iter()).min().copied()
    }
}

/// One wire subscription on one relay, shared by every query whose filters
/// have the same fingerprint.
#[derive(Debug)]
pub struct RelaySubscriptionBatch {
    id: BatchId,
    fingerprint: FilterFingerprint,
    items: BTreeMap<QueryId, BatchItem>,
    state: BatchState,
    sub_id: Option<WireSubId>,
    sub_id_parts: Vec<String>,
    eosed: bool,
    schedule: Option<FireSchedule>,
    reexecute_after_auth: bool,
    abandoned: HashSet<WireSubId>,
    compiled: Vec<Filter>,
    max_filters: usize,
}

impl RelaySubscriptionBatch {
    /// `fingerprint` is `None` for batches that must never be shared.
    pub fn new(id: BatchId, fingerprint: Option<FilterFingerprint>, max_filters: usize) -> Self {
        Self {
            id,
            fingerprint: fingerprint.unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            items: BTreeMap::new(),
            state: BatchState::Initial,
            sub_id: None,
            sub_id_parts: Vec::new(),
            eosed: false,
            schedule: None,
            reexecute_after_auth: false,
            abandoned: HashSet::new(),
            compiled: Vec::new(),
            max_filters,
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn sub_id(&self) -> Option<&WireSubId> {
        self.sub_id.as_ref()
    }

    pub fn eosed(&self) -> bool {
        self.eosed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, query: QueryId) -> bool {
        self.items.contains_key(&query)
    }

    pub fn queries(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.items.keys().copied()
    }

    pub fn compiled_filters(&self) -> &[Filter] {
        &self.compiled
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != BatchState::Pending {
            return None;
        }
        self.schedule.as_ref().and_then(FireSchedule::earliest)
    }

    pub fn add_item(
        &mut self,
        query: Arc<LogicalQuery>,
        filters: Vec<Filter>,
        now: Instant,
        relay: RelayReadiness,
        out: &mut Effects,
    ) -> Result<()> {
        if self.state == BatchState::Closed {
            error!(
                "cannot add {} to closed batch {}",
                query.id, self.fingerprint
            );
            return Err(Error::BatchClosed(self.fingerprint.clone()));
        }

        if self.items.contains_key(&query.id) {
            return Ok(());
        }

        if self.sub_id.is_none() {
            if let Some(hint) = &query.sub_id {
                let part: String = hint.chars().take(SUB_ID_PART_LEN).collect();
                if !part.is_empty() && !self.sub_id_parts.contains(&part) {
                    self.sub_id_parts.push(part);
                }
            }
        }

        self.items.insert(
            query.id,
            BatchItem {
                query: query.clone(),
                filters,
            },
        );

        match self.state {
            BatchState::Initial | BatchState::Pending => {
                self.evaluate_execution_plan(&query, now, relay, out)
            }
            BatchState::Waiting | BatchState::Running => {
                trace!("{} joins {:?} batch {}", query.id, self.state, self.fingerprint)
            }
            BatchState::Closed => {}
        }

        Ok(())
    }

    fn evaluate_execution_plan(
        &mut self,
        query: &LogicalQuery,
        now: Instant,
        relay: RelayReadiness,
        out: &mut Effects,
    ) {
        if !query.groupable {
            self.state = BatchState::Pending;
            self.fire(relay, out);
            return;
        }

        // limited filters are concatenated rather than merged, so watch the
        // number of filters in the REQ
        if query.filters.iter().any(Filter::has_limit) {
            self.compiled = self.compile_filters();
            if self.compiled.len() >= self.max_filters {
                self.state = BatchState::Pending;
                self.fire(relay, out);
                return;
            }
        }

        self.schedule_fire(query.groupable_delay, query.groupable_delay_type, now);
    }

    fn schedule_fire(&mut self, delay: Duration, delay_type: DelayType, now: Instant) {
        self.state = BatchState::Pending;

        let Some(schedule) = &self.schedule else {
            self.arm(delay, delay_type, now);
            return;
        };

        let remaining = schedule.fire_at.saturating_duration_since(now);
        let rearm = match (schedule.delay_type, delay_type) {
            (DelayType::AtLeast, DelayType::AtLeast) => remaining < delay,
            _ => remaining > delay,
        };

        if rearm {
            self.arm(delay, delay_type, now);
        }
    }

    fn arm(&mut self, delay: Duration, delay_type: DelayType, now: Instant) {
        let at = now + delay;
        let schedule = self.schedule.get_or_insert_with(|| FireSchedule {
            fire_at: at,
            delay_type,
            at_least: None,
            at_most: Vec::new(),
        });

        schedule.fire_at = at;
        schedule.delay_type = delay_type;
        schedule.at_least = None;
        match delay_type {
            DelayType::AtLeast => schedule.at_least = Some(at),
            DelayType::AtMost => schedule.at_most.push(at),
        }
    }

    /// Fire if any armed deadline has passed.
    pub fn poll_timer(&mut self, now: Instant, relay: RelayReadiness, out: &mut Effects) {
        if self.next_deadline().is_some_and(|at| at <= now) {
            self.fire(relay, out);
        }
    }

    fn fire(&mut self, relay: RelayReadiness, out: &mut Effects) {
        if self.state != BatchState::Pending {
            return;
        }
        self.schedule = None;

        if !relay.connected {
            debug!(
                "batch {} waiting for relay to be ready ({} queries)",
                self.fingerprint,
                self.items.len()
            );
            self.state = BatchState::Waiting;
            return;
        }

        if self.items.is_empty() {
            debug!("batch {} has no queries left, not sending", self.fingerprint);
            self.state = BatchState::Closed;
            self.cleanup(out);
            return;
        }

        if !relay.authenticated {
            self.reexecute_after_auth = true;
        }

        self.state = BatchState::Running;
        let sub_id = self.finalize_sub_id();
        self.compiled = self.compile_filters();

        out.push((
            self.id,
            BatchEffect::Req {
                sub_id,
                filters: self.compiled.clone(),
            },
        ));
    }

    fn finalize_sub_id(&mut self) -> WireSubId {
        let mut base = if self.sub_id_parts.is_empty() {
            self.fingerprint.chars().take(SUB_ID_FALLBACK_LEN).collect()
        } else {
            let joined = self.sub_id_parts.join("-");
            joined.chars().take(SUB_ID_MAX_LEN).collect::<String>()
        };

        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SUB_ID_SUFFIX_LEN)
            .map(char::from)
            .collect();
        base.push('-');
        base.push_str(&suffix);

        let sub_id = WireSubId(base);
        self.sub_id = Some(sub_id.clone());
        sub_id
    }

    /// Member filter `i` of every query is merged with the others' filter
    /// `i`; co-batched queries share a fingerprint so they line up.
    fn compile_filters(&self) -> Vec<Filter> {
        let width = self
            .items
            .values()
            .map(|item| item.filters.len())
            .max()
            .unwrap_or(0);

        let mut compiled = Vec::new();
        for idx in 0..width {
            let at_idx: Vec<Filter> = self
                .items
                .values()
                .filter_map(|item| item.filters.get(idx).cloned())
                .collect();
            compiled.extend(merge_filters(&at_idx));
        }
        compiled
    }

    /// The relay became ready. A batch that fired too early gets another go.
    pub fn on_relay_ready(&mut self, relay: RelayReadiness, out: &mut Effects) {
        if self.state != BatchState::Waiting {
            return;
        }

        if self.items.is_empty() {
            debug!(
                "batch {} has no queries left, the relay was probably too slow",
                self.fingerprint
            );
            self.state = BatchState::Closed;
            self.cleanup(out);
            return;
        }

        self.state = BatchState::Pending;
        self.fire(relay, out);
    }

    /// The transport was re-opened under a running batch. Its REQ died with
    /// the old socket and is sent again under the same id.
    pub fn on_reconnect(&mut self, relay: RelayReadiness, out: &mut Effects) {
        if self.state != BatchState::Running {
            return;
        }
        let Some(sub_id) = self.sub_id.clone() else {
            return;
        };

        self.abandoned.clear();
        self.eosed = false;
        if !relay.authenticated {
            self.reexecute_after_auth = true;
        }

        out.push((
            self.id,
            BatchEffect::Req {
                sub_id,
                filters: self.compiled.clone(),
            },
        ));
    }

    /// The relay accepted our authentication. A REQ sent before that may have
    /// been served a restricted view, so re-issue it under a fresh id.
    pub fn on_authenticated(&mut self, relay: RelayReadiness, out: &mut Effects) {
        if !self.reexecute_after_auth {
            return;
        }
        self.reexecute_after_auth = false;

        if self.state != BatchState::Running {
            return;
        }

        if let Some(old) = self.sub_id.take() {
            if self.eosed {
                out.push((self.id, BatchEffect::Close { sub_id: old }));
            } else {
                // relays dislike a CLOSE before EOSE, close it when it arrives
                debug!("abandoning {old} until it EOSEs");
                self.abandoned.insert(old);
            }
        }

        if self.items.is_empty() {
            self.state = BatchState::Closed;
            self.cleanup(out);
            return;
        }

        self.eosed = false;
        self.state = BatchState::Pending;
        self.fire(relay, out);
    }

    pub fn on_event(&self, note: &Arc<Note>, relay: &NormRelayUrl, registry: &DispatchRegistry) {
        registry.dispatch(note, Some(relay), false);
    }

    pub fn on_eose(&mut self, sub_id: &str, out: &mut Effects) {
        if self.sub_id.as_ref().map(|s| s.0.as_str()) != Some(sub_id) {
            debug!(
                "EOSE for abandoned subscription {sub_id} of batch {}",
                self.fingerprint
            );
            self.abandoned.remove(sub_id);
            out.push((
                self.id,
                BatchEffect::Close {
                    sub_id: sub_id.into(),
                },
            ));
            return;
        }

        self.eosed = true;

        if self.items.is_empty() {
            self.close(out);
            return;
        }

        let mut one_shots = Vec::new();
        for (id, item) in &self.items {
            out.push((self.id, BatchEffect::Eose { query: *id }));
            if item.query.close_on_eose {
                one_shots.push(*id);
            }
        }

        for id in one_shots {
            self.remove_item(id, out);
        }
    }

    /// The relay closed our subscription on its own.
    pub fn on_closed_by_relay(&mut self, sub_id: &str, reason: &str, out: &mut Effects) {
        if self.abandoned.remove(sub_id) {
            return;
        }

        if !reason.is_empty() {
            for id in self.items.keys() {
                out.push((
                    self.id,
                    BatchEffect::Closed {
                        query: *id,
                        reason: reason.to_owned(),
                    },
                ));
            }
        }

        if self.state != BatchState::Closed {
            self.state = BatchState::Closed;
            self.cleanup(out);
        }
    }

    pub fn remove_item(&mut self, query: QueryId, out: &mut Effects) {
        if self.items.remove(&query).is_none() || !self.items.is_empty() {
            return;
        }

        match self.state {
            BatchState::Initial | BatchState::Pending => {
                // never sent anything, nothing to close
                self.state = BatchState::Closed;
                self.cleanup(out);
            }
            // relays dislike a CLOSE before EOSE; on_eose closes us
            BatchState::Running if !self.eosed => {}
            // waiting batches are dropped when the relay becomes ready
            BatchState::Waiting => {}
            _ => self.close(out),
        }
    }

    fn close(&mut self, out: &mut Effects) {
        if self.state == BatchState::Closed {
            return;
        }

        let prev = self.state;
        self.state = BatchState::Closed;
        match (prev, self.sub_id.clone()) {
            (BatchState::Running, Some(sub_id)) => {
                out.push((self.id, BatchEffect::Close { sub_id }));
            }
            _ => debug!(
                "batch {} wanted to close but it wasn't running ({:?}), this is probably ok",
                self.fingerprint, prev
            ),
        }
        self.cleanup(out);
    }

    fn cleanup(&mut self, out: &mut Effects) {
        self.schedule = None;
        self.reexecute_after_auth = false;
        out.push((
            self.id,
            BatchEffect::Finalized {
                abandoned: self.abandoned.drain().collect(),
            },
        ));
    }
}
