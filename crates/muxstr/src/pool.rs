use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, SystemDisconnectConfig};
use crate::dispatch::DispatchRegistry;
use crate::query::{LogicalQuery, QueryEvent};
use crate::relay::{
    CommandResult, ConnectionStats, Connector, EndpointCommand, EndpointHandle, NormRelayUrl,
    QueryId, RelayStatus,
};
use crate::Note;

/// Notifications about relays, as opposed to query results.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Status {
        relay: NormRelayUrl,
        status: RelayStatus,
    },
    /// the relay keeps dropping us at regular intervals
    Flapping {
        relay: NormRelayUrl,
        stats: ConnectionStats,
    },
    Notice {
        relay: NormRelayUrl,
        message: String,
    },
    /// NIP-42 challenge. Answer with [`RelayPool::send_auth`] and report
    /// success with [`RelayPool::authenticated`].
    AuthChallenge {
        relay: NormRelayUrl,
        challenge: String,
    },
    Published {
        relay: NormRelayUrl,
        result: CommandResult,
    },
}

/// Notices when most relays drop at once, which points at our own network
/// rather than the relays.
#[derive(Debug)]
pub struct DisconnectMonitor {
    window: Duration,
    retention: Duration,
    cooldown: Duration,
    recent: VecDeque<(NormRelayUrl, Instant)>,
    last_fired: Option<Instant>,
}

impl DisconnectMonitor {
    pub fn new(config: &SystemDisconnectConfig) -> Self {
        Self {
            window: config.window(),
            retention: config.retention(),
            cooldown: config.cooldown(),
            recent: VecDeque::new(),
            last_fired: None,
        }
    }

    /// Record a disconnect of `relay` out of `total` relays in the pool.
    /// Returns true when this looks like a system wide disconnect.
    pub fn record(&mut self, relay: &NormRelayUrl, now: Instant, total: usize) -> bool {
        while let Some((_, at)) = self.recent.front() {
            if now.saturating_duration_since(*at) <= self.retention {
                break;
            }
            self.recent.pop_front();
        }
        self.recent.push_back((relay.clone(), now));

        if self
            .last_fired
            .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown)
        {
            return false;
        }

        let dropped: HashSet<&NormRelayUrl> = self
            .recent
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(*at) <= self.window)
            .map(|(relay, _)| relay)
            .collect();

        let count = dropped.len();
        if count > 1 && count * 2 > total {
            self.last_fired = Some(now);
            return true;
        }
        false
    }
}

struct PoolShared {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<DispatchRegistry>,
    endpoints: Mutex<HashMap<NormRelayUrl, EndpointHandle>>,
    statuses: Mutex<HashMap<NormRelayUrl, RelayStatus>>,
    subscriber: Mutex<Option<UnboundedSender<PoolEvent>>>,
    internal: UnboundedSender<PoolEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoolShared {
    fn endpoint<R>(&self, url: &NormRelayUrl, f: impl FnOnce(&EndpointHandle) -> R) -> R {
        let mut endpoints = lock(&self.endpoints);
        if endpoints.get(url).is_some_and(EndpointHandle::is_finished) {
            warn!("endpoint task for {url} died, restarting it");
            endpoints.remove(url);
        }

        let handle = endpoints.entry(url.clone()).or_insert_with(|| {
            debug!("adding relay {url}");
            EndpointHandle::spawn(
                url.clone(),
                &self.config,
                self.connector.clone(),
                self.registry.clone(),
                self.internal.clone(),
            )
        });
        f(handle)
    }

    fn send_existing(&self, url: &NormRelayUrl, cmd: EndpointCommand) {
        match lock(&self.endpoints).get(url) {
            Some(handle) => handle.send(cmd),
            None => debug!("no endpoint for {url}, dropping {cmd:?}"),
        }
    }

    fn broadcast(&self, cmd: impl Fn() -> EndpointCommand) {
        for handle in lock(&self.endpoints).values() {
            handle.send(cmd());
        }
    }

    fn observe(&self, event: &PoolEvent, monitor: &mut DisconnectMonitor) {
        let PoolEvent::Status { relay, status } = event else {
            return;
        };
        lock(&self.statuses).insert(relay.clone(), *status);

        if !matches!(status, RelayStatus::Disconnected | RelayStatus::Flapping) {
            return;
        }

        let total = lock(&self.endpoints).len();
        let now = tokio::time::Instant::now().into_std();
        if monitor.record(relay, now, total) {
            warn!("most relays disconnected at once, resetting reconnection state");
            self.broadcast(|| EndpointCommand::ResetReconnection);
        }
    }

    fn forward(&self, event: PoolEvent) {
        let mut subscriber = lock(&self.subscriber);
        let Some(tx) = subscriber.as_ref() else {
            return;
        };
        if tx.send(event).is_err() {
            debug!("pool event receiver dropped");
            *subscriber = None;
        }
    }
}

async fn monitor_events(
    shared: Weak<PoolShared>,
    mut events: UnboundedReceiver<PoolEvent>,
    mut monitor: DisconnectMonitor,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.observe(&event, &mut monitor);
        shared.forward(event);
    }
    debug!("pool event monitor stopped");
}

/// The entry point: owns one endpoint task per relay and the registry they
/// all dispatch into.
///
/// Relays are added lazily the first time a query or a publish names them.
pub struct RelayPool {
    shared: Arc<PoolShared>,
}

impl RelayPool {
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let (internal, events) = mpsc::unbounded_channel();
        let monitor = DisconnectMonitor::new(&config.system_disconnect);

        let shared = Arc::new(PoolShared {
            registry: Arc::new(DispatchRegistry::new(&config.ledger)),
            config,
            connector,
            endpoints: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            subscriber: Mutex::new(None),
            internal,
        });

        tokio::spawn(monitor_events(Arc::downgrade(&shared), events, monitor));

        Self { shared }
    }

    /// Start receiving [`PoolEvent`]s. Only one receiver exists at a time;
    /// taking a new one replaces the previous.
    pub fn take_events(&self) -> UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.subscriber) = Some(tx);
        rx
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.shared.registry
    }

    pub fn relays(&self) -> Vec<NormRelayUrl> {
        lock(&self.shared.endpoints).keys().cloned().collect()
    }

    /// Last status reported by the relay's endpoint.
    pub fn status(&self, relay: &NormRelayUrl) -> Option<RelayStatus> {
        lock(&self.shared.statuses).get(relay).copied()
    }

    /// Register `query` and send it to every relay in `relays`.
    pub fn subscribe(
        &self,
        query: LogicalQuery,
        relays: impl IntoIterator<Item = NormRelayUrl>,
    ) -> QuerySubscription {
        let mut unique = HashSet::new();
        let relays: Vec<NormRelayUrl> = relays
            .into_iter()
            .filter(|relay| unique.insert(relay.clone()))
            .collect();

        let query = Arc::new(query);
        let (tx, events) = mpsc::unbounded_channel();
        self.shared
            .registry
            .register(query.clone(), relays.iter().cloned(), tx);

        for relay in &relays {
            self.shared.endpoint(relay, |handle| {
                handle.send(EndpointCommand::Attach(query.clone()))
            });
        }
        debug!("{} subscribed on {} relays", query.id, relays.len());

        QuerySubscription {
            query,
            relays,
            events,
            pool: Arc::downgrade(&self.shared),
            closed: false,
        }
    }

    /// Deliver `note` to matching local queries right away, then send it to
    /// `relays`. Relays that are not connected get it once they are.
    pub fn publish(&self, note: Note, relays: impl IntoIterator<Item = NormRelayUrl>) {
        let note = Arc::new(note);
        let delivered = self.shared.registry.dispatch(&note, None, true);
        debug!("optimistically delivered {} to {delivered} queries", note.id);

        for relay in relays {
            self.shared.endpoint(&relay, |handle| {
                handle.send(EndpointCommand::Publish(note.clone()))
            });
        }
    }

    /// Feed a note from a local cache to the active queries.
    pub fn dispatch_cached(&self, note: Note) -> usize {
        self.shared.registry.dispatch(&Arc::new(note), None, false)
    }

    /// The relay accepted our AUTH.
    pub fn authenticated(&self, relay: &NormRelayUrl) {
        self.shared.send_existing(relay, EndpointCommand::Authenticated);
    }

    pub fn send_auth(&self, relay: &NormRelayUrl, note: Note) {
        self.shared.send_existing(relay, EndpointCommand::Auth(note));
    }

    /// Call when the host resumes from sleep or its network changes.
    pub fn reset_reconnection_state(&self) {
        info!("resetting reconnection state of every relay");
        self.shared.broadcast(|| EndpointCommand::ResetReconnection);
    }

    /// Disconnect from every relay. Subscriptions stay registered but will
    /// not receive anything new from relays.
    pub fn shutdown(&self) {
        let endpoints: Vec<EndpointHandle> = {
            let mut endpoints = lock(&self.shared.endpoints);
            endpoints.drain().map(|(_, handle)| handle).collect()
        };
        info!("shutting down {} relay endpoints", endpoints.len());
        drop(endpoints);
        lock(&self.shared.statuses).clear();
    }
}

/// A live query. Dropping it unsubscribes from every relay.
#[derive(Debug)]
pub struct QuerySubscription {
    query: Arc<LogicalQuery>,
    relays: Vec<NormRelayUrl>,
    events: UnboundedReceiver<QueryEvent>,
    pool: Weak<PoolShared>,
    closed: bool,
}

impl QuerySubscription {
    pub fn id(&self) -> QueryId {
        self.query.id
    }

    pub fn query(&self) -> &LogicalQuery {
        &self.query
    }

    pub fn relays(&self) -> &[NormRelayUrl] {
        &self.relays
    }

    /// `None` once the query is done: it closed on EOSE or the pool is gone.
    pub async fn next(&mut self) -> Option<QueryEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<QueryEvent> {
        self.events.try_recv().ok()
    }

    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        pool.registry.unregister(self.query.id);
        for relay in &self.relays {
            pool.send_existing(relay, EndpointCommand::Detach(self.query.id));
        }
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}
