use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::PoolConfig;
use crate::dispatch::DispatchRegistry;
use crate::pool::PoolEvent;
use crate::query::LogicalQuery;
use crate::relay::batch::{BatchEffect, Effects, RelayReadiness};
use crate::relay::router::SubscriptionRouter;
use crate::relay::supervisor::{ConnectionSupervisor, RelayStatus, SupervisorAction};
use crate::relay::{
    BatchId, Connector, NormRelayUrl, RelayMessage, Transport, TransportEvent, TransportState,
    WakeupFn, WireSubId,
};
use crate::{ClientMessage, Note, QueryId};

#[derive(Debug)]
pub enum EndpointCommand {
    Attach(Arc<LogicalQuery>),
    Detach(QueryId),
    /// the host finished NIP-42 authentication with this relay
    Authenticated,
    ResetReconnection,
    Publish(Arc<Note>),
    /// a signed response to an AUTH challenge
    Auth(Note),
    Shutdown,
}

/// Everything that belongs to one relay: its connection, its batches and the
/// wire ids currently open on it.
///
/// `Endpoint` does no IO scheduling of its own. Its owner feeds it commands,
/// drains the transport with [`Endpoint::process_transport`] when woken, and
/// calls [`Endpoint::tick`] once [`Endpoint::next_deadline`] passes.
pub struct Endpoint {
    url: NormRelayUrl,
    supervisor: ConnectionSupervisor,
    transport: Option<Box<dyn Transport>>,
    connector: Arc<dyn Connector>,
    wakeup: WakeupFn,
    router: SubscriptionRouter,
    open_subs: HashMap<WireSubId, BatchId>,
    /// ids of finalized batches that are still open on the relay, closed
    /// once their EOSE arrives
    orphans: HashSet<WireSubId>,
    registry: Arc<DispatchRegistry>,
    events: UnboundedSender<PoolEvent>,
    outbox: VecDeque<ClientMessage>,
    reported_status: RelayStatus,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("status", &self.supervisor.status())
            .field("batches", &self.router.len())
            .field("open_subs", &self.open_subs.len())
            .finish()
    }
}

impl Endpoint {
    pub fn new(
        url: NormRelayUrl,
        config: &PoolConfig,
        connector: Arc<dyn Connector>,
        wakeup: WakeupFn,
        registry: Arc<DispatchRegistry>,
        events: UnboundedSender<PoolEvent>,
    ) -> Self {
        let supervisor = ConnectionSupervisor::new(config.supervisor.clone(), &config.keepalive);
        Self {
            url,
            reported_status: supervisor.status(),
            supervisor,
            transport: None,
            connector,
            wakeup,
            router: SubscriptionRouter::new(config.batch.max_filters),
            open_subs: HashMap::new(),
            orphans: HashSet::new(),
            registry,
            events,
            outbox: VecDeque::new(),
        }
    }

    pub fn url(&self) -> &NormRelayUrl {
        &self.url
    }

    pub fn status(&self) -> RelayStatus {
        self.supervisor.status()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn open_subscriptions(&self) -> usize {
        self.open_subs.len()
    }

    fn readiness(&self) -> RelayReadiness {
        let open = self
            .transport
            .as_ref()
            .is_some_and(|t| t.state() == TransportState::Open);
        let status = self.supervisor.status();

        RelayReadiness {
            connected: open && status.is_connected(),
            authenticated: status == RelayStatus::Authenticated,
        }
    }

    pub fn connect(&mut self, now: Instant) {
        if let Some(mut stale) = self.transport.take() {
            stale.close();
        }

        self.supervisor.connecting(now);
        match self.connector.connect(&self.url, self.wakeup.clone()) {
            Ok(transport) => {
                info!("connecting to {}", self.url);
                self.transport = Some(transport);
            }
            Err(err) => {
                error!("error connecting to {}: {err}", self.url);
                self.supervisor.on_disconnect(now);
            }
        }
        self.report_status();
    }

    /// Returns false once the endpoint should stop.
    pub fn handle_command(&mut self, cmd: EndpointCommand, now: Instant) -> bool {
        match cmd {
            EndpointCommand::Attach(query) => self.attach(query, now),
            EndpointCommand::Detach(id) => self.detach(id),
            EndpointCommand::Authenticated => self.authenticated(),
            EndpointCommand::ResetReconnection => self.reset_reconnection_state(now),
            EndpointCommand::Publish(note) => self.publish(note),
            EndpointCommand::Auth(note) => self.send(&ClientMessage::auth(note)),
            EndpointCommand::Shutdown => return false,
        }
        true
    }

    pub fn attach(&mut self, query: Arc<LogicalQuery>, now: Instant) {
        let mut out = Effects::new();
        let filters = query.filters.clone();
        let id = query.id;
        let relay = self.readiness();

        if let Err(err) = self.router.attach(query, filters, now, relay, &mut out) {
            error!("could not attach {id} to {}: {err}", self.url);
        }
        self.apply(out);
    }

    pub fn detach(&mut self, id: QueryId) {
        let mut out = Effects::new();
        self.router.detach(id, &mut out);
        self.apply(out);
    }

    pub fn authenticated(&mut self) {
        if self.supervisor.on_authenticated() {
            info!("authenticated with {}", self.url);
            let relay = self.readiness();
            let mut out = Effects::new();
            self.router.on_authenticated(relay, &mut out);
            self.apply(out);
        }
        self.report_status();
    }

    pub fn reset_reconnection_state(&mut self, now: Instant) {
        self.supervisor.reset_reconnection_state();
        if self.transport.is_none() {
            self.supervisor.schedule_reconnect(now);
        }
    }

    pub fn publish(&mut self, note: Arc<Note>) {
        let msg = ClientMessage::event(Note::clone(&note));
        if self.readiness().connected {
            self.send(&msg);
        } else {
            debug!("queueing event {} until {} is connected", note.id, self.url);
            self.outbox.push_back(msg);
        }
    }

    fn send(&mut self, msg: &ClientMessage) {
        match self.transport.as_mut() {
            Some(transport) if transport.state() == TransportState::Open => {
                transport.send_msg(msg)
            }
            _ => trace!("not connected to {}, dropping {:?}", self.url, msg),
        }
    }

    #[profiling::function]
    pub fn process_transport(&mut self, now: Instant, wall: SystemTime) {
        while let Some(event) = self.transport.as_mut().and_then(|t| t.try_recv()) {
            self.handle_transport_event(event, now, wall);
        }
        self.report_status();
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Instant, wall: SystemTime) {
        match event {
            TransportEvent::Opened => self.on_open(now, wall),
            TransportEvent::Closed => {
                info!("{} closed the connection", self.url);
                self.on_transport_lost(now);
            }
            TransportEvent::Error(err) => {
                error!("websocket error from {}: {err}", self.url);
                self.on_transport_lost(now);
            }
            TransportEvent::Activity => self.supervisor.on_activity(now),
            TransportEvent::Text(text) => {
                self.supervisor.on_activity(now);
                trace!("received from {}: {text}", self.url);
                match RelayMessage::from_json(&text) {
                    Ok(msg) => self.handle_message(msg),
                    Err(err) => error!("error decoding message from {}: {err}", self.url),
                }
            }
        }
    }

    fn on_open(&mut self, now: Instant, wall: SystemTime) {
        info!("connected to {}", self.url);
        self.supervisor.on_open(now, wall);
        self.report_status();

        // a fresh socket knows nothing of the old one's subscriptions
        self.orphans.clear();
        let router = &self.router;
        self.open_subs.retain(|sub_id, batch| {
            router.batch(*batch).and_then(|b| b.sub_id()) == Some(sub_id)
        });

        let relay = self.readiness();
        let mut out = Effects::new();
        self.router.on_relay_open(relay, &mut out);
        self.apply(out);

        while let Some(msg) = self.outbox.pop_front() {
            self.send(&msg);
        }
    }

    fn on_transport_lost(&mut self, now: Instant) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        let disconnect = self.supervisor.on_disconnect(now);
        debug!("reconnecting to {} in {:?}", self.url, disconnect.delay);
        self.report_status();
    }

    fn handle_message(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Event { sub_id, note } => {
                let note = Arc::new(note);
                let batch = self
                    .open_subs
                    .get(sub_id.as_str())
                    .and_then(|id| self.router.batch(*id));

                if let Some(batch) = batch {
                    batch.on_event(&note, &self.url, &self.registry);
                } else if self.orphans.contains(sub_id.as_str()) {
                    self.registry.dispatch(&note, Some(&self.url), false);
                } else {
                    debug!("event for unknown subscription {sub_id} on {}", self.url);
                }
            }

            RelayMessage::Eose(sub_id) => {
                if self.orphans.remove(sub_id.as_str()) {
                    self.send(&ClientMessage::close(sub_id));
                    return;
                }

                let Some(&batch_id) = self.open_subs.get(sub_id.as_str()) else {
                    debug!("EOSE for unknown subscription {sub_id} on {}", self.url);
                    return;
                };

                let mut out = Effects::new();
                if let Some(batch) = self.router.batch_mut(batch_id) {
                    batch.on_eose(&sub_id, &mut out);
                }
                self.apply(out);
            }

            RelayMessage::Closed { sub_id, reason } => {
                self.orphans.remove(sub_id.as_str());
                let Some(batch_id) = self.open_subs.remove(sub_id.as_str()) else {
                    return;
                };

                warn!("{} closed {sub_id}: '{reason}'", self.url);
                let mut out = Effects::new();
                if let Some(batch) = self.router.batch_mut(batch_id) {
                    batch.on_closed_by_relay(&sub_id, &reason, &mut out);
                }
                self.apply(out);
            }

            RelayMessage::Notice(message) => {
                warn!("notice from {}: {message}", self.url);
                self.emit(PoolEvent::Notice {
                    relay: self.url.clone(),
                    message,
                });
            }

            RelayMessage::OK(result) => {
                debug!(
                    "{} {} event {}: {}",
                    self.url,
                    if result.accepted { "accepted" } else { "rejected" },
                    result.event_id,
                    result.message
                );
                self.emit(PoolEvent::Published {
                    relay: self.url.clone(),
                    result,
                });
            }

            RelayMessage::Auth(challenge) => {
                info!("{} asks for authentication", self.url);
                self.emit(PoolEvent::AuthChallenge {
                    relay: self.url.clone(),
                    challenge,
                });
            }
        }
    }

    fn apply(&mut self, out: Effects) {
        for (batch, effect) in out {
            match effect {
                BatchEffect::Req { sub_id, filters } => {
                    info!(
                        "sending '{}' subscription to {} ({} filters)",
                        sub_id,
                        self.url,
                        filters.len()
                    );
                    self.open_subs.insert(sub_id.clone(), batch);
                    self.send(&ClientMessage::req(sub_id, filters));
                }
                BatchEffect::Close { sub_id } => {
                    self.open_subs.remove(&sub_id);
                    self.send(&ClientMessage::close(sub_id));
                }
                BatchEffect::Eose { query } => self.registry.relay_eose(query, &self.url),
                BatchEffect::Closed { query, reason } => {
                    self.registry.relay_closed(query, &self.url, &reason)
                }
                BatchEffect::Finalized { abandoned } => {
                    self.router.on_batch_closed(batch);
                    self.open_subs.retain(|_, owner| *owner != batch);
                    self.orphans.extend(abandoned);
                }
            }
        }
    }

    pub fn tick(&mut self, now: Instant, wall: SystemTime) {
        loop {
            let state = self.transport.as_ref().map(|t| t.state());
            let Some(action) = self.supervisor.poll(now, wall, state) else {
                break;
            };

            match action {
                SupervisorAction::Connect => self.connect(now),
                SupervisorAction::Ping => {
                    if let Some(transport) = self.transport.as_mut() {
                        trace!("pinging {}", self.url);
                        transport.ping();
                    }
                }
                SupervisorAction::DropTransport => {
                    if let Some(mut transport) = self.transport.take() {
                        transport.close();
                    }
                }
            }
            self.report_status();
        }

        let relay = self.readiness();
        let mut out = Effects::new();
        self.router.poll_timers(now, relay, &mut out);
        self.apply(out);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.supervisor.next_deadline(), self.router.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            info!("shutting down connection to {}", self.url);
            transport.close();
        }
    }

    fn report_status(&mut self) {
        let status = self.supervisor.status();
        if status == self.reported_status {
            return;
        }
        self.reported_status = status;

        self.emit(PoolEvent::Status {
            relay: self.url.clone(),
            status,
        });
        if status == RelayStatus::Flapping {
            self.emit(PoolEvent::Flapping {
                relay: self.url.clone(),
                stats: self.supervisor.stats().clone(),
            });
        }
    }

    fn emit(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            trace!("nobody is listening for pool events");
        }
    }
}

/// A running endpoint task.
#[derive(Debug)]
pub struct EndpointHandle {
    url: NormRelayUrl,
    commands: UnboundedSender<EndpointCommand>,
    task: JoinHandle<()>,
}

impl EndpointHandle {
    /// Spawn the task driving a new endpoint. Must be called from within a
    /// tokio runtime.
    pub fn spawn(
        url: NormRelayUrl,
        config: &PoolConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<DispatchRegistry>,
        events: UnboundedSender<PoolEvent>,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        let waker = notify.clone();
        let wakeup: WakeupFn = Arc::new(move || waker.notify_one());

        let endpoint = Endpoint::new(url.clone(), config, connector, wakeup, registry, events);
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_endpoint(endpoint, rx, notify));

        Self {
            url,
            commands,
            task,
        }
    }

    pub fn url(&self) -> &NormRelayUrl {
        &self.url
    }

    pub fn send(&self, cmd: EndpointCommand) {
        if self.commands.send(cmd).is_err() {
            warn!("endpoint task for {} is gone", self.url);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(EndpointCommand::Shutdown);
    }
}

fn clock() -> (Instant, SystemTime) {
    (tokio::time::Instant::now().into_std(), SystemTime::now())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn run_endpoint(
    mut endpoint: Endpoint,
    mut commands: UnboundedReceiver<EndpointCommand>,
    wakeup: Arc<Notify>,
) {
    endpoint.connect(clock().0);

    loop {
        let deadline = endpoint.next_deadline();

        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                if !endpoint.handle_command(cmd, clock().0) {
                    break;
                }
            }
            _ = wakeup.notified() => {}
            _ = sleep_until(deadline) => {}
        }

        let (now, wall) = clock();
        endpoint.process_transport(now, wall);
        endpoint.tick(now, wall);
    }

    endpoint.shutdown();
    debug!("endpoint task for {} stopped", endpoint.url());
}
