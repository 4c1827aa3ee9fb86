use std::sync::Arc;

use ewebsock::{Options, WsEvent, WsMessage, WsReceiver, WsSender};
use tracing::{debug, error, trace};

use crate::{relay::NormRelayUrl, ClientMessage, Error, Result};

/// Called by a transport whenever it has something for [`Transport::try_recv`].
pub type WakeupFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed,
    Error(String),
    Text(String),
    /// Any non-text frame, including pongs. Only counts as activity.
    Activity,
}

/// A single socket to a relay. Implementations are polled, never block, and
/// signal new events through the wakeup they were created with.
pub trait Transport: Send {
    fn send(&mut self, text: String);

    fn ping(&mut self);

    fn close(&mut self);

    fn state(&self) -> TransportState;

    fn try_recv(&mut self) -> Option<TransportEvent>;

    fn send_msg(&mut self, msg: &ClientMessage) {
        match msg.to_json() {
            Ok(json) => {
                trace!("sending {json}");
                self.send(json);
            }
            Err(e) => error!("error serializing client message: {e}"),
        }
    }
}

pub trait Connector: Send + Sync {
    fn connect(&self, url: &NormRelayUrl, wakeup: WakeupFn) -> Result<Box<dyn Transport>>;
}

/// Opens real websockets through ewebsock.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebsocketConnector;

impl Connector for WebsocketConnector {
    fn connect(&self, url: &NormRelayUrl, wakeup: WakeupFn) -> Result<Box<dyn Transport>> {
        Ok(Box::new(WebsocketTransport::connect(url, wakeup)?))
    }
}

pub struct WebsocketTransport {
    url: NormRelayUrl,
    sender: WsSender,
    receiver: WsReceiver,
    state: TransportState,
}

impl std::fmt::Debug for WebsocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketTransport")
            .field("url", &self.url)
            .field("state", &self.state)
            .finish()
    }
}

impl WebsocketTransport {
    pub fn connect(url: &NormRelayUrl, wakeup: WakeupFn) -> Result<Self> {
        let (sender, receiver) =
            ewebsock::connect_with_wakeup(url.as_str(), Options::default(), move || wakeup())
                .map_err(Error::Transport)?;

        Ok(Self {
            url: url.clone(),
            sender,
            receiver,
            state: TransportState::Connecting,
        })
    }
}

impl Transport for WebsocketTransport {
    fn send(&mut self, text: String) {
        self.sender.send(WsMessage::Text(text));
    }

    fn ping(&mut self) {
        self.sender.send(WsMessage::Ping(vec![]));
    }

    fn close(&mut self) {
        if matches!(self.state, TransportState::Closed | TransportState::Closing) {
            return;
        }
        debug!("closing websocket to {}", self.url);
        self.state = TransportState::Closing;
        self.sender.close();
    }

    /// Last state reported by ewebsock. A connection that dies without an
    /// error or close event keeps reading as [`TransportState::Open`].
    fn state(&self) -> TransportState {
        self.state
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        let event = self.receiver.try_recv()?;

        Some(match event {
            WsEvent::Opened => {
                self.state = TransportState::Open;
                TransportEvent::Opened
            }
            WsEvent::Closed => {
                self.state = TransportState::Closed;
                TransportEvent::Closed
            }
            WsEvent::Error(err) => {
                self.state = TransportState::Closed;
                TransportEvent::Error(err)
            }
            WsEvent::Message(WsMessage::Text(text)) => TransportEvent::Text(text),
            WsEvent::Message(WsMessage::Ping(bytes)) => {
                trace!("pong {}", self.url);
                self.sender.send(WsMessage::Pong(bytes));
                TransportEvent::Activity
            }
            WsEvent::Message(_) => TransportEvent::Activity,
        })
    }
}
