#![cfg(test)]
//! Test utilities for relay testing
//!
//! An in-memory transport that records every frame sent through it and lets
//! the test play the relay's side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::relay::{
    Connector, NormRelayUrl, Transport, TransportEvent, TransportState, WakeupFn,
};
use crate::{Error, Result};

struct MockSocket {
    state: TransportState,
    sent: Vec<String>,
    pings: usize,
    inbox: VecDeque<TransportEvent>,
    wakeup: WakeupFn,
}

/// The test's side of a mock connection.
#[derive(Clone)]
pub struct MockHandle(Arc<Mutex<MockSocket>>);

impl MockHandle {
    fn socket(&self) -> std::sync::MutexGuard<'_, MockSocket> {
        self.0.lock().expect("mock socket")
    }

    fn push(&self, event: TransportEvent) {
        let wakeup = {
            let mut socket = self.socket();
            match &event {
                TransportEvent::Opened => socket.state = TransportState::Open,
                TransportEvent::Closed | TransportEvent::Error(_) => {
                    socket.state = TransportState::Closed
                }
                _ => {}
            }
            socket.inbox.push_back(event);
            socket.wakeup.clone()
        };
        wakeup();
    }

    pub fn open(&self) {
        self.push(TransportEvent::Opened);
    }

    pub fn close_remote(&self) {
        self.push(TransportEvent::Closed);
    }

    pub fn text(&self, text: impl Into<String>) {
        self.push(TransportEvent::Text(text.into()));
    }

    /// Silently kill the socket without telling the client.
    pub fn kill(&self) {
        self.socket().state = TransportState::Closed;
    }

    pub fn state(&self) -> TransportState {
        self.socket().state
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.socket().sent)
    }

    pub fn pings(&self) -> usize {
        self.socket().pings
    }
}

struct MockTransport(MockHandle);

impl Transport for MockTransport {
    fn send(&mut self, text: String) {
        self.0.socket().sent.push(text);
    }

    fn ping(&mut self) {
        self.0.socket().pings += 1;
    }

    fn close(&mut self) {
        self.0.socket().state = TransportState::Closed;
    }

    fn state(&self) -> TransportState {
        self.0.state()
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        self.0.socket().inbox.pop_front()
    }
}

/// Hands out mock transports and remembers them in creation order.
#[derive(Clone, Default)]
pub struct MockConnector {
    sockets: Arc<Mutex<Vec<(NormRelayUrl, MockHandle)>>>,
    refuse: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.sockets.lock().expect("sockets").len()
    }

    #[track_caller]
    pub fn latest(&self) -> MockHandle {
        self.sockets
            .lock()
            .expect("sockets")
            .last()
            .map(|(_, handle)| handle.clone())
            .expect("no connection was made")
    }

    #[track_caller]
    pub fn latest_for(&self, url: &NormRelayUrl) -> MockHandle {
        self.sockets
            .lock()
            .expect("sockets")
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .map(|(_, handle)| handle.clone())
            .expect("no connection to relay")
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &NormRelayUrl, wakeup: WakeupFn) -> Result<Box<dyn Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_owned()));
        }

        let handle = MockHandle(Arc::new(Mutex::new(MockSocket {
            state: TransportState::Connecting,
            sent: Vec::new(),
            pings: 0,
            inbox: VecDeque::new(),
            wakeup,
        })));
        self.sockets
            .lock()
            .expect("sockets")
            .push((url.clone(), handle.clone()));
        Ok(Box::new(MockTransport(handle)))
    }
}

/// Parse a sent frame into its JSON array.
#[track_caller]
pub fn frame(text: &str) -> Vec<serde_json::Value> {
    serde_json::from_str(text).expect("client frame")
}

/// The subscription ids of every REQ in `sent`.
pub fn req_ids(sent: &[String]) -> Vec<String> {
    frames_of(sent, "REQ")
}

/// The subscription ids of every CLOSE in `sent`.
pub fn close_ids(sent: &[String]) -> Vec<String> {
    frames_of(sent, "CLOSE")
}

fn frames_of(sent: &[String], kind: &str) -> Vec<String> {
    sent.iter()
        .map(|text| frame(text))
        .filter(|f| f.first().and_then(|v| v.as_str()) == Some(kind))
        .filter_map(|f| f.get(1).and_then(|v| v.as_str()).map(str::to_owned))
        .collect()
}
