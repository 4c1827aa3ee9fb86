pub mod batch;
pub mod endpoint;
mod identity;
pub mod keepalive;
pub mod message;
pub mod router;
pub mod supervisor;
mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use batch::{BatchEffect, BatchState, RelayReadiness, RelaySubscriptionBatch};
pub use endpoint::{Endpoint, EndpointCommand, EndpointHandle};
pub use identity::{BatchId, NormRelayUrl, QueryId, WireSubId};
pub use message::{CommandResult, RelayMessage};
pub use router::SubscriptionRouter;
pub use supervisor::{ConnectionStats, ConnectionSupervisor, RelayStatus};
pub use transport::{
    Connector, Transport, TransportEvent, TransportState, WakeupFn, WebsocketConnector,
    WebsocketTransport,
};
