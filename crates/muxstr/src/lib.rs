mod client;
pub mod config;
pub mod dispatch;
mod error;
mod filter;
pub mod fingerprint;
mod note;
mod pool;
pub mod query;
pub mod relay;

pub use client::ClientMessage;
pub use config::PoolConfig;
pub use dispatch::{DispatchRegistry, SeenLedger};
pub use error::Error;
pub use ewebsock;
pub use filter::Filter;
pub use fingerprint::{fingerprint, merge_filters, FilterFingerprint};
pub use note::{Note, NoteId};
pub use pool::{DisconnectMonitor, PoolEvent, QuerySubscription, RelayPool};
pub use query::{DelayType, LogicalQuery, QueryBuilder, QueryEvent};
pub use relay::message::{CommandResult, RelayMessage};
pub use relay::{
    Connector, NormRelayUrl, QueryId, RelayStatus, Transport, TransportEvent, TransportState,
    WakeupFn, WebsocketConnector,
};

pub type Result<T> = std::result::Result<T, error::Error>;
