use std::{
    borrow::Borrow,
    fmt::{self, Display},
    sync::atomic::{AtomicU64, Ordering},
};

use url::Url;

use crate::Error;

/// Identifies a logical query across every relay it is attached to.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct QueryId(pub u64);

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

impl QueryId {
    pub fn next() -> Self {
        Self(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Identifies a batch within a single relay endpoint.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct BatchId(pub u64);

/// The subscription id a REQ was sent under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WireSubId(pub String);

impl From<String> for WireSubId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WireSubId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<WireSubId> for String {
    fn from(value: WireSubId) -> Self {
        value.0
    }
}

impl Display for WireSubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for WireSubId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A relay url in canonical form, so `wss://relay.example` and
/// `wss://relay.example/` name the same endpoint.
#[derive(Eq, PartialEq, Hash, Clone, Debug, PartialOrd, Ord)]
pub struct NormRelayUrl {
    url: Url,
}

impl NormRelayUrl {
    pub fn new(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url.trim()).map_err(|_| Error::InvalidRelayUrl)?;

        if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
            return Err(Error::InvalidRelayUrl);
        }

        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl Display for NormRelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl TryFrom<&str> for NormRelayUrl {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        NormRelayUrl::new(value)
    }
}
