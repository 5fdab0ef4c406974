//! Work items travelling through the dispatcher.

use std::fmt;

use uuid::Uuid;

/// Identity of a submitted item, stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(Uuid);

impl ItemId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-item credential handed to the transport.
///
/// The value never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw credential, for transports that need to put it on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A payload and its credential, waiting for or undergoing transmission.
///
/// Immutable once created. The dispatcher moves the same value from the
/// queue into the transmission task and, on failure, back to the queue.
#[derive(Debug)]
pub struct QueuedItem<P> {
    id: ItemId,
    payload: P,
    credential: Credential,
}

impl<P> QueuedItem<P> {
    pub(crate) fn new(payload: P, credential: Credential) -> Self {
        Self {
            id: ItemId::new(),
            payload,
            credential,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}
