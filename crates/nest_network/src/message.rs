//! Message protocol: typed payloads and the envelope that carries them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::NestError;
use crate::identity::NestId;

/// The kind of message carried in an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Free-form note between neighbors.
    Note,
    /// Liveness check, answered with `"pong"`.
    Ping,
    /// Epidemic broadcast payload.
    Gossip,
    /// A nest's neighbor-set snapshot.
    Connections,
    /// A request being forwarded toward a non-neighbor target.
    Route,
    /// Application message delivered through routing.
    Message,
    /// Acknowledged delivery, answered with `"OK"`.
    Ack,
    /// One step of a distributed storage search.
    StorageQuery,
    /// Notification to a search origin that a key was found.
    StorageResponse,
    /// User-defined message type for extensions.
    Custom(String),
}

impl MessageKind {
    /// Return a string key used for handler dispatch.
    pub fn dispatch_key(&self) -> String {
        match self {
            Self::Note => "note".to_string(),
            Self::Ping => "ping".to_string(),
            Self::Gossip => "gossip".to_string(),
            Self::Connections => "connections".to_string(),
            Self::Route => "route".to_string(),
            Self::Message => "message".to_string(),
            Self::Ack => "ack".to_string(),
            Self::StorageQuery => "storageQuery".to_string(),
            Self::StorageResponse => "storageResponse".to_string(),
            Self::Custom(name) => format!("custom:{name}"),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dispatch_key())
    }
}

/// A nest's adjacency as it was when the nest broadcast it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionsSnapshot {
    /// The nest the snapshot describes.
    pub name: NestId,
    pub neighbors: BTreeSet<NestId>,
    /// Logical timestamp from the subject nest's clock.
    pub timestamp: u64,
}

/// The unchanged request a `route` message carries from hop to hop.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEnvelope {
    pub target: NestId,
    pub kind: MessageKind,
    pub content: Box<Payload>,
    /// The nest that originally issued the request.
    pub source: NestId,
}

/// Nests already visited by one storage search.
///
/// Clones share the same underlying set, so every hop of a search sees the
/// nests marked by every other hop. Independent searches must create their
/// own set. The set also remembers whether some nest already reported the
/// key, so the origin is notified once per search.
#[derive(Debug, Clone, Default)]
pub struct TriedSet(Arc<Mutex<SearchMarks>>);

#[derive(Debug, Default)]
struct SearchMarks {
    tried: BTreeSet<NestId>,
    found: bool,
}

impl TriedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set with the given nests already marked.
    pub fn with<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<NestId>,
    {
        let tried = ids.into_iter().map(Into::into).collect();
        Self(Arc::new(Mutex::new(SearchMarks { tried, found: false })))
    }

    /// Mark a nest as tried. Returns `false` if it already was.
    pub fn mark(&self, id: &NestId) -> bool {
        self.0.lock().tried.insert(id.clone())
    }

    pub fn contains(&self, id: &NestId) -> bool {
        self.0.lock().tried.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.lock().tried.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().tried.is_empty()
    }

    pub fn snapshot(&self) -> BTreeSet<NestId> {
        self.0.lock().tried.clone()
    }

    /// Record that the key was found. Returns `true` only the first time.
    pub fn mark_found(&self) -> bool {
        !std::mem::replace(&mut self.0.lock().found, true)
    }
}

impl PartialEq for TriedSet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.snapshot() == other.snapshot()
    }
}

/// The payload of a request or of its response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Text(String),
    Gossip {
        message: String,
    },
    Connections(ConnectionsSnapshot),
    Route(RouteEnvelope),
    /// Content delivered to its final hop, tagged with the nest that issued it.
    Routed {
        content: Box<Payload>,
        source: NestId,
    },
    StorageQuery {
        key: String,
        tried: TriedSet,
        origin: NestId,
    },
    StorageResponse {
        key: String,
        value: String,
    },
    Value(String),
}

impl Payload {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// A short name for the variant, used in logs and error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text(_) => "text",
            Self::Gossip { .. } => "gossip",
            Self::Connections(_) => "connections",
            Self::Route(_) => "route",
            Self::Routed { .. } => "routed",
            Self::StorageQuery { .. } => "storage query",
            Self::StorageResponse { .. } => "storage response",
            Self::Value(_) => "value",
        }
    }

    /// Strip a routing wrapper, returning the inner content and the nest that
    /// originally sent it. Unwrapped payloads come from `sender` itself.
    pub fn unroute(self, sender: NestId) -> (Payload, NestId) {
        match self {
            Self::Routed { content, source } => (*content, source),
            other => (other, sender),
        }
    }

    /// Interpret the payload as a text response.
    pub fn into_text(self, kind: &MessageKind) -> Result<String, NestError> {
        match self {
            Self::Text(s) | Self::Value(s) => Ok(s),
            _ => Err(NestError::UnexpectedPayload {
                kind: kind.dispatch_key(),
                expected: "text",
            }),
        }
    }
}

/// A message in flight between two neighboring nests.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Unique message identifier (UUID v4), shared by every attempt.
    pub id: String,
    pub from: NestId,
    pub to: NestId,
    pub kind: MessageKind,
    pub payload: Payload,
    /// Attempt number this copy belongs to.
    pub generation: u32,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Create the first-attempt envelope from one nest to a neighbor.
    pub fn new(from: NestId, to: NestId, kind: MessageKind, payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from,
            to,
            kind,
            payload,
            generation: 1,
            sent_at: Utc::now(),
        }
    }

    /// A copy of this envelope for a later attempt.
    pub fn retry(&self, generation: u32) -> Self {
        Self {
            generation,
            sent_at: Utc::now(),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
