//! Nest: an addressable participant and the state it owns.
//!
//! Each nest owns its neighbor set, its local storage, the gossip it has
//! already flooded and its learned view of the network's adjacency. The state
//! sits behind a mutex that is only ever taken for short, synchronous
//! sections; no lock is held across an `.await`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{ConnectionsSnapshot, Payload};
use crate::transport::{Admission, Inbound, ReplySender, RequestTable, Waiter};

/// What a nest has learned about another nest's neighbors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub neighbors: BTreeSet<NestId>,
    /// Logical timestamp assigned by the subject nest.
    pub timestamp: u64,
}

/// Per-nest traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NestStats {
    /// Requests whose handler ran on this nest.
    pub requests_handled: u64,
    /// Retried deliveries answered by a handler run that was already in
    /// progress or had just finished.
    pub requests_joined: u64,
    /// Inbound deliveries lost before reaching the inbox.
    pub messages_dropped: u64,
    pub gossip_accepted: u64,
    pub gossip_duplicates: u64,
    pub snapshots_accepted: u64,
    pub snapshots_dropped: u64,
}

#[derive(Debug, Default)]
struct NestState {
    neighbors: BTreeSet<NestId>,
    connections: HashMap<NestId, ConnectionEntry>,
    gossips_seen: HashSet<String>,
    store: BTreeMap<String, String>,
    storage_responses: Vec<(String, String)>,
    clock: u64,
    stats: NestStats,
}

/// Handle to a nest. Clones refer to the same nest.
#[derive(Clone)]
pub struct Nest {
    inner: Arc<NestInner>,
}

struct NestInner {
    id: NestId,
    state: Mutex<NestState>,
    inbox: mpsc::Sender<Inbound>,
    /// Taken by the nest's task when the network starts.
    inbox_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    /// Requests by envelope id, so retries never run a handler twice.
    requests: Mutex<RequestTable>,
    drop_next: AtomicUsize,
}

impl std::fmt::Debug for Nest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nest").field("id", &self.inner.id).finish()
    }
}

impl Nest {
    pub(crate) fn new(id: NestId, inbox_capacity: usize) -> Self {
        let (inbox, inbox_rx) = mpsc::channel(inbox_capacity);
        Self {
            inner: Arc::new(NestInner {
                id,
                state: Mutex::new(NestState::default()),
                inbox,
                inbox_rx: Mutex::new(Some(inbox_rx)),
                requests: Mutex::new(RequestTable::default()),
                drop_next: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &NestId {
        &self.inner.id
    }

    pub fn neighbors(&self) -> BTreeSet<NestId> {
        self.inner.state.lock().neighbors.clone()
    }

    pub fn is_neighbor(&self, id: &NestId) -> bool {
        self.inner.state.lock().neighbors.contains(id)
    }

    /// This nest's learned adjacency of the whole network.
    pub fn connections(&self) -> HashMap<NestId, ConnectionEntry> {
        self.inner.state.lock().connections.clone()
    }

    pub fn connection(&self, id: &NestId) -> Option<ConnectionEntry> {
        self.inner.state.lock().connections.get(id).cloned()
    }

    pub fn gossips_seen(&self) -> HashSet<String> {
        self.inner.state.lock().gossips_seen.clone()
    }

    pub fn has_seen_gossip(&self, message: &str) -> bool {
        self.inner.state.lock().gossips_seen.contains(message)
    }

    /// Put a value in this nest's own storage.
    pub fn store(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .state
            .lock()
            .store
            .insert(key.into(), value.into());
    }

    /// Read this nest's own storage. Other nests go through
    /// [`Network::find_in_storage`](crate::Network::find_in_storage).
    pub fn read_storage(&self, key: &str) -> Option<String> {
        self.inner.state.lock().store.get(key).cloned()
    }

    /// `storageResponse` notifications received as a search origin, oldest
    /// first.
    pub fn storage_responses(&self) -> Vec<(String, String)> {
        self.inner.state.lock().storage_responses.clone()
    }

    pub fn stats(&self) -> NestStats {
        self.inner.state.lock().stats.clone()
    }

    /// Current value of this nest's logical clock.
    pub fn clock(&self) -> u64 {
        self.inner.state.lock().clock
    }

    /// Lose the next `count` deliveries addressed to this nest.
    pub fn drop_next_incoming(&self, count: usize) {
        self.inner.drop_next.fetch_add(count, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Crate-internal state transitions
    // -----------------------------------------------------------------------

    pub(crate) fn add_neighbor(&self, id: NestId) {
        self.inner.state.lock().neighbors.insert(id);
    }

    pub(crate) fn inbox(&self) -> mpsc::Sender<Inbound> {
        self.inner.inbox.clone()
    }

    pub(crate) fn take_inbox(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inner.inbox_rx.lock().take()
    }

    /// Consume one pending forced drop, if any.
    pub(crate) fn take_forced_drop(&self) -> bool {
        self.inner
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Register an inbound delivery of request `id`. Only the first
    /// delivery gets [`Admission::Run`]; retries wait on that run.
    pub(crate) fn admit_request(&self, id: &str, generation: u32, reply_to: ReplySender) -> Admission {
        let admission = self.inner.requests.lock().admit(id, (generation, reply_to));
        if !matches!(admission, Admission::Run) {
            self.inner.state.lock().stats.requests_joined += 1;
        }
        admission
    }

    /// Record the result of request `id` and return every delivery waiting
    /// on it.
    pub(crate) fn finish_request(
        &self,
        id: &str,
        result: &Result<Payload, NestError>,
        retention: Duration,
    ) -> Vec<Waiter> {
        self.inner
            .requests
            .lock()
            .finish(id, result, Instant::now(), retention)
    }

    pub(crate) fn record_request(&self) {
        self.inner.state.lock().stats.requests_handled += 1;
    }

    pub(crate) fn record_dropped(&self) {
        self.inner.state.lock().stats.messages_dropped += 1;
    }

    /// Mark a gossip payload as seen. Returns `false` if it already was.
    pub(crate) fn mark_gossip(&self, message: &str) -> bool {
        let mut state = self.inner.state.lock();
        if state.gossips_seen.contains(message) {
            state.stats.gossip_duplicates += 1;
            return false;
        }
        state.gossips_seen.insert(message.to_string());
        state.stats.gossip_accepted += 1;
        true
    }

    /// Advance the clock and record this nest's current adjacency in its own
    /// table, returning the snapshot to broadcast.
    pub(crate) fn own_snapshot(&self) -> ConnectionsSnapshot {
        let mut state = self.inner.state.lock();
        state.clock += 1;
        let snapshot = ConnectionsSnapshot {
            name: self.inner.id.clone(),
            neighbors: state.neighbors.clone(),
            timestamp: state.clock,
        };
        state.connections.insert(
            self.inner.id.clone(),
            ConnectionEntry {
                neighbors: snapshot.neighbors.clone(),
                timestamp: snapshot.timestamp,
            },
        );
        snapshot
    }

    /// Store a snapshot about another nest if it is strictly newer than what
    /// this nest already holds. Returns whether it was stored.
    pub(crate) fn accept_snapshot(&self, snapshot: &ConnectionsSnapshot) -> bool {
        let mut state = self.inner.state.lock();
        let stale = snapshot.name == self.inner.id
            || state
                .connections
                .get(&snapshot.name)
                .is_some_and(|known| known.timestamp >= snapshot.timestamp);
        if stale {
            state.stats.snapshots_dropped += 1;
            return false;
        }
        state.connections.insert(
            snapshot.name.clone(),
            ConnectionEntry {
                neighbors: snapshot.neighbors.clone(),
                timestamp: snapshot.timestamp,
            },
        );
        state.stats.snapshots_accepted += 1;
        true
    }

    pub(crate) fn record_storage_response(&self, key: String, value: String) {
        self.inner
            .state
            .lock()
            .storage_responses
            .push((key, value));
    }

    /// Neighbor lists learned for every nest, keyed by nest. This nest's own
    /// entry always reflects its actual neighbors.
    pub(crate) fn learned_adjacency(&self) -> HashMap<NestId, BTreeSet<NestId>> {
        let state = self.inner.state.lock();
        let mut adjacency: HashMap<NestId, BTreeSet<NestId>> = state
            .connections
            .iter()
            .map(|(id, entry)| (id.clone(), entry.neighbors.clone()))
            .collect();
        adjacency.insert(self.inner.id.clone(), state.neighbors.clone());
        adjacency
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, neighbors: &[&str], timestamp: u64) -> ConnectionsSnapshot {
        ConnectionsSnapshot {
            name: NestId::from(name),
            neighbors: neighbors.iter().map(|n| NestId::from(*n)).collect(),
            timestamp,
        }
    }

    #[test]
    fn test_storage_is_local() {
        let nest = Nest::new(NestId::from("a"), 8);
        assert!(nest.read_storage("treasure").is_none());
        nest.store("treasure", "gold");
        assert_eq!(nest.read_storage("treasure").as_deref(), Some("gold"));
    }

    #[test]
    fn test_gossip_marked_once() {
        let nest = Nest::new(NestId::from("a"), 8);
        assert!(nest.mark_gossip("kids with bb gun"));
        assert!(!nest.mark_gossip("kids with bb gun"));
        assert!(nest.has_seen_gossip("kids with bb gun"));

        let stats = nest.stats();
        assert_eq!(stats.gossip_accepted, 1);
        assert_eq!(stats.gossip_duplicates, 1);
    }

    #[test]
    fn test_snapshot_accepted_only_when_newer() {
        let nest = Nest::new(NestId::from("a"), 8);
        assert!(nest.accept_snapshot(&snapshot("b", &["a", "c"], 2)));
        assert!(!nest.accept_snapshot(&snapshot("b", &["a"], 2)));
        assert!(!nest.accept_snapshot(&snapshot("b", &["a"], 1)));
        assert_eq!(nest.connection(&NestId::from("b")).unwrap().neighbors.len(), 2);

        assert!(nest.accept_snapshot(&snapshot("b", &["a"], 3)));
        assert_eq!(nest.connection(&NestId::from("b")).unwrap().timestamp, 3);

        let stats = nest.stats();
        assert_eq!(stats.snapshots_accepted, 2);
        assert_eq!(stats.snapshots_dropped, 2);
    }

    #[test]
    fn test_snapshot_about_self_is_dropped() {
        let nest = Nest::new(NestId::from("a"), 8);
        assert!(!nest.accept_snapshot(&snapshot("a", &["z"], 100)));
        assert!(nest.connection(&NestId::from("a")).is_none());
    }

    #[test]
    fn test_own_snapshot_advances_clock() {
        let nest = Nest::new(NestId::from("a"), 8);
        nest.add_neighbor(NestId::from("b"));
        let first = nest.own_snapshot();
        let second = nest.own_snapshot();
        assert_eq!(first.timestamp, 1);
        assert_eq!(second.timestamp, 2);
        assert_eq!(nest.clock(), 2);
        assert_eq!(nest.connection(&NestId::from("a")).unwrap().timestamp, 2);
    }

    #[test]
    fn test_forced_drops_are_consumed() {
        let nest = Nest::new(NestId::from("a"), 8);
        assert!(!nest.take_forced_drop());
        nest.drop_next_incoming(2);
        assert!(nest.take_forced_drop());
        assert!(nest.take_forced_drop());
        assert!(!nest.take_forced_drop());
    }

    #[test]
    fn test_inbox_taken_once() {
        let nest = Nest::new(NestId::from("a"), 8);
        assert!(nest.take_inbox().is_some());
        assert!(nest.take_inbox().is_none());
    }
}
