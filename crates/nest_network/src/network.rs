//! Network: the context object that owns one simulated nest network.
//!
//! [`Network`] holds the nest registry and the handler registry for one
//! network instance, and is the entry point for every operation:
//! - topology construction (`create_nest`, `connect`)
//! - lifecycle (`start`, `shutdown`)
//! - handler registration (`define_handler`, `define_sync_handler`)
//! - messaging (`send_request`, `route_request`, `send_gossip`,
//!   `broadcast_connections`, `find_in_storage`)
//!
//! Cloning a `Network` is cheap; every clone refers to the same network.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{MessageKind, Payload};
use crate::nest::Nest;
use crate::registry::NestRegistry;
use crate::router::{Handler, HandlerRegistry, NestContext, handler_fn, sync_handler_fn};
use crate::{connections, gossip, routing, storage, transport};

/// A simulated network of nests.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network").finish_non_exhaustive()
    }
}

struct NetworkInner {
    config: NetworkConfig,
    nests: RwLock<NestRegistry>,
    handlers: RwLock<HandlerRegistry>,
    started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Network {
    /// Create an empty network with the built-in protocol handlers
    /// registered. Fails with [`NestError::InvalidConfig`] when the config
    /// does not pass [`NetworkConfig::validate`].
    pub fn new(config: NetworkConfig) -> Result<Self, NestError> {
        config.validate().map_err(NestError::InvalidConfig)?;
        Ok(Self::from_valid_config(config))
    }

    /// Create a network with default config.
    pub fn with_defaults() -> Self {
        Self::from_valid_config(NetworkConfig::default())
    }

    fn from_valid_config(config: NetworkConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(8);
        let network = Self {
            inner: Arc::new(NetworkInner {
                config,
                nests: RwLock::new(NestRegistry::new()),
                handlers: RwLock::new(HandlerRegistry::new()),
                started: AtomicBool::new(false),
                shutdown_tx,
            }),
        };
        network.register_builtin_handlers();
        network
    }

    fn register_builtin_handlers(&self) {
        self.define_sync_handler(MessageKind::Ping, |_, _, _| Ok(Payload::text("pong")));
        self.define_sync_handler(MessageKind::Ack, |_, _, _| Ok(Payload::text("OK")));
        self.register_handler(MessageKind::Gossip, gossip::handler());
        self.register_handler(MessageKind::Connections, connections::handler());
        self.register_handler(MessageKind::Route, routing::handler());
        self.register_handler(MessageKind::StorageQuery, storage::query_handler());
        self.register_handler(MessageKind::StorageResponse, storage::response_handler());
    }

    /// Return the network's configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Whether [`start`](Network::start) has been called.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Topology
    // -----------------------------------------------------------------------

    /// Add a nest to the network.
    pub fn create_nest(&self, id: impl Into<NestId>) -> Result<Nest, NestError> {
        if self.is_started() {
            return Err(NestError::Topology(
                "cannot add nests after the network started".to_string(),
            ));
        }
        let nest = Nest::new(id.into(), self.inner.config.inbox_capacity);
        self.inner.nests.write().add_nest(nest.clone())?;
        debug!(nest = %nest.id(), "Created nest");
        Ok(nest)
    }

    /// Connect two nests with a symmetric edge.
    pub fn connect(&self, a: impl Into<NestId>, b: impl Into<NestId>) -> Result<(), NestError> {
        let (a, b) = (a.into(), b.into());
        if self.is_started() {
            return Err(NestError::Topology(
                "cannot change edges after the network started".to_string(),
            ));
        }
        if a == b {
            return Err(NestError::Topology(format!("nest {a} cannot neighbor itself")));
        }
        let nests = self.inner.nests.read();
        let nest_a = nests.require(&a)?;
        let nest_b = nests.require(&b)?;
        nest_a.add_neighbor(b.clone());
        nest_b.add_neighbor(a.clone());
        debug!("Connected {a} <-> {b}");
        Ok(())
    }

    /// Get a nest by id.
    pub fn nest(&self, id: &NestId) -> Result<Nest, NestError> {
        self.inner.nests.read().require(id).cloned()
    }

    pub fn contains(&self, id: &NestId) -> bool {
        self.inner.nests.read().contains(id)
    }

    /// All nest ids, in order.
    pub fn nest_ids(&self) -> Vec<NestId> {
        self.inner.nests.read().ids()
    }

    /// All nests, ordered by id.
    pub fn nests(&self) -> Vec<Nest> {
        self.inner
            .nests
            .read()
            .list_all()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Direct neighbors of a nest.
    pub fn neighbors(&self, id: &NestId) -> Result<BTreeSet<NestId>, NestError> {
        Ok(self.nest(id)?.neighbors())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn one task per nest. Must be called from within a Tokio runtime.
    /// Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let nests = self.nests();
        for nest in &nests {
            let Some(inbox) = nest.take_inbox() else {
                warn!(nest = %nest.id(), "Nest inbox already taken");
                continue;
            };
            let shutdown = self.inner.shutdown_tx.subscribe();
            tokio::spawn(transport::run_nest(self.clone(), nest.clone(), inbox, shutdown));
        }
        if let Some(interval) = self.inner.config.connections_interval {
            for nest in &nests {
                let shutdown = self.inner.shutdown_tx.subscribe();
                tokio::spawn(connections::rebroadcast_loop(
                    self.clone(),
                    nest.id().clone(),
                    interval,
                    shutdown,
                ));
            }
        }
        info!("Network started with {} nests", nests.len());
    }

    /// Stop every nest task. Requests still in flight fail or time out.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        info!("Network shut down");
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// Register a pre-built handler, replacing any existing one for the kind.
    pub fn register_handler(&self, kind: MessageKind, handler: Handler) {
        self.inner.handlers.write().register(&kind, handler);
    }

    /// Register an async producer as the handler for a kind.
    ///
    /// The producer receives the nest the request arrived at, the content,
    /// and the id of the nest that sent it (for routed requests, the nest
    /// that originally issued the request).
    pub fn define_handler<F, Fut>(&self, kind: MessageKind, producer: F)
    where
        F: Fn(NestContext, Payload, NestId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, NestError>> + Send + 'static,
    {
        self.register_handler(kind, handler_fn(producer));
    }

    /// Register a producer that answers immediately.
    pub fn define_sync_handler<F>(&self, kind: MessageKind, producer: F)
    where
        F: Fn(&NestContext, Payload, &NestId) -> Result<Payload, NestError>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(kind, sync_handler_fn(producer));
    }

    pub fn has_handler(&self, kind: &MessageKind) -> bool {
        self.inner.handlers.read().has_handler(kind)
    }

    /// Run the handler for `kind` on `nest`. Routed content is unwrapped so
    /// the handler sees the nest that issued the request.
    pub(crate) async fn dispatch(
        &self,
        nest: &Nest,
        kind: &MessageKind,
        payload: Payload,
        sender: NestId,
    ) -> Result<Payload, NestError> {
        let handler = {
            let handlers = self.inner.handlers.read();
            handlers.get(kind)
        };
        let handler = handler.ok_or_else(|| NestError::NoHandler(kind.dispatch_key()))?;
        nest.record_request();
        let (content, source) = payload.unroute(sender);
        let ctx = NestContext {
            network: self.clone(),
            nest: nest.clone(),
        };
        handler(ctx, content, source).await
    }

    // -----------------------------------------------------------------------
    // Convergence
    // -----------------------------------------------------------------------

    /// Nests reachable from `id` in the actual topology, excluding `id`.
    pub fn reachable_from(&self, id: &NestId) -> Result<BTreeSet<NestId>, NestError> {
        let start = self.nest(id)?;
        let mut seen = BTreeSet::from([start.id().clone()]);
        let mut queue = VecDeque::from([start]);
        while let Some(nest) = queue.pop_front() {
            for neighbor in nest.neighbors() {
                if seen.insert(neighbor.clone()) {
                    queue.push_back(self.nest(&neighbor)?);
                }
            }
        }
        seen.remove(id);
        Ok(seen)
    }

    /// Whether every nest holds the latest snapshot of every nest it can
    /// reach.
    pub fn is_converged(&self) -> bool {
        let nests = self.nests();
        nests.iter().all(|nest| {
            let Ok(reachable) = self.reachable_from(nest.id()) else {
                return false;
            };
            reachable.iter().all(|other| {
                let Ok(subject) = self.nest(other) else {
                    return false;
                };
                nest.connection(other)
                    .is_some_and(|entry| entry.timestamp == subject.clock() && subject.clock() > 0)
            })
        })
    }

    /// Wait until [`is_converged`](Network::is_converged) holds, giving up
    /// after `limit`. Returns whether the network converged.
    pub async fn wait_for_convergence(&self, limit: Duration) -> bool {
        let poll = async {
            while !self.is_converged() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(limit, poll).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_handlers_registered() {
        let network = Network::with_defaults();
        for kind in [
            MessageKind::Ping,
            MessageKind::Ack,
            MessageKind::Gossip,
            MessageKind::Connections,
            MessageKind::Route,
            MessageKind::StorageQuery,
            MessageKind::StorageResponse,
        ] {
            assert!(network.has_handler(&kind), "missing handler for {kind}");
        }
        assert!(!network.has_handler(&MessageKind::Note));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = Network::new(NetworkConfig::lossy(1.5)).unwrap_err();
        assert!(matches!(err, NestError::InvalidConfig(ref reason) if reason.contains("loss_rate")));

        let config = NetworkConfig {
            max_attempts: 0,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            Network::new(config).unwrap_err(),
            NestError::InvalidConfig(_)
        ));
        assert!(Network::new(NetworkConfig::lossy(0.2)).is_ok());
    }

    #[test]
    fn test_connect_is_symmetric() {
        let network = Network::with_defaults();
        network.create_nest("a").unwrap();
        network.create_nest("b").unwrap();
        network.connect("a", "b").unwrap();

        let a = NestId::from("a");
        let b = NestId::from("b");
        assert!(network.neighbors(&a).unwrap().contains(&b));
        assert!(network.neighbors(&b).unwrap().contains(&a));
    }

    #[test]
    fn test_connect_rejects_unknown_and_self_edges() {
        let network = Network::with_defaults();
        network.create_nest("a").unwrap();
        assert_eq!(
            network.connect("a", "ghost").unwrap_err(),
            NestError::NoSuchNode(NestId::from("ghost"))
        );
        assert!(matches!(
            network.connect("a", "a").unwrap_err(),
            NestError::Topology(_)
        ));
    }

    #[test]
    fn test_duplicate_nest_rejected() {
        let network = Network::with_defaults();
        network.create_nest("a").unwrap();
        assert_eq!(
            network.create_nest("a").unwrap_err(),
            NestError::DuplicateNest(NestId::from("a"))
        );
    }

    #[tokio::test]
    async fn test_topology_frozen_after_start() {
        let network = Network::with_defaults();
        network.create_nest("a").unwrap();
        network.create_nest("b").unwrap();
        network.start();
        assert!(network.is_started());
        assert!(matches!(
            network.create_nest("c").unwrap_err(),
            NestError::Topology(_)
        ));
        assert!(matches!(
            network.connect("a", "b").unwrap_err(),
            NestError::Topology(_)
        ));
        network.shutdown();
    }

    #[test]
    fn test_reachable_from_ignores_other_components() {
        let network = Network::with_defaults();
        for id in ["a", "b", "c", "x", "y"] {
            network.create_nest(id).unwrap();
        }
        network.connect("a", "b").unwrap();
        network.connect("b", "c").unwrap();
        network.connect("x", "y").unwrap();

        let reachable = network.reachable_from(&NestId::from("a")).unwrap();
        assert_eq!(
            reachable,
            BTreeSet::from([NestId::from("b"), NestId::from("c")])
        );
    }

    #[test]
    fn test_not_converged_before_any_broadcast() {
        let network = Network::with_defaults();
        network.create_nest("a").unwrap();
        network.create_nest("b").unwrap();
        network.connect("a", "b").unwrap();
        assert!(!network.is_converged());
    }
}
