//! Connections protocol: flooding link-state dissemination.
//!
//! Every nest broadcasts a timestamped snapshot of its own neighbors. A nest
//! that receives a snapshot newer than the one it holds stores it and passes
//! it on to its other neighbors; anything else stops there. In a connected
//! topology every nest ends up knowing every nest's neighbors, which is what
//! gateway discovery searches.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{ConnectionsSnapshot, MessageKind, Payload};
use crate::nest::Nest;
use crate::network::Network;
use crate::router::{Handler, handler_fn};

impl Network {
    /// Broadcast `from`'s current neighbor set with a fresh timestamp.
    /// Returns the number of neighbor sends dispatched.
    pub fn broadcast_connections(&self, from: &NestId) -> Result<usize, NestError> {
        let nest = self.nest(from)?;
        let snapshot = nest.own_snapshot();
        debug!(
            nest = %from,
            timestamp = snapshot.timestamp,
            neighbors = snapshot.neighbors.len(),
            "Broadcasting connections"
        );
        Ok(self.flood_snapshot(&nest, snapshot, None))
    }

    /// Have every nest broadcast its connections once.
    pub fn broadcast_all_connections(&self) -> Result<(), NestError> {
        for id in self.nest_ids() {
            self.broadcast_connections(&id)?;
        }
        Ok(())
    }

    fn flood_snapshot(
        &self,
        nest: &Nest,
        snapshot: ConnectionsSnapshot,
        exclude: Option<&NestId>,
    ) -> usize {
        let mut sent = 0;
        for neighbor in nest.neighbors() {
            if Some(&neighbor) == exclude {
                continue;
            }
            let network = self.clone();
            let from = nest.id().clone();
            let payload = Payload::Connections(snapshot.clone());
            tokio::spawn(async move {
                if let Err(e) = network
                    .send_request(&from, &neighbor, MessageKind::Connections, payload)
                    .await
                {
                    if e.is_structural() {
                        warn!(from = %from, to = %neighbor, "Connections send rejected: {e}");
                    } else {
                        debug!(from = %from, to = %neighbor, "Connections send failed: {e}");
                    }
                }
            });
            sent += 1;
        }
        sent
    }
}

/// Handler for `connections`: keep newer snapshots and pass them on.
pub(crate) fn handler() -> Handler {
    handler_fn(|ctx, content, sender| async move {
        let Payload::Connections(snapshot) = content else {
            return Err(NestError::UnexpectedPayload {
                kind: MessageKind::Connections.dispatch_key(),
                expected: "connections",
            });
        };
        if ctx.nest.accept_snapshot(&snapshot) {
            debug!(
                nest = %ctx.id(),
                subject = %snapshot.name,
                timestamp = snapshot.timestamp,
                "Learned connections"
            );
            ctx.network.flood_snapshot(&ctx.nest, snapshot, Some(&sender));
        }
        Ok(Payload::Empty)
    })
}

/// Re-broadcast one nest's connections every `interval` until shutdown.
pub(crate) async fn rebroadcast_loop(
    network: Network,
    id: NestId,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = network.broadcast_connections(&id) {
                    warn!(nest = %id, "Periodic connections broadcast failed: {e}");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
