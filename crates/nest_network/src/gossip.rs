//! Gossip: best-effort flooding of a payload to every nest.

use tracing::{debug, info, warn};

use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{MessageKind, Payload};
use crate::nest::Nest;
use crate::network::Network;
use crate::router::{Handler, handler_fn};

/// What [`Network::send_gossip`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipOutcome {
    /// The payload was new; this many neighbor sends were dispatched.
    Flooded { sent: usize },
    /// The nest had already flooded this payload.
    AlreadySeen,
}

impl Network {
    /// Start flooding `message` from `from` to the whole network.
    ///
    /// Returns once a send to every neighbor has been dispatched; delivery
    /// failures are logged, never reported.
    pub fn send_gossip(
        &self,
        from: &NestId,
        message: impl Into<String>,
    ) -> Result<GossipOutcome, NestError> {
        let nest = self.nest(from)?;
        let message = message.into();
        let outcome = self.flood_gossip(&nest, message.clone(), None);
        if let GossipOutcome::Flooded { sent } = outcome {
            info!(nest = %from, sent, "Started gossip: {message}");
        }
        Ok(outcome)
    }

    /// Mark `message` as seen on `nest` and forward it to every neighbor
    /// except the one it came from.
    fn flood_gossip(&self, nest: &Nest, message: String, exclude: Option<&NestId>) -> GossipOutcome {
        if !nest.mark_gossip(&message) {
            debug!(nest = %nest.id(), "Gossip already seen");
            return GossipOutcome::AlreadySeen;
        }

        let mut sent = 0;
        for neighbor in nest.neighbors() {
            if Some(&neighbor) == exclude {
                continue;
            }
            let network = self.clone();
            let from = nest.id().clone();
            let payload = Payload::Gossip {
                message: message.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = network
                    .send_request(&from, &neighbor, MessageKind::Gossip, payload)
                    .await
                {
                    if e.is_structural() {
                        warn!(from = %from, to = %neighbor, "Gossip send rejected: {e}");
                    } else {
                        debug!(from = %from, to = %neighbor, "Gossip send failed: {e}");
                    }
                }
            });
            sent += 1;
        }
        GossipOutcome::Flooded { sent }
    }
}

/// Handler for `gossip`: accept once, then keep flooding.
pub(crate) fn handler() -> Handler {
    handler_fn(|ctx, content, sender| async move {
        let Payload::Gossip { message } = content else {
            return Err(NestError::UnexpectedPayload {
                kind: MessageKind::Gossip.dispatch_key(),
                expected: "gossip",
            });
        };
        if let GossipOutcome::Flooded { .. } =
            ctx.network.flood_gossip(&ctx.nest, message.clone(), Some(&sender))
        {
            debug!(nest = %ctx.id(), from = %sender, "Received gossip: {message}");
        }
        Ok(Payload::Empty)
    })
}
