//! Request engine: one reliable request to a direct neighbor.
//!
//! A request is retried on timeout up to `max_attempts` times. Every attempt
//! carries its generation number and every reply echoes it back; only a reply
//! for the attempt currently being waited on can settle the request, so a
//! reply that shows up after its attempt was given up on is discarded.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{Envelope, MessageKind, Payload};
use crate::network::Network;
use crate::transport;

impl Network {
    /// Send a request from `origin` to its neighbor `destination` and wait
    /// for the response.
    ///
    /// Fails immediately with [`NestError::NoSuchNode`],
    /// [`NestError::NotNeighbor`] or [`NestError::NoHandler`]; fails with
    /// [`NestError::Timeout`] once every attempt timed out. A failure raised
    /// by the remote handler is returned as-is.
    pub async fn send_request(
        &self,
        origin: &NestId,
        destination: &NestId,
        kind: MessageKind,
        content: Payload,
    ) -> Result<Payload, NestError> {
        let origin_nest = self.nest(origin)?;
        if !self.contains(destination) {
            return Err(NestError::NoSuchNode(destination.clone()));
        }
        if !origin_nest.is_neighbor(destination) {
            return Err(NestError::NotNeighbor {
                from: origin.clone(),
                to: destination.clone(),
            });
        }
        if !self.has_handler(&kind) {
            return Err(NestError::NoHandler(kind.dispatch_key()));
        }

        let timeout = self.config().request_timeout;
        let max_attempts = self.config().max_attempts;
        let first = Envelope::new(origin.clone(), destination.clone(), kind, content);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        for attempt in 1..=max_attempts {
            let envelope = if attempt == 1 {
                first.clone()
            } else {
                first.retry(attempt)
            };
            trace!(
                from = %origin,
                to = %destination,
                kind = %first.kind,
                attempt,
                "Sending request"
            );
            transport::deliver(self, envelope, reply_tx.clone());

            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    Some((generation, result)) = reply_rx.recv() => {
                        if generation == attempt {
                            return result;
                        }
                        debug!(
                            id = %first.id,
                            generation,
                            current = attempt,
                            "Ignoring stale response"
                        );
                    }
                    _ = &mut deadline => {
                        debug!(
                            from = %origin,
                            to = %destination,
                            kind = %first.kind,
                            attempt,
                            "Request attempt timed out"
                        );
                        break;
                    }
                }
            }
        }

        Err(NestError::Timeout {
            attempts: max_attempts,
        })
    }
}
