//! Simulated links: the unreliable hop between two neighboring nests.
//!
//! Every hop, request or reply, is delayed by a random latency drawn from the
//! configured range and may be lost outright. A lost hop simply never
//! arrives and the request engine's timer takes it from there.
//!
//! Retries of one request share the envelope id. The receiving nest runs
//! the handler for the first delivery only; later deliveries of the same id
//! wait on that run (or reuse its recent result) and get the reply tagged
//! with their own generation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::error::NestError;
use crate::message::{Envelope, Payload};
use crate::nest::Nest;
use crate::network::Network;

/// A response tagged with the attempt generation it answers.
pub(crate) type Reply = (u32, Result<Payload, NestError>);

/// Where a nest sends the reply for one request.
pub(crate) type ReplySender = mpsc::UnboundedSender<Reply>;

/// A request sitting in a nest's inbox.
pub(crate) struct Inbound {
    pub envelope: Envelope,
    pub reply_to: ReplySender,
}

/// One delivery waiting for a request's result: its generation and where to
/// send the reply.
pub(crate) type Waiter = (u32, ReplySender);

/// What to do with an inbound delivery.
pub(crate) enum Admission {
    /// First delivery of this request: run the handler.
    Run,
    /// The handler is already running; the waiter was attached to it.
    Joined,
    /// The handler finished recently; answer with its result.
    Finished(Result<Payload, NestError>, Waiter),
}

/// Per-nest bookkeeping of requests by envelope id.
#[derive(Default)]
pub(crate) struct RequestTable {
    running: HashMap<String, Vec<Waiter>>,
    finished: HashMap<String, (Instant, Result<Payload, NestError>)>,
}

impl RequestTable {
    pub(crate) fn admit(&mut self, id: &str, waiter: Waiter) -> Admission {
        if let Some(waiters) = self.running.get_mut(id) {
            waiters.push(waiter);
            return Admission::Joined;
        }
        if let Some((_, result)) = self.finished.get(id) {
            return Admission::Finished(result.clone(), waiter);
        }
        self.running.insert(id.to_string(), vec![waiter]);
        Admission::Run
    }

    /// Move `id` from running to finished, forgetting results older than
    /// `retention`, and return its waiters.
    pub(crate) fn finish(
        &mut self,
        id: &str,
        result: &Result<Payload, NestError>,
        now: Instant,
        retention: Duration,
    ) -> Vec<Waiter> {
        self.finished
            .retain(|_, (at, _)| now.duration_since(*at) < retention);
        self.finished.insert(id.to_string(), (now, result.clone()));
        self.running.remove(id).unwrap_or_default()
    }

    #[cfg(test)]
    fn remembered(&self) -> usize {
        self.finished.len()
    }
}

/// Decide the fate of one hop: `None` if it is lost, otherwise its delay.
fn sample_hop(config: &NetworkConfig) -> Option<Duration> {
    let mut rng = rand::rng();
    if config.loss_rate > 0.0 && rng.random_bool(config.loss_rate) {
        return None;
    }
    let min = config.latency_min.as_micros() as u64;
    let max = config.latency_max.as_micros() as u64;
    Some(Duration::from_micros(rng.random_range(min..=max.max(min))))
}

/// Carry an envelope to its destination's inbox.
pub(crate) fn deliver(network: &Network, envelope: Envelope, reply_to: ReplySender) {
    let network = network.clone();
    tokio::spawn(async move {
        let Some(delay) = sample_hop(network.config()) else {
            debug!(
                from = %envelope.from,
                to = %envelope.to,
                kind = %envelope.kind,
                generation = envelope.generation,
                "Request lost in transit"
            );
            if let Ok(nest) = network.nest(&envelope.to) {
                nest.record_dropped();
            }
            return;
        };
        tokio::time::sleep(delay).await;

        let nest = match network.nest(&envelope.to) {
            Ok(nest) => nest,
            Err(e) => {
                let _ = reply_to.send((envelope.generation, Err(e)));
                return;
            }
        };
        if nest.take_forced_drop() {
            debug!(to = %envelope.to, id = %envelope.id, "Dropping delivery on request");
            nest.record_dropped();
            return;
        }

        let to = envelope.to.clone();
        let generation = envelope.generation;
        if let Err(mpsc::error::SendError(inbound)) =
            nest.inbox().send(Inbound { envelope, reply_to }).await
        {
            let _ = inbound.reply_to.send((generation, Err(NestError::ShutDown(to))));
        }
    });
}

/// Carry a handler's result back to the requesting nest.
fn reply(network: &Network, generation: u32, result: Result<Payload, NestError>, reply_to: ReplySender) {
    let Some(delay) = sample_hop(network.config()) else {
        debug!(generation, "Reply lost in transit");
        return;
    };
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // The requester may have settled already; that is fine.
        let _ = reply_to.send((generation, result));
    });
}

/// A nest's task: take requests off the inbox and handle each on its own task
/// so a handler waiting on further network calls never blocks the inbox.
pub(crate) async fn run_nest(
    network: Network,
    nest: Nest,
    mut inbox: mpsc::Receiver<Inbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(nest = %nest.id(), "Nest task started");
    loop {
        tokio::select! {
            Some(inbound) = inbox.recv() => {
                spawn_handler(&network, &nest, inbound);
            }
            _ = shutdown.recv() => {
                debug!(nest = %nest.id(), "Nest task shutting down");
                break;
            }
        }
    }
}

fn spawn_handler(network: &Network, nest: &Nest, inbound: Inbound) {
    let Inbound { envelope, reply_to } = inbound;
    match nest.admit_request(&envelope.id, envelope.generation, reply_to) {
        Admission::Run => {}
        Admission::Joined => {
            debug!(
                nest = %nest.id(),
                id = %envelope.id,
                generation = envelope.generation,
                "Retry joined running handler"
            );
            return;
        }
        Admission::Finished(result, (generation, reply_to)) => {
            debug!(nest = %nest.id(), id = %envelope.id, generation, "Retry answered from finished handler");
            reply(network, generation, result, reply_to);
            return;
        }
    }

    let network = network.clone();
    let nest = nest.clone();
    tokio::spawn(async move {
        trace!(
            nest = %nest.id(),
            from = %envelope.from,
            kind = %envelope.kind,
            generation = envelope.generation,
            transit_ms = (Utc::now() - envelope.sent_at).num_milliseconds(),
            "Handling request"
        );
        let config = network.config();
        let retention = config.request_timeout * config.max_attempts;
        let result = network
            .dispatch(&nest, &envelope.kind, envelope.payload, envelope.from)
            .await;
        for (generation, reply_to) in nest.finish_request(&envelope.id, &result, retention) {
            reply(&network, generation, result.clone(), reply_to);
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_hop_within_latency_range() {
        let mut config = NetworkConfig::default();
        config.latency_min = Duration::from_millis(3);
        config.latency_max = Duration::from_millis(7);
        for _ in 0..100 {
            let delay = sample_hop(&config).expect("lossless link");
            assert!(delay >= config.latency_min && delay <= config.latency_max);
        }
    }

    #[test]
    fn test_sample_hop_fixed_latency() {
        let mut config = NetworkConfig::default();
        config.latency_min = Duration::from_millis(5);
        config.latency_max = Duration::from_millis(5);
        assert_eq!(sample_hop(&config), Some(Duration::from_millis(5)));
    }

    fn waiter() -> (Waiter, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        ((1, tx), rx)
    }

    #[test]
    fn test_request_table_runs_first_delivery_only() {
        let mut table = RequestTable::default();
        let (first, _rx1) = waiter();
        let (second, _rx2) = waiter();
        assert!(matches!(table.admit("req", first), Admission::Run));
        assert!(matches!(table.admit("req", (2, second.1)), Admission::Joined));

        let result = Ok(Payload::text("pong"));
        let waiters = table.finish("req", &result, Instant::now(), Duration::from_secs(1));
        let generations: Vec<u32> = waiters.iter().map(|(g, _)| *g).collect();
        assert_eq!(generations, vec![1, 2]);
    }

    #[test]
    fn test_request_table_replays_finished_result() {
        let mut table = RequestTable::default();
        let (first, _rx1) = waiter();
        let (late, _rx2) = waiter();
        table.admit("req", first);
        table.finish("req", &Ok(Payload::text("OK")), Instant::now(), Duration::from_secs(1));

        match table.admit("req", (3, late.1)) {
            Admission::Finished(result, (generation, _)) => {
                assert_eq!(result, Ok(Payload::text("OK")));
                assert_eq!(generation, 3);
            }
            _ => panic!("finished request must not run again"),
        }
    }

    #[test]
    fn test_request_table_forgets_old_results() {
        let mut table = RequestTable::default();
        let start = Instant::now();
        let retention = Duration::from_millis(750);
        for id in ["a", "b"] {
            let (w, _rx) = waiter();
            table.admit(id, w);
        }
        table.finish("a", &Ok(Payload::Empty), start, retention);
        table.finish("b", &Ok(Payload::Empty), start + Duration::from_secs(1), retention);
        assert_eq!(table.remembered(), 1);

        let (w, _rx) = waiter();
        assert!(matches!(table.admit("a", w), Admission::Run));
    }

    #[test]
    fn test_sample_hop_loses_some_messages() {
        let config = NetworkConfig::lossy(0.5);
        let lost = (0..1000).filter(|_| sample_hop(&config).is_none()).count();
        assert!(lost > 300 && lost < 700, "lost {lost} of 1000");
    }
}
