//! Routing: gateway discovery and hop-by-hop forwarding.
//!
//! A nest never needs the full path to a target. It picks a gateway (the
//! neighbor that starts a shortest path in its *learned* topology) and hands
//! the request to it as a `route` message; the gateway makes the same
//! decision from its own table, and so on until the target is a neighbor.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{MessageKind, Payload, RouteEnvelope};
use crate::network::Network;
use crate::router::{Handler, handler_fn};

/// Breadth-first search for the first hop from `from` toward `target`.
///
/// The frontier starts with `neighbors`; each entry remembers the neighbor
/// it was first reached through. Nests are expanded with the neighbor lists
/// in `adjacency`.
pub fn find_gateway_in(
    from: &NestId,
    neighbors: &BTreeSet<NestId>,
    adjacency: &HashMap<NestId, BTreeSet<NestId>>,
    target: &NestId,
) -> Option<NestId> {
    if target == from || neighbors.contains(target) {
        return Some(target.clone());
    }

    let mut visited: HashSet<&NestId> = HashSet::from([from]);
    let mut queue: VecDeque<(&NestId, &NestId)> = VecDeque::new();
    for neighbor in neighbors {
        visited.insert(neighbor);
        queue.push_back((neighbor, neighbor));
    }

    while let Some((at, via)) = queue.pop_front() {
        if at == target {
            return Some(via.clone());
        }
        let Some(next) = adjacency.get(at) else {
            continue;
        };
        for n in next {
            if visited.insert(n) {
                queue.push_back((n, via));
            }
        }
    }
    None
}

/// Nests named anywhere in the learned topology, nearest first.
///
/// Nests reachable in the learned graph come in breadth-first order (ties by
/// id); nests that are only mentioned in a neighbor list of an unreachable
/// entry come last.
pub fn learned_nests_by_distance(
    from: &NestId,
    adjacency: &HashMap<NestId, BTreeSet<NestId>>,
) -> Vec<NestId> {
    let mut order = Vec::new();
    let mut visited: HashSet<&NestId> = HashSet::from([from]);
    let mut queue: VecDeque<&NestId> = VecDeque::from([from]);
    while let Some(at) = queue.pop_front() {
        let Some(next) = adjacency.get(at) else {
            continue;
        };
        for n in next {
            if visited.insert(n) {
                order.push(n.clone());
                queue.push_back(n);
            }
        }
    }

    let mut rest: BTreeSet<&NestId> = adjacency
        .iter()
        .flat_map(|(id, neighbors)| std::iter::once(id).chain(neighbors))
        .collect();
    rest.retain(|id| !visited.contains(id));
    order.extend(rest.into_iter().cloned());
    order
}

impl Network {
    /// The neighbor `from` should hand a request for `target` to.
    ///
    /// Returns `target` itself when it is `from` or one of its neighbors.
    /// [`NestError::NoRouteFound`] is an expected outcome while the learned
    /// topology is incomplete.
    pub fn find_gateway(&self, from: &NestId, target: &NestId) -> Result<NestId, NestError> {
        let nest = self.nest(from)?;
        find_gateway_in(
            from,
            &nest.neighbors(),
            &nest.learned_adjacency(),
            target,
        )
        .ok_or_else(|| NestError::NoRouteFound(target.clone()))
    }

    /// Deliver a request from `from` to any reachable `target`.
    ///
    /// The handler at `target` sees `from` as the source no matter how many
    /// hops the request took.
    pub async fn route_request(
        &self,
        from: &NestId,
        target: &NestId,
        kind: MessageKind,
        content: Payload,
    ) -> Result<Payload, NestError> {
        let envelope = RouteEnvelope {
            target: target.clone(),
            kind,
            content: Box::new(content),
            source: from.clone(),
        };
        self.forward(from.clone(), envelope).await
    }

    /// Move a routed request one hop closer to its target, as seen from `at`.
    async fn forward(&self, at: NestId, envelope: RouteEnvelope) -> Result<Payload, NestError> {
        let nest = self.nest(&at)?;
        let RouteEnvelope {
            target,
            kind,
            content,
            source,
        } = envelope;

        if target == at {
            let routed = Payload::Routed { content, source };
            return self.dispatch(&nest, &kind, routed, at).await;
        }
        if nest.is_neighbor(&target) {
            let routed = Payload::Routed { content, source };
            return self.send_request(&at, &target, kind, routed).await;
        }

        let gateway = self.find_gateway(&at, &target)?;
        debug!(at = %at, target = %target, gateway = %gateway, kind = %kind, "Forwarding via gateway");
        let envelope = RouteEnvelope {
            target,
            kind,
            content,
            source,
        };
        self.send_request(&at, &gateway, MessageKind::Route, Payload::Route(envelope))
            .await
    }
}

/// Handler for `route`: continue forwarding from the receiving nest.
pub(crate) fn handler() -> Handler {
    handler_fn(|ctx, content, _sender| async move {
        match content {
            Payload::Route(envelope) => ctx.network.forward(ctx.id().clone(), envelope).await,
            other => {
                debug!(shape = other.shape(), "Malformed route request");
                Err(NestError::UnexpectedPayload {
                    kind: MessageKind::Route.dispatch_key(),
                    expected: "route",
                })
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> BTreeSet<NestId> {
        names.iter().map(|n| NestId::from(*n)).collect()
    }

    fn graph(edges: &[(&str, &str)]) -> HashMap<NestId, BTreeSet<NestId>> {
        let mut adjacency: HashMap<NestId, BTreeSet<NestId>> = HashMap::new();
        for (a, b) in edges {
            adjacency.entry(NestId::from(*a)).or_default().insert(NestId::from(*b));
            adjacency.entry(NestId::from(*b)).or_default().insert(NestId::from(*a));
        }
        adjacency
    }

    #[test]
    fn test_gateway_on_line() {
        let adjacency = graph(&[("a", "b"), ("b", "c"), ("c", "d")]);
        let gateway = find_gateway_in(&"a".into(), &ids(&["b"]), &adjacency, &"d".into());
        assert_eq!(gateway, Some(NestId::from("b")));
    }

    #[test]
    fn test_gateway_degenerate_cases() {
        let adjacency = graph(&[("a", "b")]);
        let me = NestId::from("a");
        assert_eq!(
            find_gateway_in(&me, &ids(&["b"]), &adjacency, &me),
            Some(me.clone())
        );
        assert_eq!(
            find_gateway_in(&me, &ids(&["b"]), &HashMap::new(), &"b".into()),
            Some(NestId::from("b"))
        );
    }

    #[test]
    fn test_gateway_missing_when_topology_unknown() {
        // Only our own neighbors are known, nothing beyond.
        let gateway = find_gateway_in(&"a".into(), &ids(&["b"]), &HashMap::new(), &"d".into());
        assert_eq!(gateway, None);
    }

    #[test]
    fn test_gateway_prefers_shortest_learned_path() {
        // a-b-c-d-t is long, a-e-t is short.
        let adjacency = graph(&[("a", "b"), ("b", "c"), ("c", "d"), ("d", "t"), ("a", "e"), ("e", "t")]);
        let gateway = find_gateway_in(&"a".into(), &ids(&["b", "e"]), &adjacency, &"t".into());
        assert_eq!(gateway, Some(NestId::from("e")));
    }

    #[test]
    fn test_learned_nests_by_distance() {
        let mut adjacency = graph(&[("a", "b"), ("b", "c"), ("a", "d")]);
        adjacency.insert(NestId::from("x"), ids(&["y"]));
        let order: Vec<String> = learned_nests_by_distance(&"a".into(), &adjacency)
            .into_iter()
            .map(|id| id.0)
            .collect();
        assert_eq!(order, vec!["b", "d", "c", "x", "y"]);
    }
}
