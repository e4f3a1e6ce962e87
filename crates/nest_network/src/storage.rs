//! Distributed storage lookup.
//!
//! A search tries the local store first, then asks every nest it knows about
//! (nearest first, through routing) until one of them answers. All hops of
//! one search share a [`TriedSet`], so no nest is asked twice.

use tracing::{debug, info, warn};

use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{MessageKind, Payload, TriedSet};
use crate::network::Network;
use crate::router::{Handler, handler_fn, sync_handler_fn};
use crate::routing::learned_nests_by_distance;

impl Network {
    /// Look `key` up from `from`, starting a fresh search with `from` as its
    /// origin.
    pub async fn lookup(&self, from: &NestId, key: &str) -> Result<String, NestError> {
        self.find_in_storage(from, key, TriedSet::with([from]), from)
            .await
    }

    /// One step of a storage search running at `at`.
    ///
    /// On a local hit the value is returned and, the first time the search
    /// finds the key, a `storageResponse` is routed to `origin` as well.
    /// Otherwise every known nest not yet in `tried` is marked and queried in
    /// turn; the first answer wins. Fails with
    /// [`NestError::NotFoundInStorage`] once every candidate is exhausted.
    pub async fn find_in_storage(
        &self,
        at: &NestId,
        key: &str,
        tried: TriedSet,
        origin: &NestId,
    ) -> Result<String, NestError> {
        let nest = self.nest(at)?;
        if let Some(value) = nest.read_storage(key) {
            debug!(nest = %at, key, "Found key in local storage");
            if tried.mark_found() {
                self.notify_origin(at, origin, key, &value);
            }
            return Ok(value);
        }
        tried.mark(at);

        let candidates = learned_nests_by_distance(at, &nest.learned_adjacency());
        for candidate in candidates {
            if !tried.mark(&candidate) {
                continue;
            }
            let query = Payload::StorageQuery {
                key: key.to_string(),
                tried: tried.clone(),
                origin: origin.clone(),
            };
            match self
                .route_request(at, &candidate, MessageKind::StorageQuery, query)
                .await
            {
                Ok(response) => return response.into_text(&MessageKind::StorageQuery),
                Err(e) if e.is_structural() => {
                    warn!(nest = %at, candidate = %candidate, key, "Storage query rejected: {e}")
                }
                Err(e) => debug!(nest = %at, candidate = %candidate, key, "Storage query failed: {e}"),
            }
        }
        Err(NestError::NotFoundInStorage(key.to_string()))
    }

    /// Route a `storageResponse` to the search origin without waiting for it.
    fn notify_origin(&self, at: &NestId, origin: &NestId, key: &str, value: &str) {
        let network = self.clone();
        let at = at.clone();
        let origin = origin.clone();
        let payload = Payload::StorageResponse {
            key: key.to_string(),
            value: value.to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = network
                .route_request(&at, &origin, MessageKind::StorageResponse, payload)
                .await
            {
                warn!(from = %at, origin = %origin, "Storage response not delivered: {e}");
            }
        });
    }
}

/// Handler for `storageQuery`: continue the search from the receiving nest.
pub(crate) fn query_handler() -> Handler {
    handler_fn(|ctx, content, _source| async move {
        let Payload::StorageQuery { key, tried, origin } = content else {
            return Err(NestError::UnexpectedPayload {
                kind: MessageKind::StorageQuery.dispatch_key(),
                expected: "storage query",
            });
        };
        let value = ctx
            .network
            .find_in_storage(ctx.id(), &key, tried, &origin)
            .await?;
        Ok(Payload::Value(value))
    })
}

/// Handler for `storageResponse`: remember the answer at the origin.
pub(crate) fn response_handler() -> Handler {
    sync_handler_fn(|ctx, content, source| {
        let Payload::StorageResponse { key, value } = content else {
            return Err(NestError::UnexpectedPayload {
                kind: MessageKind::StorageResponse.dispatch_key(),
                expected: "storage response",
            });
        };
        info!(nest = %ctx.id(), holder = %source, key, "Storage response received");
        ctx.nest.record_storage_response(key, value);
        Ok(Payload::Empty)
    })
}
