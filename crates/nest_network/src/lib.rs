//! Nest Network: a simulated network of communicating nests.
//!
//! Each nest only talks to its direct neighbors. On top of that single-hop
//! request/response primitive the crate builds multi-hop routing, gossip
//! flooding, link-state connection propagation and a distributed storage
//! search.
//!
//! # Architecture
//!
//! - **Transport**: every nest runs as a tokio task with its own inbox;
//!   links add random latency and can lose messages.
//! - **Requests**: a request is retried up to three times with a per-attempt
//!   timeout; late replies to an abandoned attempt are discarded.
//! - **Routing**: handler-based dispatch keyed by [`MessageKind`], and
//!   gateway discovery over the topology each nest has learned.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use nest_network::{MessageKind, Network, NestId, Payload, Topology};
//!
//! # async fn example() -> Result<(), nest_network::NestError> {
//! let topology = Topology::from_edges(&["A-B", "B-C"])?;
//! let network = topology.build(Default::default())?;
//! network.start();
//!
//! let reply = network
//!     .send_request(&NestId::from("A"), &NestId::from("B"), MessageKind::Ping, Payload::Empty)
//!     .await?;
//! assert_eq!(reply, Payload::text("pong"));
//! network.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connections;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod message;
pub mod nest;
pub mod network;
pub mod registry;
mod request;
pub mod router;
pub mod routing;
pub mod storage;
pub mod topology;
mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use error::NestError;
pub use gossip::GossipOutcome;
pub use identity::NestId;
pub use message::{ConnectionsSnapshot, Envelope, MessageKind, Payload, TriedSet};
pub use nest::{ConnectionEntry, Nest, NestStats};
pub use network::Network;
pub use router::{Handler, NestContext};
pub use topology::Topology;
