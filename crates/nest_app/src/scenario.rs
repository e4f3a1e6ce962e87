//! The operations `nestsim` can run against a started network.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use nest_network::{GossipOutcome, MessageKind, NestId, Network, Payload};

/// Reply to application messages with what was heard and from whom.
pub fn install_message_handler(network: &Network) {
    network.define_sync_handler(MessageKind::Message, |ctx, content, source| {
        let text = content.into_text(&MessageKind::Message)?;
        info!(nest = %ctx.id(), from = %source, "Message: {text}");
        Ok(Payload::text(format!("{} heard \"{text}\" from {source}", ctx.id())))
    });
}

pub async fn route(network: &Network, from: &str, to: &str, message: &str) -> Result<String> {
    let (from, to) = (NestId::from(from), NestId::from(to));
    let gateway = network
        .find_gateway(&from, &to)
        .with_context(|| format!("No way from {from} to {to}"))?;
    info!(from = %from, to = %to, gateway = %gateway, "Routing message");
    network
        .route_request(&from, &to, MessageKind::Message, Payload::text(message))
        .await
        .and_then(|reply| reply.into_text(&MessageKind::Message))
        .with_context(|| format!("Routing from {from} to {to} failed"))
}

pub async fn lookup(network: &Network, from: &str, key: &str) -> Result<String> {
    network
        .lookup(&NestId::from(from), key)
        .await
        .with_context(|| format!("Lookup of '{key}' from {from} failed"))
}

/// Run every protocol once against the network and print what happened.
pub async fn demo(network: &Network) -> Result<()> {
    let ids = network.nest_ids();
    let first = ids.first().context("Topology has no nests")?.clone();
    let last = ids.last().context("Topology has no nests")?.clone();

    if let Some(neighbor) = network.neighbors(&first)?.into_iter().next() {
        let reply = network
            .send_request(&first, &neighbor, MessageKind::Ping, Payload::Empty)
            .await
            .context("Ping failed")?;
        println!("ping {first} -> {neighbor}: {reply:?}");
    }

    if first != last {
        let reply = route(network, first.as_str(), last.as_str(), "caw caw").await?;
        println!("route {first} -> {last}: {reply}");
    }

    let rumor = format!("{first} saw a fox");
    if let GossipOutcome::Flooded { sent } = network.send_gossip(&first, rumor.clone())? {
        info!(sent, "Gossip started");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let heard = network
        .nests()
        .iter()
        .filter(|nest| nest.has_seen_gossip(&rumor))
        .count();
    println!("gossip from {first}: heard by {heard}/{} nests", ids.len());

    for key in ["treasure", "food caches", "enemies", "no such thing"] {
        match lookup(network, first.as_str(), key).await {
            Ok(value) => println!("lookup '{key}' from {first}: {value}"),
            Err(e) => println!("lookup '{key}' from {first}: {e:#}"),
        }
    }

    for nest in network.nests() {
        let stats = nest.stats();
        println!(
            "{:<20} handled={:<4} joined={:<3} dropped={:<3} gossip={}/{} snapshots={}/{}",
            nest.id(),
            stats.requests_handled,
            stats.requests_joined,
            stats.messages_dropped,
            stats.gossip_accepted,
            stats.gossip_duplicates,
            stats.snapshots_accepted,
            stats.snapshots_dropped,
        );
    }
    Ok(())
}
