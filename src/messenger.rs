/// Peer messenger and broadcaster.
///
/// Every call opens a fresh connection, exchanges at most one request and
/// one reply, and closes it. Nothing is pooled; this is control-plane
/// traffic.
///
/// Broadcasting fans out to the current view with bounded concurrency and
/// evicts every member whose send fails, so a broadcast doubles as a cheap
/// failure probe.
use crate::error::MeshResult;
use crate::network::{Connection, Message};
use crate::state::ClusterState;
use crate::types::ServerDescriptor;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum number of concurrent sends in one fan-out.
const FANOUT_CONCURRENCY: usize = 16;

/// Opens short-lived connections to peers.
#[derive(Debug, Clone, Copy)]
pub struct Messenger {
    connect_timeout: Duration,
}

impl Messenger {
    /// Create a messenger that bounds every connect by `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open a connection for a multi-step exchange (election rounds).
    pub async fn connect(&self, peer: &ServerDescriptor) -> MeshResult<Connection> {
        Connection::connect(&peer.coordination_addr(), self.connect_timeout).await
    }

    /// Fire-and-forget: connect, send one record, close.
    pub async fn send(&self, peer: &ServerDescriptor, message: &Message) -> MeshResult<()> {
        let mut conn = self.connect(peer).await?;
        conn.send(message).await?;
        debug!(peer = %peer.server_id, kind = message.kind(), "sent message");
        Ok(())
    }

    /// Send one record and wait up to `timeout` for the single reply.
    pub async fn request(
        &self,
        peer: &ServerDescriptor,
        message: &Message,
        timeout: Duration,
        operation: &'static str,
    ) -> MeshResult<Message> {
        let mut conn = self.connect(peer).await?;
        let reply = conn.request(message, timeout, operation).await?;
        debug!(
            peer = %peer.server_id,
            sent = message.kind(),
            received = reply.kind(),
            "request completed"
        );
        Ok(reply)
    }

    /// Send `message` to every view member concurrently.
    ///
    /// The whole fan-out is bounded by `deadline`: a send still pending or
    /// not yet started when it expires counts as failed. Members whose send
    /// failed are removed from the view in one batch once the fan-out
    /// finishes; their ids are returned.
    pub async fn broadcast(
        &self,
        state: &ClusterState,
        message: &Message,
        deadline: Duration,
    ) -> Vec<String> {
        let members = state.view_snapshot();
        if members.is_empty() {
            return Vec::new();
        }

        let expires = Instant::now() + deadline;
        let failed: Vec<String> = stream::iter(members)
            .map(|peer| async move {
                let outcome = tokio::time::timeout_at(expires, self.send(&peer, message)).await;
                match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        warn!(peer = %peer.server_id, error = %e, "broadcast send failed");
                        Some(peer.server_id)
                    }
                    Err(_) => {
                        warn!(peer = %peer.server_id, "broadcast send timed out");
                        Some(peer.server_id)
                    }
                }
            })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .filter_map(|failed| async move { failed })
            .collect()
            .await;

        if !failed.is_empty() {
            let evicted = state.remove_from_view(&failed);
            info!(evicted = ?evicted, kind = message.kind(), "evicted unreachable servers after broadcast");
        }
        failed
    }

    /// Send `message` to every configured neighbour with lower priority.
    ///
    /// Used to announce a new leader. Like [`Messenger::broadcast`], the
    /// whole fan-out shares one `deadline`. Neighbours that receive it are known
    /// to be alive and join the view; failures are only logged. Returns the
    /// ids that were reached.
    pub async fn broadcast_to_lower(
        &self,
        state: &ClusterState,
        message: &Message,
        deadline: Duration,
    ) -> Vec<String> {
        let targets = state.lower_priority_neighbours();

        let expires = Instant::now() + deadline;
        let reached: Vec<String> = stream::iter(targets)
            .map(|peer| async move {
                match tokio::time::timeout_at(expires, self.send(&peer, message)).await {
                    Ok(Ok(())) => Some(peer.server_id),
                    Ok(Err(e)) => {
                        debug!(peer = %peer.server_id, error = %e, "lower neighbour unreachable");
                        None
                    }
                    Err(_) => {
                        debug!(peer = %peer.server_id, "lower neighbour timed out");
                        None
                    }
                }
            })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .filter_map(|reached| async move { reached })
            .collect()
            .await;

        for server_id in &reached {
            state.add_to_view(server_id);
        }
        reached
    }
}
