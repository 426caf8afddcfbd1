/// Periodic liveness checking.
///
/// The leader probes every view member and evicts the silent ones in one
/// batch. Every other server probes only the leader and starts an election
/// when it cannot be reached (or when no leader is known at all).
use crate::config::ClusterConfig;
use crate::election::Election;
use crate::messenger::Messenger;
use crate::network::Message;
use crate::state::ClusterState;
use crate::types::ServerDescriptor;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What one heartbeat round did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Leader round; lists the evicted members.
    ProbedView { evicted: Vec<String> },
    /// Follower round; the leader answered.
    LeaderAlive,
    /// Follower round; an election was run. `leader` is its result.
    Reelected { leader: Option<String> },
}

/// Runs heartbeat rounds for one server.
pub struct Heartbeat {
    state: Arc<ClusterState>,
    config: Arc<ClusterConfig>,
    messenger: Messenger,
    election: Arc<Election>,
}

impl Heartbeat {
    pub fn new(
        state: Arc<ClusterState>,
        config: Arc<ClusterConfig>,
        messenger: Messenger,
        election: Arc<Election>,
    ) -> Self {
        Self {
            state,
            config,
            messenger,
            election,
        }
    }

    /// Run one heartbeat round.
    pub async fn round(&self) -> HeartbeatOutcome {
        if self.state.is_leader_self() {
            let evicted = self.probe_view().await;
            return HeartbeatOutcome::ProbedView { evicted };
        }

        match self.state.leader() {
            Some(leader) if self.probe(&leader).await => {
                debug!(leader = %leader.server_id, "leader alive");
                HeartbeatOutcome::LeaderAlive
            }
            Some(leader) => {
                warn!(leader = %leader.server_id, "leader unreachable, starting election");
                self.state.remove_from_view(&[leader.server_id]);
                self.reelect().await
            }
            None => {
                info!("no leader known, starting election");
                self.reelect().await
            }
        }
    }

    async fn reelect(&self) -> HeartbeatOutcome {
        let leader = match self.election.run().await {
            Ok(leader) => Some(leader.server_id),
            Err(e) => {
                warn!(error = %e, "election from heartbeat failed");
                None
            }
        };
        HeartbeatOutcome::Reelected { leader }
    }

    /// Probe every view member concurrently and evict the failures.
    async fn probe_view(&self) -> Vec<String> {
        let members = self.state.view_snapshot();
        let probes = members.into_iter().map(|peer| async move {
            if self.probe(&peer).await {
                None
            } else {
                Some(peer.server_id)
            }
        });
        let failed: Vec<String> = join_all(probes).await.into_iter().flatten().collect();

        if failed.is_empty() {
            return failed;
        }
        let evicted = self.state.remove_from_view(&failed);
        info!(evicted = ?evicted, "removed unresponsive servers from view");
        evicted
    }

    /// Send `heartbeat` and wait for `heartbeatresponse`.
    async fn probe(&self, peer: &ServerDescriptor) -> bool {
        let ping = Message::Heartbeat {
            server_id: self.state.current().server_id.clone(),
        };
        match self
            .messenger
            .request(peer, &ping, self.config.probe_timeout, "heartbeatresponse")
            .await
        {
            Ok(Message::HeartbeatResponse { .. }) => true,
            Ok(other) => {
                warn!(peer = %peer.server_id, kind = other.kind(), "unexpected heartbeat reply");
                false
            }
            Err(e) => {
                debug!(peer = %peer.server_id, error = %e, "heartbeat probe failed");
                false
            }
        }
    }

    /// Run rounds every `heartbeat_interval` until shutdown is signalled.
    ///
    /// The first round fires one full interval after the call.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.heartbeat_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let outcome = self.round().await;
                    debug!(?outcome, "heartbeat round finished");
                }
                _ = shutdown.recv() => {
                    debug!("heartbeat stopped");
                    break;
                }
            }
        }
    }
}
