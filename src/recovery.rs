/// Startup recovery.
///
/// Runs once before the node accepts traffic. It discovers which neighbours
/// are already alive, rebuilds the view from their reports, picks the
/// leader among the responders and pulls the global registries so a
/// restarted server converges with the cluster.
use crate::config::ClusterConfig;
use crate::messenger::Messenger;
use crate::network::Message;
use crate::state::ClusterState;
use crate::types::{ServerDescriptor, main_hall};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a recovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Agreed leader after recovery.
    pub leader: String,
    /// Neighbours that answered `iamup`.
    pub responders: Vec<String>,
    /// Servers added to the view.
    pub discovered: Vec<String>,
    /// Identities and rooms newly merged from a `globals` snapshot.
    pub merged_clients: usize,
    pub merged_rooms: usize,
}

pub struct Recovery {
    state: Arc<ClusterState>,
    config: Arc<ClusterConfig>,
    messenger: Messenger,
}

impl Recovery {
    pub fn new(state: Arc<ClusterState>, config: Arc<ClusterConfig>, messenger: Messenger) -> Self {
        Self {
            state,
            config,
            messenger,
        }
    }

    /// Run the recovery protocol. Every wait is bounded by `recovery_window`.
    pub async fn recover(&self) -> RecoveryOutcome {
        let me = self.state.current().clone();
        let replies = self.announce().await;

        if replies.is_empty() {
            info!(server_id = %me.server_id, "no neighbours answered, starting as leader of a fresh cluster");
            self.state.set_leader(me.clone());
            return RecoveryOutcome {
                leader: me.server_id,
                responders: Vec::new(),
                discovered: Vec::new(),
                merged_clients: 0,
                merged_rooms: 0,
            };
        }

        let responders: Vec<ServerDescriptor> = replies.iter().map(|(d, _)| d.clone()).collect();
        let discovered = self.reconcile_view(&replies);

        // Only responders can lead; unreachable peers are out of the running.
        let leader = responders
            .iter()
            .chain(std::iter::once(&me))
            .max_by_key(|d| d.priority)
            .cloned()
            .unwrap_or_else(|| me.clone());

        self.state.set_leader(leader.clone());
        info!(leader = %leader.server_id, responders = responders.len(), "recovered leader");

        let source = if leader == me {
            let announce = Message::Coordinator {
                leader: me.server_id.clone(),
            };
            self.messenger
                .broadcast_to_lower(&self.state, &announce, self.config.broadcast_deadline)
                .await;
            // The previous leader's registries live on the most senior responder.
            responders.iter().max_by_key(|d| d.priority).cloned()
        } else {
            Some(leader.clone())
        };

        let (merged_clients, merged_rooms) = match source {
            Some(source) => self.pull_globals(&source).await,
            None => (0, 0),
        };

        RecoveryOutcome {
            leader: leader.server_id,
            responders: responders.into_iter().map(|d| d.server_id).collect(),
            discovered,
            merged_clients,
            merged_rooms,
        }
    }

    /// Send `iamup` to every neighbour and collect the `view` replies.
    async fn announce(&self) -> Vec<(ServerDescriptor, Vec<String>)> {
        let iamup = Message::IamUp {
            server_id: self.state.current().server_id.clone(),
        };
        let window = self.config.recovery_window;

        let probes = self.state.neighbours().into_iter().map(|peer| {
            let iamup = &iamup;
            async move {
                let reply = tokio::time::timeout(
                    window,
                    self.messenger.request(&peer, iamup, window, "view"),
                )
                .await;
                match reply {
                    Ok(Ok(Message::View { views })) => {
                        debug!(peer = %peer.server_id, views = ?views, "received view");
                        Some((peer, views))
                    }
                    Ok(Ok(other)) => {
                        warn!(peer = %peer.server_id, kind = other.kind(), "unexpected reply to iamup");
                        None
                    }
                    Ok(Err(e)) => {
                        debug!(peer = %peer.server_id, error = %e, "neighbour not up");
                        None
                    }
                    Err(_) => {
                        debug!(peer = %peer.server_id, "iamup timed out");
                        None
                    }
                }
            }
        });

        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Add `(reported ∪ responders) − view − self` to the view and register
    /// each newly discovered server's main hall.
    fn reconcile_view(&self, replies: &[(ServerDescriptor, Vec<String>)]) -> Vec<String> {
        let me = &self.state.current().server_id;
        let known: HashSet<String> = self.state.view_ids().into_iter().collect();

        let mut candidates: HashSet<String> = HashSet::new();
        for (responder, views) in replies {
            candidates.insert(responder.server_id.clone());
            candidates.extend(views.iter().cloned());
        }

        let mut discovered: Vec<String> = candidates
            .difference(&known)
            .filter(|id| *id != me)
            .filter(|id| self.state.add_to_view(id))
            .cloned()
            .collect();
        discovered.sort();

        for server_id in &discovered {
            self.state.add_global_room(&main_hall(server_id), server_id);
        }
        if !discovered.is_empty() {
            info!(discovered = ?discovered, "view reconciled");
        }
        discovered
    }

    /// Fetch a `globals` snapshot from `source` and union-merge it.
    async fn pull_globals(&self, source: &ServerDescriptor) -> (usize, usize) {
        let reply = self
            .messenger
            .request(
                source,
                &Message::globals_request(),
                self.config.request_timeout,
                "globals",
            )
            .await;

        match reply {
            Ok(Message::Globals { clients, chatrooms }) => {
                let merged_clients = self
                    .state
                    .merge_global_clients(clients.unwrap_or_default());
                let merged_rooms = self
                    .state
                    .merge_global_rooms(chatrooms.unwrap_or_default());
                info!(
                    source = %source.server_id,
                    merged_clients,
                    merged_rooms,
                    "merged global registries"
                );
                (merged_clients, merged_rooms)
            }
            Ok(other) => {
                warn!(source = %source.server_id, kind = other.kind(), "unexpected reply to globals");
                (0, 0)
            }
            Err(e) => {
                warn!(source = %source.server_id, error = %e, "could not fetch global registries");
                (0, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Listener;
    use std::collections::HashMap;
    use std::time::Duration;

    fn server(id: &str, coordination_port: u16) -> ServerDescriptor {
        ServerDescriptor::new(id, "127.0.0.1", 0, coordination_port).unwrap()
    }

    /// A peer that answers `iamup` with `views` and `globals` with a fixed
    /// registry.
    async fn scripted_peer(views: Vec<&'static str>) -> u16 {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().port();
        tokio::spawn(async move {
            while let Ok(mut conn) = listener.accept().await {
                let reply = match conn.receive().await {
                    Ok(Message::IamUp { .. }) => Message::View {
                        views: views.iter().map(|v| v.to_string()).collect(),
                    },
                    Ok(Message::Globals { .. }) => Message::Globals {
                        clients: Some(vec!["alice".to_string()]),
                        chatrooms: Some(HashMap::from([(
                            "jokes".to_string(),
                            "s3".to_string(),
                        )])),
                    },
                    _ => continue,
                };
                let _ = conn.send(&reply).await;
            }
        });
        port
    }

    async fn dead_port() -> u16 {
        Listener::bind("127.0.0.1:0").await.unwrap().local_addr().port()
    }

    fn build(current: ServerDescriptor, neighbours: Vec<ServerDescriptor>) -> Recovery {
        let neighbours: HashMap<_, _> = neighbours
            .into_iter()
            .map(|d| (d.server_id.clone(), d))
            .collect();
        let config = ClusterConfig::new()
            .peer_timeouts(Duration::from_millis(300))
            .recovery_window(Duration::from_millis(300));
        Recovery::new(
            Arc::new(ClusterState::new(current, neighbours)),
            Arc::new(config),
            Messenger::new(Duration::from_millis(300)),
        )
    }

    #[tokio::test]
    async fn test_alone_becomes_leader_with_empty_registries() {
        let recovery = build(server("s1", 1), vec![server("s2", dead_port().await)]);
        let outcome = recovery.recover().await;

        assert_eq!(outcome.leader, "s1");
        assert!(outcome.responders.is_empty());
        assert!(recovery.state.is_leader_self());
        assert!(recovery.state.global_clients().is_empty());
        assert!(recovery.state.view_ids().is_empty());
    }

    #[tokio::test]
    async fn test_adopts_highest_responder_and_merges_globals() {
        let s3 = scripted_peer(vec!["s1"]).await;
        let s1 = scripted_peer(vec!["s3"]).await;
        let recovery = build(
            server("s2", 1),
            vec![server("s1", s1), server("s3", s3), server("s4", dead_port().await)],
        );

        let outcome = recovery.recover().await;
        assert_eq!(outcome.leader, "s3");
        assert_eq!(outcome.discovered, vec!["s1", "s3"]);
        assert_eq!(outcome.merged_clients, 1);

        assert!(!recovery.state.is_leader_self());
        assert_eq!(recovery.state.view_ids(), vec!["s3", "s1"]);
        assert!(recovery.state.is_global_client("alice"));
        assert_eq!(recovery.state.room_owner("jokes"), Some("s3".to_string()));
        assert_eq!(
            recovery.state.room_owner("MainHall-s1"),
            Some("s1".to_string())
        );
    }

    #[tokio::test]
    async fn test_senior_restart_takes_leadership_and_keeps_registries() {
        let s2 = scripted_peer(vec![]).await;
        let recovery = build(server("s5", 1), vec![server("s2", s2)]);

        let outcome = recovery.recover().await;
        assert_eq!(outcome.leader, "s5");
        assert!(recovery.state.is_leader_self());
        assert!(recovery.state.is_global_client("alice"));
    }

    #[tokio::test]
    async fn test_reported_unknown_ids_are_ignored() {
        let s3 = scripted_peer(vec!["s1", "s42", "s2"]).await;
        let recovery = build(server("s2", 1), vec![server("s3", s3)]);

        let outcome = recovery.recover().await;
        // s1 and s42 are not configured neighbours; s2 is self.
        assert_eq!(outcome.discovered, vec!["s3"]);
    }
}
