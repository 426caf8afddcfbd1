/// Coordination node lifecycle.
///
/// A `CoordinatorNode` wires the components of one server together:
///
/// 1. recovery runs first, before any peer traffic is served
/// 2. the peer listener accepts one request per connection and hands it to
///    the [`PeerHandler`]
/// 3. a heartbeat task runs until shutdown
///
/// The application layer talks to the cluster through
/// [`CoordinatorNode::coordinator`] and reads state through
/// [`CoordinatorNode::state`].
use crate::config::{ClusterConfig, Topology};
use crate::election::Election;
use crate::error::{MeshError, MeshResult};
use crate::handler::PeerHandler;
use crate::heartbeat::{Heartbeat, HeartbeatOutcome};
use crate::messenger::Messenger;
use crate::network::Listener;
use crate::recovery::{Recovery, RecoveryOutcome};
use crate::registry::Coordinator;
use crate::state::ClusterState;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

/// One server's coordination subsystem.
pub struct CoordinatorNode {
    config: Arc<ClusterConfig>,
    state: Arc<ClusterState>,
    messenger: Messenger,
    election: Arc<Election>,
    coordinator: Arc<Coordinator>,
    /// Shutdown signal sender.
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<RwLock<bool>>,
    /// Bound peer address (differs from the topology when port 0 was used).
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    started_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl CoordinatorNode {
    /// Build a node from a loaded topology. Nothing runs until [`Self::start`].
    pub fn new(topology: Topology, config: ClusterConfig) -> Self {
        let config = Arc::new(config);
        let state = Arc::new(ClusterState::new(topology.current, topology.neighbours));
        let messenger = Messenger::new(config.connect_timeout);
        let election = Arc::new(Election::new(
            Arc::clone(&state),
            Arc::clone(&config),
            messenger,
        ));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&state),
            Arc::clone(&config),
            messenger,
            Arc::clone(&election),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            state,
            messenger,
            election,
            coordinator,
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
            local_addr: Arc::new(RwLock::new(None)),
            started_at: Arc::new(RwLock::new(None)),
        }
    }

    /// This server's id.
    pub fn server_id(&self) -> &str {
        &self.state.current().server_id
    }

    /// Shared cluster state.
    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    /// Registry operations for the application layer.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }

    /// Bound peer address, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Bind the coordination port from the topology and start.
    pub async fn start(&self) -> MeshResult<RecoveryOutcome> {
        let port = self.state.current().coordination_port;
        let listener = Listener::bind(&format!("0.0.0.0:{}", port)).await?;
        self.start_with_listener(listener).await
    }

    /// Start on an already bound listener.
    ///
    /// Runs recovery, then spawns the accept loop and the heartbeat task.
    pub async fn start_with_listener(&self, listener: Listener) -> MeshResult<RecoveryOutcome> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(MeshError::AlreadyRunning);
            }
            *running = true;
        }
        *self.local_addr.write().await = Some(listener.local_addr());
        *self.started_at.write().await = Some(Utc::now());

        let current = self.state.current().clone();
        self.state
            .add_global_room(&current.main_hall(), &current.server_id);

        let recovery = Recovery::new(
            Arc::clone(&self.state),
            Arc::clone(&self.config),
            self.messenger,
        );
        let outcome = recovery.recover().await;
        info!(
            server_id = %current.server_id,
            leader = %outcome.leader,
            view = ?self.state.view_ids(),
            "recovery complete"
        );

        // Accept loop.
        let handler = PeerHandler::new(
            Arc::clone(&self.state),
            Arc::clone(&self.config),
            Arc::clone(&self.election),
            Arc::clone(&self.coordinator),
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok(conn) => {
                                let handler = handler.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handler.handle(conn).await {
                                        debug!(error = %e, "peer connection error");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("peer listener stopped");
                        break;
                    }
                }
            }
        });

        // Heartbeat task.
        tokio::spawn(self.heartbeat().run(self.shutdown_tx.subscribe()));

        Ok(outcome)
    }

    /// Run a single heartbeat round immediately.
    pub async fn heartbeat_now(&self) -> HeartbeatOutcome {
        self.heartbeat().round().await
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(
            Arc::clone(&self.state),
            Arc::clone(&self.config),
            self.messenger,
            Arc::clone(&self.election),
        )
    }

    /// Stop the listener and heartbeat task.
    pub async fn stop(&self) -> MeshResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;

        let _ = self.shutdown_tx.send(());
        info!(server_id = %self.server_id(), "node stopped");
        Ok(())
    }

    /// Snapshot of this node's view of the cluster.
    pub async fn status(&self) -> ClusterStatus {
        let leader = self.state.leader();
        let (pending_clients, pending_rooms) = self.state.pending_counts();

        ClusterStatus {
            server_id: self.server_id().to_string(),
            is_leader: self.state.is_leader_self(),
            leader: leader.map(|l| l.server_id),
            view: self.state.view_ids(),
            global_clients: self.state.global_clients().len(),
            global_rooms: self.state.global_rooms().len(),
            pending_clients,
            pending_rooms,
            is_running: *self.running.read().await,
            started_at: *self.started_at.read().await,
        }
    }
}

/// Cluster status information.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub server_id: String,
    /// Agreed leader, `None` while an election is running or failed.
    pub leader: Option<String>,
    pub is_leader: bool,
    /// View members, highest priority first.
    pub view: Vec<String>,
    pub global_clients: usize,
    pub global_rooms: usize,
    pub pending_clients: usize,
    pub pending_rooms: usize,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_servers;
    use std::time::Duration;

    fn single_node() -> CoordinatorNode {
        let entries = parse_servers("s1 127.0.0.1 4000 0\n").unwrap();
        let topology = Topology::from_entries(entries, "s1").unwrap();
        CoordinatorNode::new(
            topology,
            ClusterConfig::new()
                .peer_timeouts(Duration::from_millis(200))
                .recovery_window(Duration::from_millis(200)),
        )
    }

    #[tokio::test]
    async fn test_node_creation() {
        let node = single_node();
        assert_eq!(node.server_id(), "s1");
        assert!(!node.is_running().await);
        assert!(node.local_addr().await.is_none());

        let status = node.status().await;
        assert!(!status.is_running);
        assert!(status.leader.is_none());
        assert!(status.started_at.is_none());
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let node = single_node();
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();

        let outcome = node.start_with_listener(listener).await.unwrap();
        assert_eq!(outcome.leader, "s1");
        assert!(node.is_running().await);

        let status = node.status().await;
        assert!(status.is_leader);
        assert_eq!(status.global_rooms, 1);
        assert!(status.started_at.is_some());
        assert_eq!(
            node.state().room_owner("MainHall-s1"),
            Some("s1".to_string())
        );

        node.stop().await.unwrap();
        assert!(!node.is_running().await);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let node = single_node();
        node.start_with_listener(Listener::bind("127.0.0.1:0").await.unwrap())
            .await
            .unwrap();

        let again = node
            .start_with_listener(Listener::bind("127.0.0.1:0").await.unwrap())
            .await;
        assert!(matches!(again, Err(MeshError::AlreadyRunning)));
        node.stop().await.unwrap();
    }
}
