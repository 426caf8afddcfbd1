/// Fast Bully leader election.
///
/// # Initiator
///
/// 1. Send `election` to every higher-priority neighbour and collect the
///    ones that `answer` within the answer timeout.
/// 2. Nobody answered: this server is the most senior live process. It
///    becomes leader and announces `coordinator` to lower neighbours.
/// 3. Otherwise nominate responders, highest priority first, until one
///    replies `coordinator`. If every candidate stays silent the round
///    fails and a new round starts after a short jittered pause.
///
/// # Participant
///
/// A server receiving `election` answers at once, then waits for either a
/// `nomination` (it becomes leader) or a `coordinator` (adopt it). The wait
/// is long enough for every higher-priority candidate to be tried first.
/// If neither arrives and no leader gets announced by other means, it runs
/// its own election.
///
/// Rounds are bounded by `max_election_rounds`; exhausting them leaves the
/// node without a leader until the next heartbeat tick retries.
use crate::config::ClusterConfig;
use crate::error::{MeshError, MeshResult};
use crate::messenger::Messenger;
use crate::network::{Connection, Message};
use crate::state::ClusterState;
use crate::types::ServerDescriptor;
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Runs election rounds for one server.
pub struct Election {
    state: Arc<ClusterState>,
    config: Arc<ClusterConfig>,
    messenger: Messenger,
    /// Serializes local rounds so concurrent triggers share one election.
    round_lock: Mutex<()>,
}

impl Election {
    pub fn new(state: Arc<ClusterState>, config: Arc<ClusterConfig>, messenger: Messenger) -> Self {
        Self {
            state,
            config,
            messenger,
            round_lock: Mutex::new(()),
        }
    }

    /// Run an election until a leader is agreed or the round budget is spent.
    ///
    /// A caller that arrives while another local election is in flight waits
    /// for it and returns its outcome instead of starting a second one.
    pub async fn run(&self) -> MeshResult<ServerDescriptor> {
        let _round = match self.round_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let guard = self.round_lock.lock().await;
                if let Some(leader) = self.state.leader() {
                    return Ok(leader);
                }
                guard
            }
        };

        let rounds = self.config.max_election_rounds.max(1);
        for round in 1..=rounds {
            info!(
                server_id = %self.state.current().server_id,
                round,
                "starting election"
            );
            self.state.clear_leader();

            if let Some(leader) = self.run_round().await {
                info!(leader = %leader.server_id, round, "election finished");
                return Ok(leader);
            }
            if let Some(leader) = self.announced_leader(round) {
                return Ok(leader);
            }

            if round < rounds {
                let pause = {
                    let mut rng = rand::thread_rng();
                    Duration::from_millis(rng.gen_range(50..250))
                };
                warn!(round, ?pause, "no candidate confirmed leadership, restarting election");
                tokio::time::sleep(pause).await;
                if let Some(leader) = self.announced_leader(round) {
                    return Ok(leader);
                }
            }
        }

        warn!(rounds, "election did not converge, leader unknown until next heartbeat");
        Err(MeshError::LeaderUnavailable { attempts: rounds })
    }

    /// A `coordinator` adopted while a round was failing settles the election.
    fn announced_leader(&self, round: usize) -> Option<ServerDescriptor> {
        let leader = self.state.leader()?;
        info!(leader = %leader.server_id, round, "leader announced during election");
        Some(leader)
    }

    /// One announce/nominate round. `None` means every candidate failed.
    async fn run_round(&self) -> Option<ServerDescriptor> {
        let mut responders = self.collect_answers().await;

        if responders.is_empty() {
            info!("no higher-priority server answered, taking leadership");
            self.become_leader().await;
            return Some(self.state.current().clone());
        }

        // Highest priority first.
        responders.sort_by(|(a, _), (b, _)| b.priority.cmp(&a.priority));

        let me = self.state.current().server_id.clone();
        for (candidate, mut conn) in responders {
            debug!(candidate = %candidate.server_id, "sending nomination");
            let nomination = Message::Nomination {
                server_id: me.clone(),
            };
            match conn
                .request(&nomination, self.config.nomination_timeout, "coordinator")
                .await
            {
                Ok(Message::Coordinator { leader }) => match self.adopt(&leader) {
                    Ok(leader) => return Some(leader),
                    Err(e) => warn!(candidate = %candidate.server_id, error = %e, "ignoring coordinator reply"),
                },
                Ok(other) => {
                    warn!(candidate = %candidate.server_id, kind = other.kind(), "unexpected reply to nomination");
                }
                Err(e) => {
                    warn!(candidate = %candidate.server_id, error = %e, "nominee did not confirm");
                }
            }
        }
        None
    }

    /// Send `election` to every higher-priority neighbour concurrently and
    /// keep the connections of those that answered.
    async fn collect_answers(&self) -> Vec<(ServerDescriptor, Connection)> {
        let higher = self.state.higher_priority_neighbours();
        let probes = higher.into_iter().map(|peer| async move {
            let mut conn = match self.messenger.connect(&peer).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(peer = %peer.server_id, error = %e, "higher neighbour unreachable");
                    return None;
                }
            };
            match conn
                .request(&Message::Election, self.config.answer_timeout, "answer")
                .await
            {
                Ok(Message::Answer) => {
                    debug!(peer = %peer.server_id, "received answer");
                    self.state.add_to_view(&peer.server_id);
                    Some((peer, conn))
                }
                Ok(other) => {
                    warn!(peer = %peer.server_id, kind = other.kind(), "unexpected reply to election");
                    None
                }
                Err(e) => {
                    debug!(peer = %peer.server_id, error = %e, "no answer");
                    None
                }
            }
        });

        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Take leadership and tell every lower-priority neighbour.
    async fn become_leader(&self) {
        let me = self.state.current().clone();
        self.state.set_leader(me.clone());
        let announce = Message::Coordinator {
            leader: me.server_id,
        };
        let reached = self
            .messenger
            .broadcast_to_lower(&self.state, &announce, self.config.broadcast_deadline)
            .await;
        debug!(reached = ?reached, "announced leadership");
    }

    /// Adopt an announced leader. Ids outside the configuration are refused.
    pub fn adopt(&self, leader_id: &str) -> MeshResult<ServerDescriptor> {
        let leader = self
            .state
            .resolve(leader_id)
            .ok_or_else(|| MeshError::UnknownServer(leader_id.to_string()))?;
        self.state.add_to_view(leader_id);
        self.state.set_leader(leader.clone());
        info!(leader = leader_id, "adopted leader");
        Ok(leader)
    }

    /// Answer an `election` received on `conn`, then finish the exchange.
    pub async fn participate(self: &Arc<Self>, mut conn: Connection) -> MeshResult<()> {
        let mut leader_rx = self.state.subscribe_leader();
        leader_rx.borrow_and_update();

        conn.send(&Message::Answer).await?;
        debug!(peer = conn.peer_addr(), "answered election");

        // Every higher-priority server may be nominated before this one.
        let ahead = self.state.higher_priority_neighbours().len();
        let deadline = tokio::time::Instant::now() + self.config.nomination_window(ahead);
        match tokio::time::timeout_at(deadline, conn.receive()).await {
            Ok(Ok(Message::Nomination { server_id })) => {
                info!(nominated_by = %server_id, "nominated as leader");
                let me = self.state.current().clone();
                self.state.set_leader(me.clone());
                conn.send(&Message::Coordinator {
                    leader: me.server_id,
                })
                .await?;
                self.become_leader().await;
                return Ok(());
            }
            Ok(Ok(Message::Coordinator { leader })) => {
                return self.adopt(&leader).map(|_| ());
            }
            Ok(Ok(other)) => {
                warn!(kind = other.kind(), "unexpected message during election");
            }
            Ok(Err(e)) => {
                debug!(error = %e, "initiator closed election connection");
            }
            Err(_) => {
                debug!("no nomination or coordinator in time");
            }
        }

        // The initiator may have settled on someone else, who then
        // announces through a separate connection.
        let announced = tokio::time::timeout_at(deadline, leader_rx.changed()).await;
        if matches!(announced, Ok(Ok(()))) && self.state.leader().is_some() {
            return Ok(());
        }

        info!("no leader announced after answering, starting own election");
        let election = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = election.run().await {
                warn!(error = %e, "election started by participant failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Listener;
    use std::collections::HashMap;

    fn server(id: &str, coordination_port: u16) -> ServerDescriptor {
        ServerDescriptor::new(id, "127.0.0.1", 0, coordination_port).unwrap()
    }

    fn test_config() -> Arc<ClusterConfig> {
        Arc::new(
            ClusterConfig::new()
                .peer_timeouts(Duration::from_millis(200))
                .max_election_rounds(2),
        )
    }

    fn build(current: ServerDescriptor, neighbours: Vec<ServerDescriptor>) -> Arc<Election> {
        let neighbours: HashMap<_, _> = neighbours
            .into_iter()
            .map(|d| (d.server_id.clone(), d))
            .collect();
        let state = Arc::new(ClusterState::new(current, neighbours));
        Arc::new(Election::new(
            state,
            test_config(),
            Messenger::new(Duration::from_millis(200)),
        ))
    }

    async fn dead_port() -> u16 {
        Listener::bind("127.0.0.1:0").await.unwrap().local_addr().port()
    }

    #[tokio::test]
    async fn test_no_higher_neighbours_self_elects() {
        let election = build(server("s3", 1), vec![server("s1", dead_port().await)]);
        let leader = election.run().await.unwrap();
        assert_eq!(leader.server_id, "s3");
        assert!(election.state.is_leader_self());
    }

    #[tokio::test]
    async fn test_unreachable_higher_neighbours_self_elects() {
        let election = build(server("s1", 1), vec![server("s2", dead_port().await)]);
        let leader = election.run().await.unwrap();
        assert_eq!(leader.server_id, "s1");
    }

    #[tokio::test]
    async fn test_nominee_confirms_leadership() {
        // A scripted higher-priority peer: answer, then confirm nomination.
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().port();
        tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            assert_eq!(conn.receive().await.unwrap(), Message::Election);
            conn.send(&Message::Answer).await.unwrap();
            match conn.receive().await.unwrap() {
                Message::Nomination { server_id } => assert_eq!(server_id, "s1"),
                other => panic!("Expected nomination, got {:?}", other),
            }
            conn.send(&Message::Coordinator {
                leader: "s2".to_string(),
            })
            .await
            .unwrap();
        });

        let election = build(server("s1", 1), vec![server("s2", port)]);
        let leader = election.run().await.unwrap();
        assert_eq!(leader.server_id, "s2");
        assert!(election.state.in_view("s2"));
    }

    #[tokio::test]
    async fn test_silent_nominees_exhaust_rounds() {
        // Answers every election but never confirms a nomination.
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().port();
        tokio::spawn(async move {
            while let Ok(mut conn) = listener.accept().await {
                tokio::spawn(async move {
                    if conn.receive().await.is_ok() {
                        let _ = conn.send(&Message::Answer).await;
                        let _ = conn.receive().await;
                    }
                });
            }
        });

        let election = build(server("s1", 1), vec![server("s2", port)]);
        let err = election.run().await.unwrap_err();
        assert!(matches!(err, MeshError::LeaderUnavailable { attempts: 2 }));
        assert!(election.state.leader().is_none());
    }

    #[tokio::test]
    async fn test_silent_top_candidate_falls_through_to_next() {
        // s3 answers late and then ignores its nomination.
        let silent = Listener::bind("127.0.0.1:0").await.unwrap();
        let silent_port = silent.local_addr().port();
        tokio::spawn(async move {
            let mut conn = silent.accept().await.unwrap();
            assert_eq!(conn.receive().await.unwrap(), Message::Election);
            tokio::time::sleep(Duration::from_millis(100)).await;
            conn.send(&Message::Answer).await.unwrap();
            let _ = conn.receive().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        // s2 runs the real participant side.
        let live = Listener::bind("127.0.0.1:0").await.unwrap();
        let live_port = live.local_addr().port();
        let s2 = build(server("s2", live_port), vec![server("s3", silent_port)]);
        let participant = Arc::clone(&s2);
        tokio::spawn(async move {
            let mut conn = live.accept().await.unwrap();
            assert_eq!(conn.receive().await.unwrap(), Message::Election);
            participant.participate(conn).await.unwrap();
        });

        let s1 = build(
            server("s1", 1),
            vec![server("s2", live_port), server("s3", silent_port)],
        );
        let leader = s1.run().await.unwrap();
        assert_eq!(leader.server_id, "s2");
        assert!(s2.state.is_leader_self());
    }

    #[tokio::test]
    async fn test_coordinator_during_failed_round_settles_election() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().port();
        tokio::spawn(async move {
            while let Ok(mut conn) = listener.accept().await {
                tokio::spawn(async move {
                    if conn.receive().await.is_ok() {
                        let _ = conn.send(&Message::Answer).await;
                        let _ = conn.receive().await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                });
            }
        });

        let election = build(
            server("s1", 1),
            vec![server("s2", port), server("s3", dead_port().await)],
        );
        let announcer = Arc::clone(&election);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            announcer.adopt("s3").unwrap();
        });

        let leader = election.run().await.unwrap();
        assert_eq!(leader.server_id, "s3");
        assert_eq!(election.state.leader().unwrap().server_id, "s3");
    }

    #[tokio::test]
    async fn test_participant_without_nomination_runs_own_election() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        let election = build(server("s2", 1), vec![]);

        let participant = Arc::clone(&election);
        let done = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            participant.participate(conn).await.unwrap();
        });

        // Answer received, then the initiator goes quiet.
        let mut conn = Connection::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        conn.request(&Message::Election, Duration::from_secs(1), "answer")
            .await
            .unwrap();
        assert!(election.state.leader().is_none());

        tokio::time::timeout(Duration::from_secs(2), done)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(election.state.is_leader_self());
        drop(conn);
    }

    #[tokio::test]
    async fn test_participant_accepts_nomination() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        let election = build(server("s3", 1), vec![]);

        let participant = Arc::clone(&election);
        tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            participant.participate(conn).await.unwrap();
        });

        let mut conn = Connection::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        let answer = conn
            .request(&Message::Election, Duration::from_secs(1), "answer")
            .await
            .unwrap();
        assert_eq!(answer, Message::Answer);

        let reply = conn
            .request(
                &Message::Nomination {
                    server_id: "s1".to_string(),
                },
                Duration::from_secs(1),
                "coordinator",
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            Message::Coordinator {
                leader: "s3".to_string()
            }
        );
        assert!(election.state.is_leader_self());
    }

    #[tokio::test]
    async fn test_participant_adopts_coordinator() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        let election = build(server("s2", 1), vec![server("s4", 2)]);

        let participant = Arc::clone(&election);
        let done = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            participant.participate(conn).await.unwrap();
        });

        let mut conn = Connection::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        conn.request(&Message::Election, Duration::from_secs(1), "answer")
            .await
            .unwrap();
        conn.send(&Message::Coordinator {
            leader: "s4".to_string(),
        })
        .await
        .unwrap();

        done.await.unwrap();
        assert_eq!(election.state.leader().unwrap().server_id, "s4");
    }
}
