/// Global Registry Coordinator.
///
/// Client identities and room ids are unique cluster-wide because every
/// creation is arbitrated by the leader in two steps:
///
/// 1. **Check**: the requesting server asks the leader whether the key is
///    free. The leader atomically reserves it as *pending* and approves, or
///    denies when it is already global or pending.
/// 2. **Confirm**: once the requester has created the object it tells the
///    leader, which promotes the reservation to global and broadcasts the
///    fact to every server in its view.
///
/// When this server is the leader both steps run locally against the same
/// atomic reservation, so local and remote creations cannot both win.
///
/// Deletions are not arbitrated: the deleting server broadcasts directly.
///
/// Any step that cannot reach the leader triggers an election and retries
/// up to `leader_retries` times, then fails with
/// [`MeshError::LeaderUnavailable`].
use crate::config::ClusterConfig;
use crate::election::Election;
use crate::error::{MeshError, MeshResult};
use crate::messenger::Messenger;
use crate::network::{APPROVED, Message};
use crate::state::ClusterState;
use crate::types::ServerDescriptor;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a leader-directed message ended up.
enum Routed {
    /// This server is the leader; the caller handles it locally.
    Local,
    /// The leader answered.
    Replied { leader: String, reply: Message },
    /// Delivered without waiting for a reply.
    Sent,
}

/// Requester and leader sides of the registry protocol.
pub struct Coordinator {
    state: Arc<ClusterState>,
    config: Arc<ClusterConfig>,
    messenger: Messenger,
    election: Arc<Election>,
}

impl Coordinator {
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

    // ─────────────────────────────────────────────────────────────────────
    // Requesting server
    // ─────────────────────────────────────────────────────────────────────

    /// Ask whether `identity` may be created. `Ok(false)` means it is taken.
    pub async fn request_identity(&self, identity: &str) -> MeshResult<bool> {
        let me = self.state.current().server_id.clone();
        let check = Message::identity_check(identity, &me);

        match self.route_to_leader(&check, Some("newidentity")).await? {
            Routed::Local => Ok(self.check_identity(identity)),
            Routed::Replied {
                leader,
                reply:
                    Message::NewIdentity {
                        identity: echoed,
                        approved,
                        server_id,
                        ..
                    },
            } if echoed == identity => {
                let approved = approved.as_deref() == Some(APPROVED);
                debug!(identity, approved, "leader verdict");
                if !approved {
                    self.note_denial(identity, &leader, server_id.as_deref());
                }
                Ok(approved)
            }
            Routed::Replied { reply, .. } => Err(unexpected_reply("newidentity", &reply)),
            Routed::Sent => Err(MeshError::Protocol("missing verdict".to_string())),
        }
    }

    /// Ask whether `room_id` may be created on this server.
    pub async fn request_room(&self, room_id: &str) -> MeshResult<bool> {
        let me = self.state.current().server_id.clone();
        let check = Message::room_check(room_id, &me);

        match self.route_to_leader(&check, Some("createroom")).await? {
            Routed::Local => Ok(self.check_room(room_id, &me)),
            Routed::Replied {
                leader,
                reply:
                    Message::CreateRoom {
                        room_id: echoed,
                        approved,
                        server_id,
                        ..
                    },
            } if echoed == room_id => {
                let approved = approved.as_deref() == Some(APPROVED);
                debug!(room_id, approved, "leader verdict");
                if !approved {
                    self.note_denial(room_id, &leader, server_id.as_deref());
                }
                Ok(approved)
            }
            Routed::Replied { reply, .. } => Err(unexpected_reply("createroom", &reply)),
            Routed::Sent => Err(MeshError::Protocol("missing verdict".to_string())),
        }
    }

    /// Report that an approved identity now exists on this server.
    pub async fn confirm_identity(&self, identity: &str) -> MeshResult<()> {
        let created = Message::identity_created(identity);
        match self.route_to_leader(&created, None).await? {
            Routed::Local => self.promote_identity(identity).await,
            _ => self.state.add_global_client(identity),
        }
        Ok(())
    }

    /// Report that an approved room now exists on this server.
    pub async fn confirm_room(&self, room_id: &str) -> MeshResult<()> {
        let me = self.state.current().server_id.clone();
        let created = Message::room_created(room_id, &me);
        match self.route_to_leader(&created, None).await? {
            Routed::Local => self.promote_room(room_id, &me).await,
            _ => self.state.add_global_room(room_id, &me),
        }
        Ok(())
    }

    /// Find the server owning `room_id`. Always answered by the leader.
    pub async fn room_owner(&self, room_id: &str) -> MeshResult<Option<String>> {
        let lookup = Message::JoinRoom {
            room_id: room_id.to_string(),
            server_id: None,
        };
        match self.route_to_leader(&lookup, Some("joinroom")).await? {
            Routed::Local => Ok(self.state.room_owner(room_id)),
            Routed::Replied {
                reply:
                    Message::JoinRoom {
                        room_id: echoed,
                        server_id,
                    },
                ..
            } if echoed == room_id => Ok(server_id),
            Routed::Replied { reply, .. } => Err(unexpected_reply("joinroom", &reply)),
            Routed::Sent => Ok(None),
        }
    }

    /// A client left: drop it locally and tell every peer.
    pub async fn announce_client_quit(&self, identity: &str) -> Vec<String> {
        self.state.remove_global_client(identity);
        let quit = Message::Quit {
            identity: identity.to_string(),
            server_id: self.state.current().server_id.clone(),
        };
        info!(identity, "announcing client quit");
        self.messenger
            .broadcast(&self.state, &quit, self.config.broadcast_deadline)
            .await
    }

    /// A room was deleted: drop it locally and tell every peer.
    pub async fn announce_room_deleted(&self, room_id: &str) -> Vec<String> {
        self.state.remove_global_room(room_id);
        let delete = Message::DeleteRoom {
            room_id: room_id.to_string(),
            server_id: self.state.current().server_id.clone(),
        };
        info!(room_id, "announcing room deletion");
        self.messenger
            .broadcast(&self.state, &delete, self.config.broadcast_deadline)
            .await
    }

    /// Snapshot of the global registries as a `globals` reply.
    pub fn globals_snapshot(&self) -> Message {
        Message::Globals {
            clients: Some(self.state.global_clients()),
            chatrooms: Some(self.state.global_rooms()),
        }
    }

    /// Log a denied availability check.
    ///
    /// A server that is not the leader denies every forwarded check, so a
    /// denial is only a real conflict when it came from the server that is
    /// still the recorded leader. Returns `true` when the denial may be stale.
    fn note_denial(&self, key: &str, asked: &str, decided_by: Option<&str>) -> bool {
        let recorded = self.state.leader().map(|leader| leader.server_id);
        let stale = decided_by != Some(asked) || recorded.as_deref() != Some(asked);
        if stale {
            warn!(
                key,
                asked,
                decided_by,
                recorded_leader = recorded.as_deref(),
                "check denied by a server that is not the recorded leader, key may be free"
            );
        } else {
            info!(key, decided_by = asked, "check denied, key already taken");
        }
        stale
    }

    // ─────────────────────────────────────────────────────────────────────
    // Leader side
    // ─────────────────────────────────────────────────────────────────────

    /// Atomically reserve `identity`. Returns the verdict (`true` = approved).
    pub fn check_identity(&self, identity: &str) -> bool {
        let approved = !self.state.reserve_identity_if_absent(identity);
        debug!(identity, approved, "identity check");
        approved
    }

    /// Atomically reserve `room_id` for `requesting_server`.
    pub fn check_room(&self, room_id: &str, requesting_server: &str) -> bool {
        let approved = !self.state.reserve_room_if_absent(room_id, requesting_server);
        debug!(room_id, requesting_server, approved, "room check");
        approved
    }

    /// Promote a confirmed identity and propagate it.
    pub async fn promote_identity(&self, identity: &str) {
        if !self.state.promote_pending_identity(identity) {
            debug!(identity, "confirmation without pending reservation");
        }
        info!(identity, "identity now global");
        self.messenger
            .broadcast(
                &self.state,
                &Message::identity_approved(identity),
                self.config.broadcast_deadline,
            )
            .await;
    }

    /// Promote a confirmed room and propagate it with its owner.
    ///
    /// `fallback_owner` is used when the pending entry is gone (the leader
    /// changed between check and confirm).
    pub async fn promote_room(&self, room_id: &str, fallback_owner: &str) {
        let owner = match self.state.promote_pending_room(room_id) {
            Some(owner) => owner,
            None => match self.state.room_owner(room_id) {
                Some(owner) => owner,
                None => {
                    debug!(room_id, "confirmation without pending reservation");
                    self.state.add_global_room(room_id, fallback_owner);
                    fallback_owner.to_string()
                }
            },
        };
        info!(room_id, owner = %owner, "room now global");
        self.messenger
            .broadcast(
                &self.state,
                &Message::room_approved(room_id, &owner),
                self.config.broadcast_deadline,
            )
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Leader contact
    // ─────────────────────────────────────────────────────────────────────

    /// Current leader, running an election when none is agreed.
    async fn current_leader(&self) -> MeshResult<ServerDescriptor> {
        match self.state.leader() {
            Some(leader) => Ok(leader),
            None => self.election.run().await,
        }
    }

    /// Deliver `message` to the leader. With `reply` set, wait for one
    /// reply record.
    async fn route_to_leader(
        &self,
        message: &Message,
        reply: Option<&'static str>,
    ) -> MeshResult<Routed> {
        let mut failures = 0;
        loop {
            let leader = self.current_leader().await?;
            if leader == *self.state.current() {
                return Ok(Routed::Local);
            }

            let outcome = match reply {
                Some(operation) => self
                    .messenger
                    .request(&leader, message, self.config.request_timeout, operation)
                    .await
                    .map(|reply| Routed::Replied {
                        leader: leader.server_id.clone(),
                        reply,
                    }),
                None => self
                    .messenger
                    .send(&leader, message)
                    .await
                    .map(|()| Routed::Sent),
            };

            match outcome {
                Err(e) if e.is_peer_failure() => {
                    failures += 1;
                    warn!(
                        leader = %leader.server_id,
                        kind = message.kind(),
                        error = %e,
                        failures,
                        "leader unreachable"
                    );
                    if failures > self.config.leader_retries {
                        return Err(MeshError::LeaderUnavailable { attempts: failures });
                    }
                    self.state.remove_from_view(&[leader.server_id]);
                    self.state.clear_leader();
                    if let Err(e) = self.election.run().await {
                        warn!(error = %e, "re-election failed");
                        return Err(MeshError::LeaderUnavailable { attempts: failures });
                    }
                }
                other => return other,
            }
        }
    }
}

fn unexpected_reply(expected: &str, got: &Message) -> MeshError {
    MeshError::Protocol(format!("expected {} reply, got {}", expected, got.kind()))
}
