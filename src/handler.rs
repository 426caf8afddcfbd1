/// Dispatch for the peer coordination port.
///
/// Each inbound connection carries one request. The handler reads it,
/// routes it to the owning component and writes the reply, if the message
/// type has one.
use crate::config::ClusterConfig;
use crate::election::Election;
use crate::error::MeshResult;
use crate::network::{Connection, Message, ReservationStep};
use crate::registry::Coordinator;
use crate::state::ClusterState;
use crate::types::main_hall;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Routes peer messages into the state store, election and registry.
#[derive(Clone)]
pub struct PeerHandler {
    state: Arc<ClusterState>,
    config: Arc<ClusterConfig>,
    election: Arc<Election>,
    coordinator: Arc<Coordinator>,
}

impl PeerHandler {
    pub fn new(
        state: Arc<ClusterState>,
        config: Arc<ClusterConfig>,
        election: Arc<Election>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            state,
            config,
            election,
            coordinator,
        }
    }

    /// Serve one inbound connection.
    ///
    /// A peer that sends nothing within `request_timeout` is dropped.
    pub async fn handle(&self, mut conn: Connection) -> MeshResult<()> {
        let message = conn
            .receive_timeout(self.config.request_timeout, "request")
            .await?;
        trace!(peer = conn.peer_addr(), kind = message.kind(), "received");

        match message {
            Message::Election => return self.election.participate(conn).await,

            Message::Coordinator { leader } => {
                if let Err(e) = self.election.adopt(&leader) {
                    warn!(error = %e, "ignoring coordinator announcement");
                }
            }

            Message::Heartbeat { server_id } => {
                trace!(from = %server_id, "heartbeat");
                let me = self.state.current().server_id.clone();
                conn.send(&Message::HeartbeatResponse { server_id: me })
                    .await?;
            }

            Message::IamUp { server_id } => {
                // Reply with the view as it was before the sender rejoined.
                let views = self.state.view_ids();
                conn.send(&Message::View { views }).await?;
                if self.state.add_to_view(&server_id) {
                    info!(server_id = %server_id, "server rejoined");
                }
                if self.state.neighbour(&server_id).is_some() {
                    self.state
                        .add_global_room(&main_hall(&server_id), &server_id);
                }
            }

            Message::Globals { .. } => {
                conn.send(&self.coordinator.globals_snapshot()).await?;
            }

            Message::JoinRoom { room_id, .. } => {
                let owner = if self.state.is_leader_self() {
                    self.state.room_owner(&room_id)
                } else {
                    // Relay to the leader on behalf of the asking server.
                    self.coordinator.room_owner(&room_id).await.unwrap_or_else(|e| {
                        warn!(room_id = %room_id, error = %e, "room lookup relay failed");
                        None
                    })
                };
                conn.send(&Message::JoinRoom {
                    room_id,
                    server_id: owner,
                })
                .await?;
            }

            Message::DeleteRoom { room_id, server_id } => {
                if self.state.remove_global_room(&room_id) {
                    debug!(room_id = %room_id, by = %server_id, "room removed from mirror");
                }
            }

            Message::Quit {
                identity,
                server_id,
            } => {
                if self.state.remove_global_client(&identity) {
                    debug!(identity = %identity, by = %server_id, "client removed from mirror");
                }
            }

            ref reservation @ (Message::NewIdentity { .. } | Message::CreateRoom { .. }) => {
                self.handle_reservation(reservation, &mut conn).await?;
            }

            other @ (Message::Answer
            | Message::Nomination { .. }
            | Message::HeartbeatResponse { .. }
            | Message::View { .. }) => {
                warn!(
                    peer = conn.peer_addr(),
                    kind = other.kind(),
                    "unsolicited message on coordination port"
                );
            }
        }
        Ok(())
    }

    async fn handle_reservation(
        &self,
        message: &Message,
        conn: &mut Connection,
    ) -> MeshResult<()> {
        let step = message.reservation_step();
        match (message, step) {
            (Message::NewIdentity { identity, .. }, ReservationStep::Forwarded { server_id }) => {
                let is_leader = self.state.is_leader_self();
                if !is_leader {
                    warn!(identity = %identity, from = %server_id, "availability check sent to non-leader");
                }
                let approved = is_leader && self.coordinator.check_identity(identity);
                let me = self.state.current().server_id.clone();
                conn.send(&Message::identity_verdict(identity, approved, &me))
                    .await?;
            }
            (Message::CreateRoom { room_id, .. }, ReservationStep::Forwarded { server_id }) => {
                let is_leader = self.state.is_leader_self();
                if !is_leader {
                    warn!(room_id = %room_id, from = %server_id, "availability check sent to non-leader");
                }
                let approved = is_leader && self.coordinator.check_room(room_id, &server_id);
                let me = self.state.current().server_id.clone();
                conn.send(&Message::room_verdict(room_id, approved, &me))
                    .await?;
            }
            (Message::NewIdentity { identity, .. }, ReservationStep::Created) => {
                self.coordinator.promote_identity(identity).await;
            }
            (
                Message::CreateRoom {
                    room_id, server_id, ..
                },
                ReservationStep::Created,
            ) => {
                let fallback = server_id.as_deref().unwrap_or_default();
                self.coordinator.promote_room(room_id, fallback).await;
            }
            (Message::NewIdentity { identity, .. }, ReservationStep::Propagated { .. }) => {
                self.state.add_global_client(identity);
                debug!(identity = %identity, "identity mirrored");
            }
            (Message::CreateRoom { room_id, .. }, ReservationStep::Propagated { owner }) => {
                match owner {
                    Some(owner) => {
                        self.state.add_global_room(room_id, &owner);
                        debug!(room_id = %room_id, owner = %owner, "room mirrored");
                    }
                    None => warn!(room_id = %room_id, "room propagation without owner"),
                }
            }
            (message, step) => {
                warn!(kind = message.kind(), ?step, "malformed reservation record");
            }
        }
        Ok(())
    }
}
