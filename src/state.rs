/// Cluster state store.
///
/// `ClusterState` is the single shared mutable resource of a coordination
/// node. It owns:
///
/// - this server's descriptor and the static neighbour table
/// - the **view**: neighbours currently believed alive
/// - the current **leader**
/// - the global client and room registries, including the leader's pending
///   reservations
///
/// # Concurrency
///
/// Each logical map has its own lock (`DashMap` shards, a `watch` channel for
/// the leader). Pending and global entries for the same key live in the same
/// map with a status flag, so "present in global or pending, else reserve"
/// is a single entry operation and a key can never sit in both at once.
/// Callers only ever receive snapshots.
use crate::types::ServerDescriptor;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle of a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Granted by the leader, creation not yet confirmed.
    Pending,
    /// Known cluster-wide.
    Global,
}

/// A room registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoomRecord {
    /// Owning server (or requesting server while pending).
    owner: String,
    status: Reservation,
}

/// Shared coordination state of one server process.
pub struct ClusterState {
    current: ServerDescriptor,
    neighbours: HashMap<String, ServerDescriptor>,
    view: DashMap<String, ServerDescriptor>,
    leader: watch::Sender<Option<ServerDescriptor>>,
    clients: DashMap<String, Reservation>,
    rooms: DashMap<String, RoomRecord>,
}

impl ClusterState {
    /// Create the state for `current` with a fixed neighbour table.
    ///
    /// The view starts empty and no leader is known.
    pub fn new(current: ServerDescriptor, neighbours: HashMap<String, ServerDescriptor>) -> Self {
        let (leader, _) = watch::channel(None);
        Self {
            current,
            neighbours,
            view: DashMap::new(),
            leader,
            clients: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// This server's descriptor.
    pub fn current(&self) -> &ServerDescriptor {
        &self.current
    }

    /// Look up a configured neighbour.
    pub fn neighbour(&self, server_id: &str) -> Option<&ServerDescriptor> {
        self.neighbours.get(server_id)
    }

    /// Resolve a server id to a descriptor, including this server.
    pub fn resolve(&self, server_id: &str) -> Option<ServerDescriptor> {
        if server_id == self.current.server_id {
            Some(self.current.clone())
        } else {
            self.neighbours.get(server_id).cloned()
        }
    }

    /// All configured neighbours, highest priority first.
    pub fn neighbours(&self) -> Vec<ServerDescriptor> {
        let mut all: Vec<_> = self.neighbours.values().cloned().collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority));
        all
    }

    /// Neighbours that outrank this server.
    pub fn higher_priority_neighbours(&self) -> Vec<ServerDescriptor> {
        self.neighbours()
            .into_iter()
            .filter(|n| n.priority > self.current.priority)
            .collect()
    }

    /// Neighbours this server outranks.
    pub fn lower_priority_neighbours(&self) -> Vec<ServerDescriptor> {
        self.neighbours()
            .into_iter()
            .filter(|n| n.priority < self.current.priority)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Leader
    // ─────────────────────────────────────────────────────────────────────

    /// Record the agreed leader. Waiters in [`Self::wait_for_leader`] wake up.
    pub fn set_leader(&self, leader: ServerDescriptor) {
        self.leader.send_replace(Some(leader));
    }

    /// Forget the leader while an election is running.
    pub fn clear_leader(&self) {
        self.leader.send_replace(None);
    }

    /// The current leader, if one is agreed.
    pub fn leader(&self) -> Option<ServerDescriptor> {
        self.leader.borrow().clone()
    }

    /// Whether this server is the leader (id, address and ports all match).
    pub fn is_leader_self(&self) -> bool {
        self.leader
            .borrow()
            .as_ref()
            .is_some_and(|leader| *leader == self.current)
    }

    /// Wait up to `timeout` for a leader to be agreed.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<ServerDescriptor> {
        let mut rx = self.leader.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|leader| leader.is_some())).await;
        match waited {
            Ok(Ok(leader)) => leader.clone(),
            _ => None,
        }
    }

    /// Subscribe to leader changes.
    pub fn subscribe_leader(&self) -> watch::Receiver<Option<ServerDescriptor>> {
        self.leader.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // View
    // ─────────────────────────────────────────────────────────────────────

    /// Add a neighbour to the view. Returns `true` if it was newly added.
    ///
    /// Ids outside the static configuration (including this server) are
    /// ignored, keeping the view a subset of the neighbours.
    pub fn add_to_view(&self, server_id: &str) -> bool {
        let Some(descriptor) = self.neighbours.get(server_id) else {
            return false;
        };
        match self.view.entry(server_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(descriptor.clone());
                true
            }
        }
    }

    /// Remove several servers from the view in one batch. Returns the ids
    /// that were actually present.
    pub fn remove_from_view(&self, server_ids: &[String]) -> Vec<String> {
        server_ids
            .iter()
            .filter(|id| self.view.remove(id.as_str()).is_some())
            .cloned()
            .collect()
    }

    /// Whether `server_id` is in the view.
    pub fn in_view(&self, server_id: &str) -> bool {
        self.view.contains_key(server_id)
    }

    /// Copy of the view, highest priority first.
    pub fn view_snapshot(&self) -> Vec<ServerDescriptor> {
        let mut members: Vec<_> = self.view.iter().map(|e| e.value().clone()).collect();
        members.sort_by(|a, b| b.priority.cmp(&a.priority));
        members
    }

    /// Ids of the view members, highest priority first.
    pub fn view_ids(&self) -> Vec<String> {
        self.view_snapshot()
            .into_iter()
            .map(|d| d.server_id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reservations (leader side)
    // ─────────────────────────────────────────────────────────────────────

    /// Reserve `identity` unless it is already global or pending.
    ///
    /// Returns `true` when it was already reserved (the request must be
    /// denied) and `false` when this call took the reservation.
    pub fn reserve_identity_if_absent(&self, identity: &str) -> bool {
        match self.clients.entry(identity.to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(Reservation::Pending);
                false
            }
        }
    }

    /// Reserve `room_id` for `requesting_server` unless it is already
    /// global or pending. Same return convention as
    /// [`Self::reserve_identity_if_absent`].
    pub fn reserve_room_if_absent(&self, room_id: &str, requesting_server: &str) -> bool {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(RoomRecord {
                    owner: requesting_server.to_string(),
                    status: Reservation::Pending,
                });
                false
            }
        }
    }

    /// Move a pending identity into the global registry.
    ///
    /// Returns `true` if a pending reservation existed. The identity ends up
    /// global either way.
    pub fn promote_pending_identity(&self, identity: &str) -> bool {
        let previous = self
            .clients
            .insert(identity.to_string(), Reservation::Global);
        previous == Some(Reservation::Pending)
    }

    /// Move a pending room into the global registry, returning the server
    /// that requested it. Returns `None` (and changes nothing) if the room
    /// was not pending.
    pub fn promote_pending_room(&self, room_id: &str) -> Option<String> {
        let mut record = self.rooms.get_mut(room_id)?;
        if record.status != Reservation::Pending {
            return None;
        }
        record.status = Reservation::Global;
        Some(record.owner.clone())
    }

    /// Number of pending identity and room reservations.
    pub fn pending_counts(&self) -> (usize, usize) {
        let clients = self
            .clients
            .iter()
            .filter(|e| *e.value() == Reservation::Pending)
            .count();
        let rooms = self
            .rooms
            .iter()
            .filter(|e| e.value().status == Reservation::Pending)
            .count();
        (clients, rooms)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Global registries (every server)
    // ─────────────────────────────────────────────────────────────────────

    /// Record `identity` as globally known.
    pub fn add_global_client(&self, identity: &str) {
        self.clients
            .insert(identity.to_string(), Reservation::Global);
    }

    /// Drop `identity` from the registry. Returns `true` if it was present.
    pub fn remove_global_client(&self, identity: &str) -> bool {
        self.clients.remove(identity).is_some()
    }

    /// Whether `identity` is globally known.
    pub fn is_global_client(&self, identity: &str) -> bool {
        self.clients
            .get(identity)
            .is_some_and(|status| *status == Reservation::Global)
    }

    /// Record `room_id` as globally known and owned by `owner`.
    pub fn add_global_room(&self, room_id: &str, owner: &str) {
        self.rooms.insert(
            room_id.to_string(),
            RoomRecord {
                owner: owner.to_string(),
                status: Reservation::Global,
            },
        );
    }

    /// Drop `room_id` from the registry. Returns `true` if it was present.
    pub fn remove_global_room(&self, room_id: &str) -> bool {
        self.rooms.remove(room_id).is_some()
    }

    /// Owning server of a global room.
    pub fn room_owner(&self, room_id: &str) -> Option<String> {
        self.rooms
            .get(room_id)
            .filter(|record| record.status == Reservation::Global)
            .map(|record| record.owner.clone())
    }

    /// Union-merge identities into the global registry.
    ///
    /// Existing entries are kept; a local pending entry is promoted.
    /// Returns how many identities were new.
    pub fn merge_global_clients<I>(&self, identities: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = 0;
        for identity in identities {
            match self.clients.entry(identity) {
                Entry::Occupied(mut slot) => {
                    slot.insert(Reservation::Global);
                }
                Entry::Vacant(slot) => {
                    slot.insert(Reservation::Global);
                    added += 1;
                }
            }
        }
        added
    }

    /// Union-merge rooms into the global registry. Owners already recorded
    /// locally are never overwritten. Returns how many rooms were new.
    pub fn merge_global_rooms<I>(&self, rooms: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut added = 0;
        for (room_id, owner) in rooms {
            match self.rooms.entry(room_id) {
                Entry::Occupied(mut slot) => {
                    slot.get_mut().status = Reservation::Global;
                }
                Entry::Vacant(slot) => {
                    slot.insert(RoomRecord {
                        owner,
                        status: Reservation::Global,
                    });
                    added += 1;
                }
            }
        }
        added
    }

    /// Snapshot of global identities, sorted.
    pub fn global_clients(&self) -> Vec<String> {
        let mut clients: Vec<_> = self
            .clients
            .iter()
            .filter(|e| *e.value() == Reservation::Global)
            .map(|e| e.key().clone())
            .collect();
        clients.sort();
        clients
    }

    /// Snapshot of global rooms and their owners.
    pub fn global_rooms(&self) -> HashMap<String, String> {
        self.rooms
            .iter()
            .filter(|e| e.value().status == Reservation::Global)
            .map(|e| (e.key().clone(), e.value().owner.clone()))
            .collect()
    }

    /// Sorted ids of every global room.
    pub fn global_room_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.global_rooms().into_keys().collect();
        ids.sort();
        ids
    }
}
