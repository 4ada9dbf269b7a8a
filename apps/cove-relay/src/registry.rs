use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

use crate::storage::{RoomStore, StoreError};

#[derive(Default)]
struct ConnState {
    room: Option<String>,
    display_name: Option<String>,
}

/// What a departing connection left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: Option<String>,
    pub room_now_empty: bool,
    pub display_name: Option<String>,
}

/// Authoritative bookkeeping for the connections this process hosts: which
/// room each one is in and the display name chat presence announced.
/// Membership writes flow through here into the room store; the router
/// keeps no tables of its own.
pub struct ConnectionRegistry {
    conns: DashMap<String, ConnState>,
    store: Arc<dyn RoomStore>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self {
            conns: DashMap::new(),
            store,
        }
    }

    /// Called on transport-level connect.
    pub fn register(&self, conn: &str) {
        self.conns.insert(conn.to_string(), ConnState::default());
    }

    /// Record membership locally and in the store. The local assignment
    /// sticks even when the store call fails; same-process fan-out and the
    /// eventual disconnect notification keep working during a store outage.
    pub async fn join(&self, conn: &str, room: &str) -> Result<(), StoreError> {
        if let Some(mut state) = self.conns.get_mut(conn) {
            state.room = Some(room.to_string());
        }
        self.store.add_member(room, conn).await
    }

    /// Remove room membership while keeping the connection registered.
    /// Returns the vacated room, if any.
    pub async fn leave_room(&self, conn: &str) -> Option<Departure> {
        let local_room = self.conns.get_mut(conn).and_then(|mut state| state.room.take());
        self.detach(conn, local_room).await
    }

    /// Called on transport-level disconnect. Idempotent: a second call for
    /// the same connection, or a call for an unknown one, returns `None`.
    pub async fn forget(&self, conn: &str) -> Option<Departure> {
        let (_, state) = self.conns.remove(conn)?;
        let mut departure = self
            .detach(conn, state.room)
            .await
            .unwrap_or(Departure {
                room: None,
                room_now_empty: false,
                display_name: None,
            });
        departure.display_name = state.display_name;
        Some(departure)
    }

    async fn detach(&self, conn: &str, local_room: Option<String>) -> Option<Departure> {
        match self.store.remove_member(conn).await {
            Ok(Some(removed)) => Some(Departure {
                room: Some(removed.room),
                room_now_empty: removed.room_now_empty,
                display_name: None,
            }),
            Ok(None) => local_room.map(|room| Departure {
                room: Some(room),
                room_now_empty: false,
                display_name: None,
            }),
            Err(err) => {
                // Degrade to the local view; key TTLs reclaim the store side.
                warn!("membership removal failed for {}: {}", conn, err);
                local_room.map(|room| Departure {
                    room: Some(room),
                    room_now_empty: false,
                    display_name: None,
                })
            }
        }
    }

    pub fn current_room(&self, conn: &str) -> Option<String> {
        self.conns.get(conn).and_then(|state| state.room.clone())
    }

    pub fn set_display_name(&self, conn: &str, name: &str) {
        if let Some(mut state) = self.conns.get_mut(conn) {
            state.display_name = Some(name.to_string());
        }
    }

    /// Global occupant view, straight from the store.
    pub async fn members_of(&self, room: &str) -> Result<Vec<String>, StoreError> {
        self.store.members_of(room).await
    }

    /// The slice of a room hosted by this process; the fan-out dispatcher
    /// resolves room targets against this.
    pub fn local_members(&self, room: &str) -> Vec<String> {
        self.conns
            .iter()
            .filter(|entry| entry.value().room.as_deref() == Some(room))
            .map(|entry| entry.key().clone())
            .collect()
    }
}
