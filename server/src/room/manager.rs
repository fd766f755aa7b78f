//! Room Manager
//!
//! Registry of live rooms. Holds only its own lock while creating and
//! deleting entries; per-room locks are acquired strictly after it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::room::Room;
use crate::config::Config;
use crate::sfu::SfuError;

/// Registry of all live rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    config: Arc<Config>,
}

impl RoomManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Create and register a room.
    pub async fn create_room(
        &self,
        name: &str,
        owner_id: &str,
        capacity: usize,
    ) -> Result<Arc<Room>, SfuError> {
        let room = Room::new(name, owner_id, capacity, &self.config)?;
        self.rooms
            .write()
            .await
            .insert(room.id().to_string(), room.clone());
        debug!(room = %room.id(), name = %name, capacity, "Room registered");
        Ok(room)
    }

    /// Look up a room by id.
    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop a room from the registry. Idempotent.
    pub async fn delete_room(&self, room_id: &str) {
        if self.rooms.write().await.remove(room_id).is_some() {
            debug!(room = %room_id, "Room deleted");
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Total members across all rooms.
    pub async fn user_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        let mut count = 0;
        for room in rooms.values() {
            count += room.member_count().await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::Member;

    fn test_manager() -> RoomManager {
        RoomManager::new(Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn create_and_get_room() {
        let manager = test_manager();
        let room = manager.create_room("R", "owner", 5).await.unwrap();

        let found = manager.get_room(room.id()).await.unwrap();
        assert!(Arc::ptr_eq(&found, &room));
        assert_eq!(found.name(), "R");
        assert_eq!(found.capacity(), 5);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn delete_room_is_idempotent() {
        let manager = test_manager();
        let room = manager.create_room("R", "owner", 5).await.unwrap();

        manager.delete_room(room.id()).await;
        assert!(manager.get_room(room.id()).await.is_none());
        assert_eq!(manager.room_count().await, 0);

        manager.delete_room(room.id()).await;
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn user_count_sums_all_rooms() {
        let manager = test_manager();
        let room_a = manager.create_room("A", "o1", 5).await.unwrap();
        let room_b = manager.create_room("B", "o2", 5).await.unwrap();

        let (m1, _rx1) = Member::new("u1", "U1");
        let (m2, _rx2) = Member::new("u2", "U2");
        let (m3, _rx3) = Member::new("u3", "U3");
        room_a.join(&m1).await.unwrap();
        room_a.join(&m2).await.unwrap();
        room_b.join(&m3).await.unwrap();

        assert_eq!(manager.user_count().await, 3);
        assert_eq!(manager.room_count().await, 2);
    }
}
