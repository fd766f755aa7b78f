//! Room
//!
//! Fixed-capacity slot table of members plus the room's media plane. Join
//! is atomic with respect to capacity; the owner leaving dissolves the
//! whole room.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::member::Member;
use crate::config::Config;
use crate::sfu::{SfuError, SfuRoom};

/// Admission failures, reported to the client before the socket closes.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The member already holds a slot in a room.
    #[error("member already belongs to a room")]
    AlreadyJoined,

    /// The slot table is full.
    #[error("room is full (capacity {capacity})")]
    Full {
        /// Configured member capacity.
        capacity: usize,
    },
}

/// What a leave did to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The room is gone: the caller must drop it from the manager.
    Dissolved,
    /// The room keeps running with its remaining members.
    Kept,
}

/// A meeting room: slot table plus its SFU.
pub struct Room {
    id: String,
    name: String,
    owner_id: String,
    capacity: usize,
    /// Slot number (1..=capacity) → member.
    slots: RwLock<HashMap<usize, Arc<Member>>>,
    sfu: Arc<SfuRoom>,
}

impl Room {
    /// Create a room with a fresh id; the SFU room shares it.
    pub fn new(
        name: &str,
        owner_id: &str,
        capacity: usize,
        config: &Config,
    ) -> Result<Arc<Self>, SfuError> {
        let id = Uuid::new_v4().to_string();
        let sfu = SfuRoom::new(id.clone(), config)?;

        Ok(Arc::new(Self {
            id,
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            capacity,
            slots: RwLock::new(HashMap::new()),
            sfu,
        }))
    }

    /// Room id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// User id of the owner.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Member capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The room's media plane.
    #[must_use]
    pub fn sfu(&self) -> &Arc<SfuRoom> {
        &self.sfu
    }

    /// Admit a member into the first free slot. Atomic under the room
    /// lock: capacity and the member's roomed state are checked and the
    /// slot installed in one critical section.
    pub async fn join(&self, member: &Arc<Member>) -> Result<usize, JoinError> {
        let mut slots = self.slots.write().await;
        let mut state = member.state.write().await;

        if state.slot > 0 || state.room_id.is_some() {
            return Err(JoinError::AlreadyJoined);
        }
        if slots.len() >= self.capacity {
            return Err(JoinError::Full {
                capacity: self.capacity,
            });
        }

        for slot in 1..=self.capacity {
            if !slots.contains_key(&slot) {
                slots.insert(slot, member.clone());
                state.room_id = Some(self.id.clone());
                state.slot = slot as i32;
                return Ok(slot);
            }
        }

        Err(JoinError::Full {
            capacity: self.capacity,
        })
    }

    /// Remove a member. The owner leaving dissolves the room: every
    /// member's queue is closed and its slot cleared, then the SFU shuts
    /// down. A non-owner leaving an emptied room also dissolves it.
    pub async fn leave(&self, member: &Arc<Member>) -> LeaveOutcome {
        let mut slots = self.slots.write().await;

        let member_slot = {
            let state = member.state.read().await;
            if state.slot < 0 || state.room_id.as_deref() != Some(self.id.as_str()) {
                return LeaveOutcome::Kept;
            }
            state.slot as usize
        };

        if member.id() == self.owner_id {
            for (_, roomed) in slots.drain() {
                roomed.close_queue().await;
                let mut state = roomed.state.write().await;
                state.room_id = None;
                state.slot = -1;
            }
            self.sfu.close().await;
            info!(room = %self.id, owner = %self.owner_id, "Room dissolved by owner");
            return LeaveOutcome::Dissolved;
        }

        if slots
            .get(&member_slot)
            .is_some_and(|roomed| Arc::ptr_eq(roomed, member))
        {
            slots.remove(&member_slot);
            member.close_queue().await;
            let mut state = member.state.write().await;
            state.room_id = None;
            state.slot = -1;
        }

        if slots.is_empty() {
            self.sfu.close().await;
            info!(room = %self.id, "Last member left, room dissolved");
            LeaveOutcome::Dissolved
        } else {
            LeaveOutcome::Kept
        }
    }

    /// Enqueue a frame to every member except the sender. Lossy: full
    /// queues drop the frame rather than stall the room.
    pub async fn broadcast(&self, frame: &str, sender_id: &str) {
        // Snapshot the receivers so the lock is not held during enqueue.
        let receivers: Vec<Arc<Member>> = {
            let slots = self.slots.read().await;
            slots
                .values()
                .filter(|member| member.id() != sender_id)
                .cloned()
                .collect()
        };

        for member in receivers {
            if !member.send(frame.to_string()).await {
                debug!(member = %member.id(), "Send queue full or closed, dropping frame");
            }
        }
    }

    /// Number of members currently in the room.
    pub async fn member_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Resolve a member by its media-plane peer id.
    pub async fn find_by_sfu_peer_id(&self, sfu_peer_id: &str) -> Option<Arc<Member>> {
        let slots = self.slots.read().await;
        slots
            .values()
            .find(|member| member.sfu_peer_id() == sfu_peer_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::SEND_QUEUE_CAPACITY;

    fn test_room(owner_id: &str, capacity: usize) -> Arc<Room> {
        Room::new("Test Room", owner_id, capacity, &Config::default()).unwrap()
    }

    #[tokio::test]
    async fn sfu_room_shares_the_room_id() {
        let room = test_room("owner", 3);
        assert_eq!(room.sfu().id(), room.id());
        assert_eq!(room.owner_id(), "owner");
    }

    #[tokio::test]
    async fn join_assigns_first_free_slot() {
        let room = test_room("owner", 3);
        let (a, _rx_a) = Member::new("owner", "A");
        let (b, _rx_b) = Member::new("b", "B");

        assert_eq!(room.join(&a).await.unwrap(), 1);
        assert_eq!(room.join(&b).await.unwrap(), 2);
        assert_eq!(a.slot().await, 1);
        assert_eq!(b.slot().await, 2);
        assert_eq!(a.room_id().await.as_deref(), Some(room.id()));
    }

    #[tokio::test]
    async fn freed_slot_is_reused() {
        let room = test_room("owner", 3);
        let (owner, _rx_o) = Member::new("owner", "O");
        let (b, _rx_b) = Member::new("b", "B");
        let (c, _rx_c) = Member::new("c", "C");

        room.join(&owner).await.unwrap();
        room.join(&b).await.unwrap();
        assert_eq!(room.leave(&b).await, LeaveOutcome::Kept);

        // Slot 2 opened up again and is handed to the next joiner.
        assert_eq!(room.join(&c).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn join_rejects_member_already_in_a_room() {
        let room = test_room("owner", 3);
        let (member, _rx) = Member::new("u1", "A");

        room.join(&member).await.unwrap();
        assert!(matches!(
            room.join(&member).await,
            Err(JoinError::AlreadyJoined)
        ));
        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test]
    async fn join_enforces_capacity() {
        let room = test_room("owner", 2);
        let (a, _rx_a) = Member::new("a", "A");
        let (b, _rx_b) = Member::new("b", "B");
        let (c, _rx_c) = Member::new("c", "C");

        room.join(&a).await.unwrap();
        room.join(&b).await.unwrap();
        assert!(matches!(
            room.join(&c).await,
            Err(JoinError::Full { capacity: 2 })
        ));
        assert_eq!(room.member_count().await, 2);
        assert_eq!(c.slot().await, -1);
    }

    #[tokio::test]
    async fn capacity_one_room_fits_only_the_owner() {
        let room = test_room("owner", 1);
        let (owner, _rx_o) = Member::new("owner", "O");
        let (other, _rx_b) = Member::new("b", "B");

        assert_eq!(room.join(&owner).await.unwrap(), 1);
        assert!(matches!(
            room.join(&other).await,
            Err(JoinError::Full { .. })
        ));

        assert_eq!(room.leave(&owner).await, LeaveOutcome::Dissolved);
        assert_eq!(room.member_count().await, 0);
    }

    #[tokio::test]
    async fn owner_leave_dissolves_and_clears_every_member() {
        let room = test_room("owner", 3);
        let (owner, _rx_o) = Member::new("owner", "O");
        let (b, mut rx_b) = Member::new("b", "B");
        let (c, mut rx_c) = Member::new("c", "C");

        room.join(&owner).await.unwrap();
        room.join(&b).await.unwrap();
        room.join(&c).await.unwrap();

        assert_eq!(room.leave(&owner).await, LeaveOutcome::Dissolved);

        assert_eq!(room.member_count().await, 0);
        for member in [&owner, &b, &c] {
            assert_eq!(member.slot().await, -1);
            assert!(member.room_id().await.is_none());
        }
        // Queues are closed, so the write pumps wind down.
        assert!(!b.send("late".into()).await);
        assert_eq!(rx_b.recv().await, None);
        assert_eq!(rx_c.recv().await, None);
    }

    #[tokio::test]
    async fn last_member_leave_dissolves() {
        let room = test_room("owner", 3);
        let (owner, _rx_o) = Member::new("owner", "O");
        let (b, _rx_b) = Member::new("b", "B");

        room.join(&owner).await.unwrap();
        room.join(&b).await.unwrap();

        // Owner stays, non-owner leaves: the room keeps running.
        assert_eq!(room.leave(&b).await, LeaveOutcome::Kept);
        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test]
    async fn leave_ignores_members_of_other_rooms() {
        let room = test_room("owner", 3);
        let other_room = test_room("owner2", 3);
        let (member, _rx) = Member::new("u1", "A");

        other_room.join(&member).await.unwrap();
        assert_eq!(room.leave(&member).await, LeaveOutcome::Kept);
        assert_eq!(other_room.member_count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_drops_on_full_queue() {
        let room = test_room("owner", 3);
        let (a, mut rx_a) = Member::new("a", "A");
        let (b, mut rx_b) = Member::new("b", "B");

        room.join(&a).await.unwrap();
        room.join(&b).await.unwrap();

        // Saturate b's queue; the broadcast to b is silently dropped.
        for i in 0..SEND_QUEUE_CAPACITY {
            assert!(b.send(format!("filler-{i}")).await);
        }

        room.broadcast("hello", "a").await;

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.recv().await.as_deref(), Some("filler-0"));
    }

    #[tokio::test]
    async fn find_by_sfu_peer_id_resolves_members() {
        let room = test_room("owner", 3);
        let (a, _rx_a) = Member::new("a", "A");
        room.join(&a).await.unwrap();

        let found = room.find_by_sfu_peer_id(a.sfu_peer_id()).await.unwrap();
        assert!(Arc::ptr_eq(&found, &a));
        assert!(room.find_by_sfu_peer_id("nope").await.is_none());
    }
}
