//! Room Member
//!
//! One connected signaling client: identity, its SFU peer id (kept distinct
//! from the user id so the media plane identifier is independent), a bounded
//! lossy outbound queue, and the slot state tied to room membership.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// Outbound queue depth. Control messages are lossy: a stuck client drops
/// frames instead of blocking the room.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Slot/room state. A member holds a slot in [1..capacity] iff it belongs
/// to a room; otherwise the slot is -1 and the room is none.
pub(crate) struct MemberState {
    pub(crate) room_id: Option<String>,
    pub(crate) slot: i32,
}

/// A connected signaling client.
pub struct Member {
    id: String,
    name: String,
    sfu_peer_id: String,
    /// Taken (and thereby closed) on leave; the write pump drains the
    /// remaining frames and then sends a close frame.
    queue: Mutex<Option<mpsc::Sender<String>>>,
    pub(crate) state: RwLock<MemberState>,
}

impl Member {
    /// Create a member for an accepted socket. An empty user id gets a
    /// fresh one. Returns the receiving end of the outbound queue for the
    /// write pump.
    #[must_use]
    pub fn new(user_id: &str, name: &str) -> (Arc<Self>, mpsc::Receiver<String>) {
        let id = if user_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            user_id.to_string()
        };
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);

        let member = Arc::new(Self {
            id,
            name: name.to_string(),
            sfu_peer_id: Uuid::new_v4().to_string(),
            queue: Mutex::new(Some(tx)),
            state: RwLock::new(MemberState {
                room_id: None,
                slot: -1,
            }),
        });
        (member, rx)
    }

    /// User id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Media-plane peer id.
    #[must_use]
    pub fn sfu_peer_id(&self) -> &str {
        &self.sfu_peer_id
    }

    /// Non-blocking enqueue. Returns false when the queue is full or
    /// already closed.
    pub async fn send(&self, frame: String) -> bool {
        let queue = self.queue.lock().await;
        match queue.as_ref() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Close the outbound queue; the write pump exits after draining.
    pub async fn close_queue(&self) {
        self.queue.lock().await.take();
    }

    /// Current slot, or -1 when unroomed.
    pub async fn slot(&self) -> i32 {
        self.state.read().await.slot
    }

    /// Id of the room this member currently belongs to.
    pub async fn room_id(&self) -> Option<String> {
        self.state.read().await.room_id.clone()
    }
}
