//! Room & Member Lifecycle
//!
//! The control plane: member admission into fixed-capacity slot tables,
//! owner-driven teardown, lossy control-message broadcast, and the registry
//! of live rooms. Lock ordering is manager → room → member.

mod manager;
mod member;
#[allow(clippy::module_inception)]
mod room;

pub use manager::RoomManager;
pub use member::{Member, SEND_QUEUE_CAPACITY};
pub use room::{JoinError, LeaveOutcome, Room};
