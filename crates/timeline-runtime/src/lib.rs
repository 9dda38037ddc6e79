//! Async room timeline runtime.
//!
//! Every open room is driven by one actor task that owns its event store,
//! local echoes, pagination state and published view. Callers talk to it
//! through a cloneable [`RoomTimelineHandle`]; [`TimelineClient`] keeps the
//! handles of one user and fans sync batches out to them.

mod client;
mod room;

pub use client::TimelineClient;
pub use room::{ReactionToggle, RoomTimelineHandle, TimelineClosed, spawn_room_timeline};
