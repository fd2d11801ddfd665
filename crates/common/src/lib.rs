// labsync-common: domain model, conflict resolution and client sync state
// shared by the relay and its clients.

pub mod crdt;
pub mod error;
pub mod protocol;
pub mod state;
pub mod sync;
pub mod types;
