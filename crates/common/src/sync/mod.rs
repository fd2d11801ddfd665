// Client-side synchronization: the replica state machine that reconciles
// optimistic edits with the relay's ordered event stream.

mod backoff;
mod replica;

pub use backoff::backoff_delay;
pub use replica::{
    LabReplica, PendingEdit, ReceiveOutcome, ReconcileOutcome, ReconcileReply, ReplicaPhase,
    ResumeRequest,
};
