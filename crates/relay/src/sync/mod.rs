pub mod backlog;
pub mod sequencer;

pub use backlog::LabBacklog;
pub use sequencer::LabSequencer;
