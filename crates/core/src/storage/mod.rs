pub mod checkpoint;
pub mod event_log;

pub use checkpoint::{
    CheckpointManager, CheckpointState, CheckpointStore, FileCheckpointStore, Progress,
    RedbCheckpointStore,
};
pub use event_log::{JsonlEventLog, MemoryEventLog};
