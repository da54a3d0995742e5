//! Compilation-await: checkpointing write responses across host rebuilds.

mod coordinator;
pub mod store;

pub use coordinator::{
    CompilationCoordinator, CoordinatorSettings, PendingDelivery, ResumeOutcome, WriteJob,
};
pub use store::{CompilationRecord, DurableStore, FileStore, MemoryStore, PendingResult, StoreError};
