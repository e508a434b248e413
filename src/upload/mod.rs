//! Resumable chunked upload pipeline
//!
//! A client splits a file into indexed chunks and uploads them in any order;
//! the store persists each chunk atomically, the session registry tracks
//! which indices have arrived, and the coordinator triggers an ordered merge
//! once the set is complete.

pub mod chunk_store;
pub mod coordinator;
pub mod reassembler;
pub mod session;
pub mod types;

pub use chunk_store::ChunkStore;
pub use coordinator::UploadCoordinator;
pub use reassembler::Reassembler;
pub use session::SessionRegistry;
pub use types::{
    ChunkReceipt, ProgressReport, SessionStatus, SessionStatusView, UploadError,
    DEFAULT_MAX_CHUNK_BYTES, DEFAULT_SESSION_TTL_HOURS, DEFAULT_SWEEP_INTERVAL_SECS,
};
