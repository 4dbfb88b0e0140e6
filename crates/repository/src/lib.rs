//! Versioned file repository for Vellum.
//!
//! Ties the blob store and the metadata store together:
//! - Streaming uploads hashed on the fly
//! - Version reservation and commit without locks held across blob I/O
//! - Idempotent create and add-version
//! - Best-effort blob removal on delete

pub mod coordinator;
pub mod error;
pub mod idempotency;
pub mod repository;
pub mod sequencer;
pub mod streamer;

pub use coordinator::{BlobCoordinator, DeletionWarning};
pub use error::{RepositoryError, RepositoryResult};
pub use idempotency::{CachedResult, IdempotencyCache};
pub use repository::{
    AddVersion, CreateFile, DeleteReport, Repository, ResolvedVersion, UploadOutcome,
};
pub use sequencer::{Reservation, RetryPolicy, VersionSequencer};
pub use streamer::{ContentStreamer, KeyInDoubt, StreamSummary};
