//! PostgreSQL logical backup engine.
//!
//! Reads the catalog of a live database, exports the selected objects in
//! parallel as compressed SQL or CSV streams and writes each one atomically
//! under a destination directory. Failures stay confined to the object they
//! happen in; runs can be cancelled and observed while they progress.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod export;
pub mod progress;
pub mod source;
pub mod utils;

pub use backup::{
    BackupEngine, BackupRequest, BackupResult, EngineSettings, RunCanceller, RunHandle, RunOutcome, RunState,
};
pub use catalog::{CatalogSnapshot, DatabaseObject, ObjectId, ObjectKind};
pub use errors::{BackupError, ErrorKind, Result};
pub use progress::{EventKind, EventScope, ProgressEvent, ProgressReporter, Subscription};
pub use source::{ConnectionCheck, ConnectionDescriptor, Secret, TlsMode};
