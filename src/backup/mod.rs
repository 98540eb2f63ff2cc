pub mod compression;
mod logic;
pub mod result;
pub mod retention;
pub mod task;
pub mod writer;

pub use logic::{BackupEngine, BackupRequest, EngineSettings, RunCanceller, RunHandle};
pub use result::{BackupFile, BackupResult, ObjectError, RunOutcome, RunState};
pub use task::TaskStage;
