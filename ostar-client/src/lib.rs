//! Archive engine for tar streams backed by local files or S3 objects.

pub mod archive;
pub mod engine;
pub mod error;
pub mod locator;
pub mod storage;
pub mod tools;

pub use engine::{ExitStatus, Mode, RunOptions, RunResult, Runner};
pub use error::ArchiveError;
pub use locator::{Reference, ReferenceKind};
