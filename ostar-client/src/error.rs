//! Error kinds callers may want to tell apart.
//!
//! Everything is passed around as `anyhow::Error`, these can be recovered with `downcast_ref`.

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("{0}")]
    Parse(String),

    #[error("refusing to write outside target directory: {0}")]
    PathTraversal(String),

    #[error("refusing symlink {path:?} -> {target:?}: target escapes extraction directory")]
    SymlinkEscape { path: String, target: String },

    #[error("symlink target is empty for {0:?}")]
    EmptySymlinkTarget(String),

    #[error("failed to decode metadata record {key:?}: {reason}")]
    MetadataDecode { key: String, reason: String },

    #[error("{0}")]
    InvalidExclude(String),

    #[error("{0}")]
    EmptyKey(String),
}
