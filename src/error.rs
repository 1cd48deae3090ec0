//! Error kinds surfaced by the filesystem.
//!
//! I/O paths report byte counts instead (short counts at end of file, zero
//! when writes are denied); invariant violations such as a bad inode magic
//! are bugs and panic.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("path component longer than {} bytes", crate::param::NAME_MAX)]
    NameTooLong,
    #[error("no such file or directory")]
    NotFound,
    #[error("name already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("file or directory is in use")]
    InUse,
    #[error("no free sectors left on the volume")]
    NoSpace,
    #[error("invalid path")]
    InvalidPath,
}

pub type Result<T> = core::result::Result<T, FsError>;
