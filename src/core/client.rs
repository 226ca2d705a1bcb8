//! Purpose: Primitive distributed-filesystem client boundary.
//! Exports: `DfsClient`, `DfsReader`, `DfsWriter`, `FileStatus`.
//! Role: Implemented by concrete clients (WebHDFS, in-memory); consumed by `DfsAdapter`.
//! Invariants: Failures carry an `ErrorKind` and, for remote errors, the exception class.
//! Invariants: Clients never retry on their own; retry policy lives in the adapter.
use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::core::error::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileStatus {
    pub name: String,
    pub len: u64,
    pub is_dir: bool,
}

pub trait DfsReader: Read + Seek + Send {
    /// Length of the file as of open.
    fn file_len(&self) -> u64;
}

pub trait DfsWriter: Write + Send {
    /// Completes the file. May be called again after a failed attempt.
    fn close(&mut self) -> Result<(), Error>;

    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        None
    }
}

pub trait DfsClient: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn DfsReader>, Error>;

    /// Opens an existing file for appending; `NotFound` if it does not exist.
    fn append(&self, path: &Path) -> Result<Box<dyn DfsWriter>, Error>;

    /// Creates a new file; `AlreadyExists` if it exists.
    fn create(&self, path: &Path) -> Result<Box<dyn DfsWriter>, Error>;

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<(), Error>;

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error>;

    fn remove(&self, path: &Path) -> Result<(), Error>;

    fn read_dir(&self, path: &Path) -> Result<Vec<FileStatus>, Error>;
}
