//! Purpose: In-process distributed filesystem with deterministic fault injection.
//! Exports: `MemoryClient`, `Fault`, `FsOp`.
//! Role: `DfsClient` for tests and embedders; mimics HDFS visibility and error classes.
//! Invariants: Appended bytes are visible to readers opened after the write returns.
//! Invariants: Injected faults are consumed in FIFO order, one per matching call.
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::client::{DfsClient, DfsReader, DfsWriter, FileStatus};
use crate::core::error::{Error, ErrorKind};

const FILE_NOT_FOUND: &str = "java.io.FileNotFoundException";
const FILE_EXISTS: &str = "org.apache.hadoop.fs.FileAlreadyExistsException";
const NOT_EMPTY: &str = "org.apache.hadoop.fs.PathIsNotEmptyDirectoryException";
const STANDBY: &str = "org.apache.hadoop.ipc.StandbyException";
const RETRIABLE: &str = "org.apache.hadoop.ipc.RetriableException";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FsOp {
    Open,
    Append,
    Create,
    Mkdir,
    Rename,
    Remove,
    ReadDir,
    Close,
    /// One `write` call on a handle.
    Write,
}

#[derive(Clone, Debug)]
pub struct Fault {
    kind: ErrorKind,
    exception: Option<String>,
    message: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            exception: None,
            message: message.into(),
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// NameNode in standby during a failover.
    pub fn standby() -> Self {
        Self::new(
            ErrorKind::Unavailable,
            "Operation category WRITE is not supported in state standby",
        )
        .with_exception(STANDBY)
    }

    pub fn retriable() -> Self {
        Self::new(ErrorKind::Unavailable, "server too busy, retry later").with_exception(RETRIABLE)
    }

    fn to_error(&self, path: &Path) -> Error {
        let mut err = Error::new(self.kind)
            .with_message(self.message.clone())
            .with_path(path);
        if let Some(exception) = &self.exception {
            err = err.with_exception(exception.clone());
        }
        err
    }
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    faults: HashMap<FsOp, VecDeque<Option<Fault>>>,
    calls: HashMap<FsOp, u64>,
}

impl MemoryState {
    fn is_dir(&self, path: &Path) -> bool {
        is_root(path) || self.dirs.contains(path)
    }

    fn add_dirs(&mut self, path: &Path) -> Result<(), Error> {
        for ancestor in path.ancestors() {
            if is_root(ancestor) {
                break;
            }
            if self.files.contains_key(ancestor) {
                return Err(Error::new(ErrorKind::AlreadyExists)
                    .with_message("path component is a file")
                    .with_exception(FILE_EXISTS)
                    .with_path(ancestor));
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }
}

/// Cloning shares the same underlying cluster.
#[derive(Clone, Default)]
pub struct MemoryClient {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` calls of `op` fail with `fault`.
    pub fn inject(&self, op: FsOp, fault: Fault, times: usize) {
        self.inject_after(op, 0, fault, times);
    }

    /// Lets the next `skip` calls of `op` through, then fails `times` calls with `fault`.
    pub fn inject_after(&self, op: FsOp, skip: usize, fault: Fault, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(None, skip));
        queue.extend(std::iter::repeat_n(Some(fault), times));
    }

    pub fn calls(&self, op: FsOp) -> u64 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.lock().files.get(path.as_ref()).cloned()
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        let state = self.lock();
        let path = path.as_ref();
        state.files.contains_key(path) || state.is_dir(path)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, op: FsOp, path: &Path) -> Result<MutexGuard<'_, MemoryState>, Error> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        let fault = state.faults.get_mut(&op).and_then(VecDeque::pop_front).flatten();
        match fault {
            Some(fault) => Err(fault.to_error(path)),
            None => Ok(state),
        }
    }

    fn writer(&self, path: &Path) -> Box<dyn DfsWriter> {
        Box::new(MemoryWriter {
            client: self.clone(),
            path: path.to_path_buf(),
            closed: false,
        })
    }
}

impl DfsClient for MemoryClient {
    fn open(&self, path: &Path) -> Result<Box<dyn DfsReader>, Error> {
        let state = self.begin(FsOp::Open, path)?;
        let data = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))?;
        Ok(Box::new(MemoryReader {
            data: Cursor::new(data),
        }))
    }

    fn append(&self, path: &Path) -> Result<Box<dyn DfsWriter>, Error> {
        let state = self.begin(FsOp::Append, path)?;
        if !state.files.contains_key(path) {
            return Err(not_found(path));
        }
        drop(state);
        Ok(self.writer(path))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn DfsWriter>, Error> {
        let mut state = self.begin(FsOp::Create, path)?;
        if state.files.contains_key(path) || state.is_dir(path) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("file already exists")
                .with_exception(FILE_EXISTS)
                .with_path(path));
        }
        if let Some(parent) = path.parent() {
            state.add_dirs(parent)?;
        }
        state.files.insert(path.to_path_buf(), Vec::new());
        drop(state);
        Ok(self.writer(path))
    }

    fn mkdir_all(&self, path: &Path, _mode: u32) -> Result<(), Error> {
        let mut state = self.begin(FsOp::Mkdir, path)?;
        state.add_dirs(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        let mut state = self.begin(FsOp::Rename, from)?;
        if state.files.contains_key(to) || state.is_dir(to) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("rename destination exists")
                .with_exception(FILE_EXISTS)
                .with_path(to));
        }
        if let Some(parent) = to.parent() {
            if !state.is_dir(parent) {
                return Err(not_found(parent));
            }
        }
        let data = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), data);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), Error> {
        let mut state = self.begin(FsOp::Remove, path)?;
        if state.files.remove(path).is_some() {
            return Ok(());
        }
        if !state.dirs.contains(path) {
            return Err(not_found(path));
        }
        let has_children = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .any(|entry| entry.parent() == Some(path));
        if has_children {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("directory is not empty")
                .with_exception(NOT_EMPTY)
                .with_path(path));
        }
        state.dirs.remove(path);
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileStatus>, Error> {
        let state = self.begin(FsOp::ReadDir, path)?;
        if !state.is_dir(path) {
            return Err(not_found(path));
        }
        let mut entries = Vec::new();
        for (file, data) in &state.files {
            if file.parent() == Some(path) {
                entries.push(FileStatus {
                    name: file_name(file),
                    len: data.len() as u64,
                    is_dir: false,
                });
            }
        }
        for dir in &state.dirs {
            if dir.parent() == Some(path) {
                entries.push(FileStatus {
                    name: file_name(dir),
                    len: 0,
                    is_dir: true,
                });
            }
        }
        Ok(entries)
    }
}

struct MemoryReader {
    data: Cursor<Vec<u8>>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.seek(pos)
    }
}

impl DfsReader for MemoryReader {
    fn file_len(&self) -> u64 {
        self.data.get_ref().len() as u64
    }
}

struct MemoryWriter {
    client: MemoryClient,
    path: PathBuf,
    closed: bool,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other("write after close"));
        }
        let mut state = self
            .client
            .begin(FsOp::Write, &self.path)
            .map_err(io::Error::other)?;
        let file = state
            .files
            .get_mut(&self.path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        file.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DfsWriter for MemoryWriter {
    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        drop(self.client.begin(FsOp::Close, &self.path)?);
        self.closed = true;
        Ok(())
    }
}

fn is_root(path: &Path) -> bool {
    path.parent().is_none() || path.as_os_str().is_empty()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn not_found(path: &Path) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message("file does not exist")
        .with_exception(FILE_NOT_FOUND)
        .with_path(path)
}
