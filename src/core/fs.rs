//! Purpose: Filesystem capability set used by producers and consumers.
//! Exports: `PipeFs`, `WriteHandle`, `ReadStream`, `DfsAdapter`, `LocalFs`.
//! Role: `DfsAdapter` routes distributed metadata calls through `RetryPolicy`; `LocalFs` is
//!       the local-disk variant over `std::fs`.
//! Invariants: `open_write` picks append vs create solely from the append outcome.
//! Invariants: Byte-stream reads/writes are never retried; handles from `DfsAdapter` never seek.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::core::client::{DfsClient, DfsWriter};
use crate::core::error::{Error, ErrorKind};
use crate::core::retry::RetryPolicy;

pub type ReadStream = Box<dyn Read + Send>;

pub trait PipeFs: Send + Sync {
    /// Short backend identifier, e.g. `hdfs` or `file`.
    fn kind(&self) -> &'static str;

    fn open_read(&self, path: &Path, offset: u64) -> Result<ReadStream, Error>;

    fn open_write(&self, path: &Path) -> Result<WriteHandle, Error>;

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<(), Error>;

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error>;

    fn remove(&self, path: &Path) -> Result<(), Error>;

    fn close(&self, handle: &mut WriteHandle) -> Result<(), Error>;

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, Error>;
}

/// Writable stream plus an optional seeker; owned by the producer that opened it.
pub struct WriteHandle {
    stream: Box<dyn DfsWriter>,
    seekable: bool,
}

impl WriteHandle {
    fn new(stream: Box<dyn DfsWriter>, seekable: bool) -> Self {
        Self { stream, seekable }
    }

    pub fn seeker(&mut self) -> Option<&mut dyn Seek> {
        if !self.seekable {
            return None;
        }
        self.stream.as_seek()
    }
}

impl Write for WriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

pub struct DfsAdapter<C> {
    client: C,
    metadata_policy: RetryPolicy,
    close_policy: RetryPolicy,
}

impl<C: DfsClient> DfsAdapter<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            metadata_policy: RetryPolicy::default(),
            close_policy: RetryPolicy::default(),
        }
    }

    pub fn with_policies(mut self, metadata: RetryPolicy, close: RetryPolicy) -> Self {
        self.metadata_policy = metadata;
        self.close_policy = close;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: DfsClient> PipeFs for DfsAdapter<C> {
    fn kind(&self) -> &'static str {
        "hdfs"
    }

    fn open_read(&self, path: &Path, offset: u64) -> Result<ReadStream, Error> {
        let mut reader = self.client.open(path)?;
        let len = reader.file_len();
        if offset > len {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("seek offset beyond end of file ({len} bytes)"))
                .with_path(path)
                .with_offset(offset));
        }
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|err| Error::from_io(err, path).with_offset(offset))?;
        Ok(Box::new(reader))
    }

    fn open_write(&self, path: &Path) -> Result<WriteHandle, Error> {
        let stream = match self.client.append(path) {
            Ok(stream) => stream,
            Err(append_err) => {
                tracing::debug!(path = %path.display(), error = %append_err, "append failed, creating");
                self.client.create(path)?
            }
        };
        Ok(WriteHandle::new(stream, false))
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<(), Error> {
        self.metadata_policy
            .run("mkdir", || self.client.mkdir_all(path, mode))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        self.metadata_policy
            .run("rename", || self.client.rename(from, to))
    }

    fn remove(&self, path: &Path) -> Result<(), Error> {
        self.metadata_policy
            .run("remove", || self.client.remove(path))
    }

    fn close(&self, handle: &mut WriteHandle) -> Result<(), Error> {
        self.close_policy.run("close", || handle.stream.close())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, Error> {
        let entries = self
            .metadata_policy
            .run("list", || self.client.read_dir(path))?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.name)
            .collect())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

impl PipeFs for LocalFs {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn open_read(&self, path: &Path, offset: u64) -> Result<ReadStream, Error> {
        let mut file = File::open(path).map_err(|err| Error::from_io(err, path))?;
        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::from_io(err, path))?;
        if offset > len {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("seek offset beyond end of file ({len} bytes)"))
                .with_path(path)
                .with_offset(offset));
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| Error::from_io(err, path).with_offset(offset))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &Path) -> Result<WriteHandle, Error> {
        let file = match OpenOptions::new().append(true).open(path) {
            Ok(file) => file,
            Err(append_err) => {
                match OpenOptions::new().append(true).create_new(true).open(path) {
                    Ok(file) => file,
                    // The file exists, so the append failure is the real cause.
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                        return Err(Error::from_io(append_err, path));
                    }
                    Err(err) => return Err(Error::from_io(err, path)),
                }
            }
        };
        Ok(WriteHandle::new(Box::new(LocalWriter { file }), true))
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<(), Error> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(path).map_err(|err| Error::from_io(err, path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        fs::rename(from, to).map_err(|err| Error::from_io(err, from))
    }

    fn remove(&self, path: &Path) -> Result<(), Error> {
        fs::remove_file(path).map_err(|err| Error::from_io(err, path))
    }

    fn close(&self, handle: &mut WriteHandle) -> Result<(), Error> {
        handle.stream.close()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, Error> {
        let entries = fs::read_dir(path).map_err(|err| Error::from_io(err, path))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::from_io(err, path))?;
            let is_file = entry
                .file_type()
                .map(|kind| kind.is_file())
                .map_err(|err| Error::from_io(err, entry.path()))?;
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

struct LocalWriter {
    file: File,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl DfsWriter for LocalWriter {
    fn close(&mut self) -> Result<(), Error> {
        self.file.sync_all().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to sync file")
                .with_source(err)
        })
    }

    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        Some(&mut self.file)
    }
}
