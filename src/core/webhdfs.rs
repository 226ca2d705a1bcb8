//! Purpose: Blocking WebHDFS REST client implementing `DfsClient`.
//! Exports: `WebHdfsClient`.
//! Role: Production client for `Pipe::open` with the `hdfs` backend.
//! Invariants: `RemoteException` bodies become `Error` values carrying the Java class name.
//! Invariants: CREATE/APPEND/OPEN follow the NameNode's redirect by hand; the agent never does.
//! Notes: Writes are buffered and shipped as APPEND calls on flush and close.
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::core::client::{DfsClient, DfsReader, DfsWriter, FileStatus};
use crate::core::error::{Error, ErrorKind};

const API_PREFIX: [&str; 2] = ["webhdfs", "v1"];
const WRITE_CHUNK: usize = 4 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WebHdfsClient {
    inner: Arc<WebHdfsInner>,
    write_chunk: usize,
}

struct WebHdfsInner {
    base_url: Url,
    user: Option<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct RemoteExceptionEnvelope {
    #[serde(rename = "RemoteException")]
    remote_exception: RemoteException,
}

#[derive(Deserialize)]
struct RemoteException {
    exception: Option<String>,
    #[serde(rename = "javaClassName")]
    java_class_name: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct BooleanResponse {
    boolean: bool,
}

#[derive(Deserialize)]
struct FileStatusResponse {
    #[serde(rename = "FileStatus")]
    file_status: RemoteFileStatus,
}

#[derive(Deserialize)]
struct ListStatusResponse {
    #[serde(rename = "FileStatuses")]
    file_statuses: RemoteFileStatuses,
}

#[derive(Deserialize)]
struct RemoteFileStatuses {
    #[serde(rename = "FileStatus", default)]
    file_status: Vec<RemoteFileStatus>,
}

#[derive(Deserialize)]
struct RemoteFileStatus {
    #[serde(rename = "pathSuffix", default)]
    path_suffix: String,
    #[serde(default)]
    length: u64,
    #[serde(rename = "type")]
    kind: String,
}

impl RemoteFileStatus {
    fn is_dir(&self) -> bool {
        self.kind == "DIRECTORY"
    }
}

impl WebHdfsClient {
    /// `namenode` is the NameNode HTTP address, e.g. `http://namenode:9870`.
    pub fn new(namenode: &str, user: Option<String>) -> Result<Self, Error> {
        let base_url = normalize_base_url(namenode)?;
        let agent = ureq::AgentBuilder::new()
            .redirects(0)
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        Ok(Self {
            inner: Arc::new(WebHdfsInner {
                base_url,
                user,
                agent,
            }),
            write_chunk: WRITE_CHUNK,
        })
    }

    /// Bytes buffered by a writer before they are shipped as one APPEND.
    pub fn with_write_chunk(mut self, bytes: usize) -> Self {
        self.write_chunk = bytes.max(1);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn op_url(&self, path: &Path, op: &str, params: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = build_url(&self.inner.base_url, path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("op", op);
            if let Some(user) = &self.inner.user {
                query.append_pair("user.name", user);
            }
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn send(
        &self,
        method: &str,
        url: &Url,
        body: Option<&[u8]>,
        path: &Path,
    ) -> Result<ureq::Response, Error> {
        let request = self.inner.agent.request(method, url.as_str());
        let response = match body {
            Some(body) => request
                .set("Content-Type", "application/octet-stream")
                .send_bytes(body),
            None => request.call(),
        };
        match response {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(parse_error_body(code, &body).with_path(path))
            }
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message("webhdfs request failed")
                .with_path(path)
                .with_source(err)),
        }
    }

    /// Two-step data operation: the NameNode answers with a redirect to a DataNode.
    fn send_redirected(
        &self,
        method: &str,
        url: &Url,
        body: Option<&[u8]>,
        path: &Path,
    ) -> Result<ureq::Response, Error> {
        let first = self.send(method, url, None, path)?;
        if !(300..400).contains(&first.status()) {
            if body.is_some_and(|body| !body.is_empty()) {
                return Err(Error::new(ErrorKind::Internal)
                    .with_message("namenode did not redirect the data request")
                    .with_path(path));
            }
            return Ok(first);
        }
        let location = first.header("Location").ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message("redirect without a location header")
                .with_path(path)
        })?;
        let location = Url::parse(location).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid redirect location")
                .with_path(path)
                .with_source(err)
        })?;
        self.send(method, &location, body, path)
    }

    fn read_json<R>(&self, response: ureq::Response, path: &Path) -> Result<R, Error>
    where
        R: DeserializeOwned,
    {
        let body = response.into_string().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read response body")
                .with_path(path)
                .with_source(err)
        })?;
        serde_json::from_str(&body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid webhdfs response json")
                .with_path(path)
                .with_source(err)
        })
    }

    fn file_status(&self, path: &Path) -> Result<RemoteFileStatus, Error> {
        let url = self.op_url(path, "GETFILESTATUS", &[])?;
        let response = self.send("GET", &url, None, path)?;
        let status: FileStatusResponse = self.read_json(response, path)?;
        Ok(status.file_status)
    }

    fn open_at(&self, path: &Path, offset: u64) -> Result<ureq::Response, Error> {
        let offset = offset.to_string();
        let url = self.op_url(path, "OPEN", &[("offset", offset.as_str())])?;
        self.send_redirected("GET", &url, None, path)
    }

    fn append_bytes(&self, path: &Path, data: &[u8]) -> Result<(), Error> {
        let url = self.op_url(path, "APPEND", &[])?;
        self.send_redirected("POST", &url, Some(data), path)?;
        Ok(())
    }

    fn writer(&self, path: &Path) -> Box<dyn DfsWriter> {
        Box::new(WebHdfsWriter {
            client: self.clone(),
            path: path.to_path_buf(),
            buffer: Vec::new(),
            chunk: self.write_chunk,
        })
    }
}

impl DfsClient for WebHdfsClient {
    fn open(&self, path: &Path) -> Result<Box<dyn DfsReader>, Error> {
        let status = self.file_status(path)?;
        if status.is_dir() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("cannot open a directory for reading")
                .with_path(path));
        }
        Ok(Box::new(WebHdfsReader {
            client: self.clone(),
            path: path.to_path_buf(),
            len: status.length,
            pos: 0,
            body: None,
        }))
    }

    fn append(&self, path: &Path) -> Result<Box<dyn DfsWriter>, Error> {
        // An empty APPEND checks that the file exists and accepts appends.
        self.append_bytes(path, &[])?;
        Ok(self.writer(path))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn DfsWriter>, Error> {
        let url = self.op_url(path, "CREATE", &[("overwrite", "false")])?;
        self.send_redirected("PUT", &url, Some(&[]), path)?;
        Ok(self.writer(path))
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<(), Error> {
        let permission = format!("{:o}", mode & 0o7777);
        let url = self.op_url(path, "MKDIRS", &[("permission", permission.as_str())])?;
        let response = self.send("PUT", &url, None, path)?;
        let created: BooleanResponse = self.read_json(response, path)?;
        if !created.boolean {
            return Err(Error::new(ErrorKind::Io)
                .with_message("mkdirs refused")
                .with_path(path));
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        let destination = dfs_path_string(to)?;
        let url = self.op_url(from, "RENAME", &[("destination", destination.as_str())])?;
        let response = self.send("PUT", &url, None, from)?;
        let renamed: BooleanResponse = self.read_json(response, from)?;
        if renamed.boolean {
            return Ok(());
        }
        // WebHDFS reports both failure modes as `false`; tell them apart.
        self.file_status(from)?;
        Err(Error::new(ErrorKind::AlreadyExists)
            .with_message("rename destination exists")
            .with_path(to))
    }

    fn remove(&self, path: &Path) -> Result<(), Error> {
        let url = self.op_url(path, "DELETE", &[("recursive", "false")])?;
        let response = self.send("DELETE", &url, None, path)?;
        let deleted: BooleanResponse = self.read_json(response, path)?;
        if !deleted.boolean {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("file not found")
                .with_path(path));
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileStatus>, Error> {
        let url = self.op_url(path, "LISTSTATUS", &[])?;
        let response = self.send("GET", &url, None, path)?;
        let listing: ListStatusResponse = self.read_json(response, path)?;
        Ok(listing
            .file_statuses
            .file_status
            .into_iter()
            .map(|status| FileStatus {
                is_dir: status.is_dir(),
                name: status.path_suffix,
                len: status.length,
            })
            .collect())
    }
}

struct WebHdfsReader {
    client: WebHdfsClient,
    path: PathBuf,
    len: u64,
    pos: u64,
    body: Option<Box<dyn Read + Send + Sync>>,
}

impl Read for WebHdfsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        if self.body.is_none() {
            let response = self
                .client
                .open_at(&self.path, self.pos)
                .map_err(io::Error::other)?;
            self.body = Some(response.into_reader());
        }
        let Some(body) = self.body.as_mut() else {
            return Ok(0);
        };
        let read = body.read(buf)?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for WebHdfsReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        if target != self.pos {
            self.body = None;
            self.pos = target;
        }
        Ok(target)
    }
}

impl DfsReader for WebHdfsReader {
    fn file_len(&self) -> u64 {
        self.len
    }
}

struct WebHdfsWriter {
    client: WebHdfsClient,
    path: PathBuf,
    buffer: Vec<u8>,
    chunk: usize,
}

impl WebHdfsWriter {
    // The buffer survives a failed ship so a retried close resends it.
    fn ship(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.client.append_bytes(&self.path, &self.buffer)?;
        self.buffer.clear();
        Ok(())
    }
}

impl Write for WebHdfsWriter {
    // Ships what is already buffered before accepting `buf`, so an error means `buf` was not taken.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.buffer.is_empty() && self.buffer.len() + buf.len() > self.chunk {
            self.ship().map_err(io::Error::other)?;
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ship().map_err(io::Error::other)
    }
}

impl DfsWriter for WebHdfsWriter {
    fn close(&mut self) -> Result<(), Error> {
        self.ship()
    }
}

fn normalize_base_url(raw: &str) -> Result<Url, Error> {
    let mut url = Url::parse(raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid namenode url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("namenode url must use http or https scheme")
            .with_hint("Use the NameNode HTTP address, e.g. http://namenode:9870."));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("namenode url must not include a path"));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn dfs_path_string(path: &Path) -> Result<String, Error> {
    if !path.is_absolute() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("hdfs paths must be absolute")
            .with_path(path));
    }
    path.to_str().map(str::to_string).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("hdfs paths must be valid utf-8")
            .with_path(path)
    })
}

fn build_url(base_url: &Url, path: &Path) -> Result<Url, Error> {
    dfs_path_string(path)?;
    let mut url = base_url.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("namenode url cannot be a base")
        })?;
        segments.clear();
        segments.extend(API_PREFIX);
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    segments.push(&part.to_string_lossy());
                }
                Component::RootDir => {}
                _ => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("hdfs paths must not contain relative components")
                        .with_path(path));
                }
            }
        }
    }
    Ok(url)
}

fn parse_error_body(status: u16, body: &str) -> Error {
    if let Ok(envelope) = serde_json::from_str::<RemoteExceptionEnvelope>(body) {
        let remote = envelope.remote_exception;
        let class = remote.java_class_name.or(remote.exception);
        let kind = class
            .as_deref()
            .and_then(error_kind_from_exception)
            .unwrap_or_else(|| error_kind_from_status(status));
        let mut err = Error::new(kind)
            .with_message(remote.message.unwrap_or_else(|| format!("remote error status {status}")));
        if let Some(class) = class {
            err = err.with_exception(class);
        }
        return err;
    }
    Error::new(error_kind_from_status(status)).with_message(format!("remote error status {status}"))
}

fn error_kind_from_exception(class: &str) -> Option<ErrorKind> {
    let simple = class.rsplit('.').next().unwrap_or(class);
    let kind = match simple {
        "FileNotFoundException" => ErrorKind::NotFound,
        "FileAlreadyExistsException" | "AlreadyBeingCreatedException" => ErrorKind::AlreadyExists,
        "AccessControlException" | "SecurityException" => ErrorKind::Permission,
        "StandbyException" | "RetriableException" | "SafeModeException" => ErrorKind::Unavailable,
        "IllegalArgumentException" | "UnsupportedOperationException" => ErrorKind::Usage,
        "PathIsNotEmptyDirectoryException" | "ParentNotDirectoryException" => ErrorKind::Usage,
        "IOException" | "EOFException" => ErrorKind::Io,
        _ => return None,
    };
    Some(kind)
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        503 => ErrorKind::Unavailable,
        _ => ErrorKind::Io,
    }
}
