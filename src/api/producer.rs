//! Purpose: Append records to a topic's rotating files.
//! Exports: `Producer`.
//! Role: Writer half of a pipe; files become visible to consumers only once renamed.
//! Invariants: Records are written only to `<name>.rec.open`; finalizing renames it to `<name>.rec`.
//! Invariants: The topic directory and the file are created lazily, on the first push.
//! Invariants: A failed record write discards the current file; no partial frame is ever finalized.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Framing;
use crate::core::fs::{PipeFs, WriteHandle};
use crate::core::rotation::{FileNamer, RotationPolicy, in_progress_name};

const TOPIC_DIR_MODE: u32 = 0o755;

pub struct Producer {
    fs: Arc<dyn PipeFs>,
    topic: String,
    topic_dir: PathBuf,
    framing: Framing,
    rotation: RotationPolicy,
    namer: FileNamer,
    dir_ready: bool,
    current: Option<OpenFile>,
}

struct OpenFile {
    base: String,
    path: PathBuf,
    handle: WriteHandle,
    size: u64,
}

impl Producer {
    pub(crate) fn new(
        fs: Arc<dyn PipeFs>,
        topic: &str,
        topic_dir: PathBuf,
        framing: Framing,
        rotation: RotationPolicy,
    ) -> Self {
        Self {
            fs,
            topic: topic.to_string(),
            topic_dir,
            framing,
            rotation,
            namer: FileNamer::new(),
            dir_ready: false,
            current: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// In-progress path currently being written, if any.
    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_ref().map(|file| file.path.as_path())
    }

    pub fn push(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.framing.validate(payload)?;
        let framing = self.framing;
        let file = self.ensure_open()?;
        let written = match framing.write_record(&mut file.handle, payload) {
            Ok(written) => written,
            Err(err) => {
                let err = Error::new(ErrorKind::Io)
                    .with_message("failed to write record")
                    .with_path(&file.path)
                    .with_offset(file.size)
                    .with_hint("The partially written file was discarded; the next push starts a new file.")
                    .with_source(err);
                // A partial frame may sit at the tail; the file can never be finalized.
                if let Err(remove_err) = self.abandon() {
                    tracing::warn!(topic = %self.topic, error = %remove_err, "failed to remove partially written file");
                }
                return Err(err);
            }
        };
        file.size += written as u64;
        let size = file.size;
        if self.rotation.should_rotate(size) {
            self.rotate()?;
        }
        Ok(())
    }

    /// Closes the current file and renames it to its finalized name.
    pub fn rotate(&mut self) -> Result<(), Error> {
        let Some(mut file) = self.current.take() else {
            return Ok(());
        };
        if let Err(err) = self.finalize(&mut file) {
            self.current = Some(file);
            return Err(err);
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        file.handle.flush().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to flush records")
                .with_path(&file.path)
                .with_source(err)
        })
    }

    /// Finalizes the current file. A failed finalize leaves the in-progress file behind.
    pub fn close(mut self) -> Result<(), Error> {
        let result = self.rotate();
        self.current = None;
        result
    }

    /// Abandons the current file: closes the handle and removes the in-progress file.
    pub fn close_on_failure(mut self) -> Result<(), Error> {
        self.abandon()
    }

    fn abandon(&mut self) -> Result<(), Error> {
        let Some(mut file) = self.current.take() else {
            return Ok(());
        };
        if let Err(err) = self.fs.close(&mut file.handle) {
            tracing::warn!(path = %file.path.display(), error = %err, "close failed while abandoning file");
        }
        self.fs.remove(&file.path)?;
        tracing::info!(topic = %self.topic, path = %file.path.display(), "abandoned in-progress file");
        Ok(())
    }

    fn ensure_open(&mut self) -> Result<&mut OpenFile, Error> {
        if self.current.is_none() {
            if !self.dir_ready {
                self.fs.mkdir_all(&self.topic_dir, TOPIC_DIR_MODE)?;
                self.dir_ready = true;
            }
            let base = self.namer.next_name();
            let path = self.topic_dir.join(in_progress_name(&base));
            let handle = self.fs.open_write(&path)?;
            tracing::debug!(topic = %self.topic, path = %path.display(), "opened pipe file");
            self.current = Some(OpenFile {
                base,
                path,
                handle,
                size: 0,
            });
        }
        self.current.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("producer lost its open file")
        })
    }

    fn finalize(&self, file: &mut OpenFile) -> Result<(), Error> {
        self.fs.close(&mut file.handle)?;
        let final_path = self.topic_dir.join(&file.base);
        self.fs.rename(&file.path, &final_path)?;
        tracing::info!(
            topic = %self.topic,
            file = %file.base,
            bytes = file.size,
            "rotated pipe file"
        );
        Ok(())
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.current.is_none() {
            return;
        }
        if let Err(err) = self.rotate() {
            tracing::warn!(topic = %self.topic, error = %err, "failed to finalize pipe file on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Producer;
    use crate::core::error::ErrorKind;
    use crate::core::frame::Framing;
    use crate::core::fs::{DfsAdapter, PipeFs};
    use crate::core::memory::{Fault, FsOp, MemoryClient};
    use crate::core::retry::RetryPolicy;
    use crate::core::rotation::{RotationPolicy, parse_file_name};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    fn producer(client: &MemoryClient, max_file_size: u64) -> Producer {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1));
        let fs: Arc<dyn PipeFs> =
            Arc::new(DfsAdapter::new(client.clone()).with_policies(policy.clone(), policy));
        Producer::new(
            fs,
            "orders",
            PathBuf::from("/pipes/orders"),
            Framing::Delimited,
            RotationPolicy::new(max_file_size),
        )
    }

    fn listing(client: &MemoryClient) -> Vec<String> {
        use crate::core::client::DfsClient;
        client
            .read_dir(Path::new("/pipes/orders"))
            .expect("list")
            .into_iter()
            .map(|status| status.name)
            .collect()
    }

    #[test]
    fn push_creates_in_progress_file_and_close_finalizes() {
        let client = MemoryClient::new();
        let mut producer = producer(&client, 1024);
        producer.push(b"a").expect("push");
        producer.push(b"b").expect("push");

        let names = listing(&client);
        assert_eq!(names.len(), 1);
        assert!(parse_file_name(&names[0]).expect("pipe file").in_progress);

        producer.close().expect("close");
        let names = listing(&client);
        assert_eq!(names.len(), 1);
        let file = parse_file_name(&names[0]).expect("pipe file");
        assert!(!file.in_progress);
        let path = Path::new("/pipes/orders").join(&file.base);
        assert_eq!(client.contents(path), Some(b"a\nb\n".to_vec()));
    }

    #[test]
    fn rotates_when_size_threshold_is_reached() {
        let client = MemoryClient::new();
        let mut producer = producer(&client, 4);
        producer.push(b"one").expect("push");
        assert!(producer.current_file().is_none());
        producer.push(b"x").expect("push");
        producer.push(b"yz").expect("push");
        assert!(producer.current_file().is_none());

        let names = listing(&client);
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| !parse_file_name(name).expect("pipe").in_progress));
        assert_eq!(client.calls(FsOp::Mkdir), 1);
    }

    #[test]
    fn transient_rename_and_close_failures_are_invisible() {
        let client = MemoryClient::new();
        let mut producer = producer(&client, 1024);
        producer.push(b"a").expect("push");
        client.inject(FsOp::Close, Fault::standby(), 2);
        client.inject(FsOp::Rename, Fault::standby(), 2);
        producer.rotate().expect("rotate");
        assert_eq!(client.calls(FsOp::Rename), 3);
        assert!(!parse_file_name(&listing(&client)[0]).expect("pipe").in_progress);
    }

    #[test]
    fn failed_rotation_keeps_file_for_retry() {
        let client = MemoryClient::new();
        let mut producer = producer(&client, 1024);
        producer.push(b"a").expect("push");
        client.inject(
            FsOp::Rename,
            Fault::new(ErrorKind::Permission, "denied")
                .with_exception("org.apache.hadoop.security.AccessControlException"),
            1,
        );
        let err = producer.rotate().expect_err("permission");
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(producer.current_file().is_some());
        producer.rotate().expect("second attempt");
        assert!(producer.current_file().is_none());
    }

    #[test]
    fn close_on_failure_removes_partial_file() {
        let client = MemoryClient::new();
        let mut producer = producer(&client, 1024);
        producer.push(b"partial").expect("push");
        producer.close_on_failure().expect("abandon");
        assert!(listing(&client).is_empty());
    }

    #[test]
    fn drop_finalizes_open_file() {
        let client = MemoryClient::new();
        {
            let mut producer = producer(&client, 1024);
            producer.push(b"a").expect("push");
        }
        let names = listing(&client);
        assert_eq!(names.len(), 1);
        assert!(!parse_file_name(&names[0]).expect("pipe").in_progress);
    }

    #[test]
    fn failed_write_discards_file_and_next_push_starts_fresh() {
        let client = MemoryClient::new();
        let mut producer = producer(&client, 1024);
        // The payload write goes through; the delimiter write fails.
        client.inject_after(FsOp::Write, 1, Fault::new(ErrorKind::Io, "pipeline broke"), 1);

        let err = producer.push(b"alpha").expect_err("write fails");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.offset(), Some(0));
        assert!(producer.current_file().is_none());
        assert!(listing(&client).is_empty());

        producer.push(b"beta").expect("push");
        producer.close().expect("close");
        let names = listing(&client);
        assert_eq!(names.len(), 1);
        let file = parse_file_name(&names[0]).expect("pipe file");
        assert!(!file.in_progress);
        let path = Path::new("/pipes/orders").join(&file.base);
        assert_eq!(client.contents(path), Some(b"beta\n".to_vec()));
    }

    #[test]
    fn invalid_payload_writes_nothing() {
        let client = MemoryClient::new();
        let mut producer = producer(&client, 1024);
        let err = producer.push(b"a\nb").expect_err("newline");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(client.calls(FsOp::Mkdir), 0);
    }
}
