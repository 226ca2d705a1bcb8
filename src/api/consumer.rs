//! Purpose: Polling consumer that streams records from a topic's finalized files in order.
//! Exports: `Consumer`, `ConsumerState`, `Record`, `Position`.
//! Role: Reader half of a pipe; waits out in-progress files with a cancellable backoff.
//! Invariants: Never opens a file carrying the in-progress suffix.
//! Invariants: Advances strictly forward through files; an exhausted file is never reopened.
//! Invariants: After an error every fetch fails and iteration ends; after cancellation every call
//!             returns `Ok(None)`.
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Framing;
use crate::core::fs::{PipeFs, ReadStream};
use crate::core::rotation::{NextFile, next_file, parse_file_name};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    /// Finalized file name the record was read from.
    pub file: String,
    /// Byte offset of the record's frame within `file`.
    pub offset: u64,
    pub payload: Bytes,
}

/// Resume point: the next unread byte of `file`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Position {
    pub file: String,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsumerState {
    Idle,
    Locating,
    Reading,
    Canceled,
    Errored,
}

pub struct Consumer {
    fs: Arc<dyn PipeFs>,
    topic_dir: PathBuf,
    framing: Framing,
    backoff: Duration,
    cancel: CancelToken,
    state: ConsumerState,
    current: Option<String>,
    reader: Option<BufReader<ReadStream>>,
    offset: u64,
}

impl Consumer {
    /// Builds a consumer and primes it: a finalized first file is opened right away.
    pub(crate) fn new(
        fs: Arc<dyn PipeFs>,
        topic_dir: PathBuf,
        framing: Framing,
        backoff: Duration,
        cancel: CancelToken,
    ) -> Result<Self, Error> {
        let mut consumer = Self::unprimed(fs, topic_dir, framing, backoff, cancel);
        match next_file(consumer.fs.as_ref(), &consumer.topic_dir, None, &consumer.cancel)? {
            NextFile::Ready(name) => consumer.open(name, 0)?,
            NextFile::Canceled => consumer.state = ConsumerState::Canceled,
            NextFile::InProgress(_) | NextFile::Pending => {}
        }
        Ok(consumer)
    }

    /// Builds a consumer that resumes at `position`, which must name a finalized file.
    pub(crate) fn resume(
        fs: Arc<dyn PipeFs>,
        topic_dir: PathBuf,
        framing: Framing,
        backoff: Duration,
        cancel: CancelToken,
        position: &Position,
    ) -> Result<Self, Error> {
        let finalized = parse_file_name(&position.file).filter(|file| !file.in_progress);
        let Some(file) = finalized else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("cannot resume from {:?}", position.file))
                .with_path(&topic_dir)
                .with_hint("Resume from the `file` of a delivered record, e.g. 00000000000000000001.rec."));
        };
        let mut consumer = Self::unprimed(fs, topic_dir, framing, backoff, cancel);
        consumer.open(file.base, position.offset)?;
        Ok(consumer)
    }

    fn unprimed(
        fs: Arc<dyn PipeFs>,
        topic_dir: PathBuf,
        framing: Framing,
        backoff: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            fs,
            topic_dir,
            framing,
            backoff,
            cancel,
            state: ConsumerState::Idle,
            current: None,
            reader: None,
            offset: 0,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn topic_dir(&self) -> &Path {
        &self.topic_dir
    }

    pub fn position(&self) -> Option<Position> {
        self.current.as_ref().map(|file| Position {
            file: file.clone(),
            offset: self.offset,
        })
    }

    /// `Ok(Some)` is the next record, `Ok(None)` means canceled; blocks while no finalized file
    /// is available.
    pub fn fetch_next(&mut self) -> Result<Option<Record>, Error> {
        loop {
            match self.state {
                ConsumerState::Errored => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("consumer stopped after an earlier error")
                        .with_path(&self.topic_dir));
                }
                ConsumerState::Canceled => return Ok(None),
                ConsumerState::Reading => match self.read_record() {
                    Ok(Some(record)) => return Ok(Some(record)),
                    Ok(None) => {
                        self.reader = None;
                        self.state = ConsumerState::Locating;
                    }
                    Err(err) => return Err(self.fail(err)),
                },
                ConsumerState::Idle | ConsumerState::Locating => {
                    self.state = ConsumerState::Locating;
                    let found = next_file(
                        self.fs.as_ref(),
                        &self.topic_dir,
                        self.current.as_deref(),
                        &self.cancel,
                    );
                    match found {
                        Err(err) => return Err(self.fail(err)),
                        Ok(NextFile::Canceled) => return Ok(self.canceled()),
                        Ok(NextFile::Ready(name)) => {
                            if let Err(err) = self.open(name, 0) {
                                return Err(self.fail(err));
                            }
                        }
                        Ok(NextFile::InProgress(_)) | Ok(NextFile::Pending) => {
                            if self.cancel.wait(self.backoff) {
                                return Ok(self.canceled());
                            }
                        }
                    }
                }
            }
        }
    }

    fn open(&mut self, name: String, offset: u64) -> Result<(), Error> {
        let path = self.topic_dir.join(&name);
        let stream = self.fs.open_read(&path, offset)?;
        tracing::debug!(path = %path.display(), offset, "opened pipe file for reading");
        self.reader = Some(BufReader::new(stream));
        self.current = Some(name);
        self.offset = offset;
        self.state = ConsumerState::Reading;
        Ok(())
    }

    fn read_record(&mut self) -> Result<Option<Record>, Error> {
        let (Some(reader), Some(file)) = (self.reader.as_mut(), self.current.as_ref()) else {
            return Ok(None);
        };
        let frame = self.framing.read_record(reader).map_err(|err| {
            err.with_path(self.topic_dir.join(file))
                .with_offset(self.offset)
        })?;
        let Some((payload, used)) = frame else {
            return Ok(None);
        };
        let record = Record {
            file: file.clone(),
            offset: self.offset,
            payload: Bytes::from(payload),
        };
        self.offset += used as u64;
        Ok(Some(record))
    }

    fn fail(&mut self, err: Error) -> Error {
        tracing::debug!(dir = %self.topic_dir.display(), error = %err, "consumer stopped");
        self.reader = None;
        self.state = ConsumerState::Errored;
        err
    }

    fn canceled(&mut self) -> Option<Record> {
        self.reader = None;
        self.state = ConsumerState::Canceled;
        None
    }
}

impl Iterator for Consumer {
    type Item = Result<Record, Error>;

    /// Yields the error that stopped the consumer once, then ends.
    fn next(&mut self) -> Option<Self::Item> {
        if self.state == ConsumerState::Errored {
            return None;
        }
        self.fetch_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::{Consumer, ConsumerState, Position};
    use crate::core::cancel::CancelToken;
    use crate::core::error::ErrorKind;
    use crate::core::frame::Framing;
    use crate::core::fs::{DfsAdapter, PipeFs};
    use crate::core::memory::{Fault, FsOp, MemoryClient};
    use crate::core::retry::RetryPolicy;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const A: &str = "00000000000000000001.rec";
    const B: &str = "00000000000000000002.rec";
    const DIR: &str = "/pipes/t";

    fn setup() -> (MemoryClient, Arc<dyn PipeFs>) {
        let client = MemoryClient::new();
        let policy = RetryPolicy::new(Duration::from_millis(50), Duration::from_millis(1));
        let fs = DfsAdapter::new(client.clone()).with_policies(policy.clone(), policy);
        (client, Arc::new(fs))
    }

    fn write_file(fs: &Arc<dyn PipeFs>, name: &str, contents: &[u8]) {
        let mut handle = fs.open_write(&Path::new(DIR).join(name)).expect("open");
        handle.write_all(contents).expect("write");
        fs.close(&mut handle).expect("close");
    }

    fn consumer(fs: &Arc<dyn PipeFs>, cancel: &CancelToken) -> Consumer {
        Consumer::new(
            fs.clone(),
            PathBuf::from(DIR),
            Framing::Delimited,
            Duration::from_millis(10),
            cancel.clone(),
        )
        .expect("consumer")
    }

    #[test]
    fn priming_opens_first_finalized_file() {
        let (_client, fs) = setup();
        write_file(&fs, A, b"a1\n");
        let consumer = consumer(&fs, &CancelToken::new());
        assert_eq!(consumer.state(), ConsumerState::Reading);
        assert_eq!(
            consumer.position(),
            Some(Position {
                file: A.to_string(),
                offset: 0
            })
        );
    }

    #[test]
    fn priming_without_files_stays_idle() {
        let (_client, fs) = setup();
        let consumer = consumer(&fs, &CancelToken::new());
        assert_eq!(consumer.state(), ConsumerState::Idle);
        assert!(consumer.position().is_none());
    }

    #[test]
    fn reads_across_files_in_order() {
        let (client, fs) = setup();
        write_file(&fs, B, b"b1\n");
        write_file(&fs, A, b"a1\na2\n");
        let cancel = CancelToken::new();
        let mut consumer = consumer(&fs, &cancel);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let record = consumer.fetch_next().expect("fetch").expect("record");
            seen.push((record.file, record.offset, record.payload.to_vec()));
        }
        assert_eq!(
            seen,
            vec![
                (A.to_string(), 0, b"a1".to_vec()),
                (A.to_string(), 3, b"a2".to_vec()),
                (B.to_string(), 0, b"b1".to_vec()),
            ]
        );
        assert_eq!(client.calls(FsOp::Open), 2);

        cancel.cancel();
        assert!(consumer.fetch_next().expect("canceled").is_none());
        assert_eq!(consumer.state(), ConsumerState::Canceled);
        assert!(consumer.fetch_next().expect("still canceled").is_none());
        assert_eq!(client.calls(FsOp::Open), 2);
    }

    #[test]
    fn waits_for_in_progress_file_to_be_finalized() {
        let (client, fs) = setup();
        write_file(&fs, A, b"a1\n");
        write_file(&fs, "00000000000000000002.rec.open", b"b1\n");
        let mut consumer = consumer(&fs, &CancelToken::new());
        assert_eq!(&consumer.fetch_next().expect("a1").expect("record").payload[..], b"a1");

        let renamer = {
            let fs = fs.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                fs.rename(
                    &Path::new(DIR).join("00000000000000000002.rec.open"),
                    &Path::new(DIR).join(B),
                )
                .expect("rename");
            })
        };
        let record = consumer.fetch_next().expect("b1").expect("record");
        renamer.join().expect("join");
        assert_eq!(record.file, B);
        assert_eq!(&record.payload[..], b"b1");
        assert!(client.calls(FsOp::ReadDir) >= 3);
    }

    #[test]
    fn cancel_interrupts_backoff_promptly() {
        let (_client, fs) = setup();
        let cancel = CancelToken::new();
        let mut consumer = Consumer::new(
            fs,
            PathBuf::from(DIR),
            Framing::Delimited,
            Duration::from_secs(30),
            cancel.clone(),
        )
        .expect("consumer");

        let canceler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let start = Instant::now();
        assert!(consumer.fetch_next().expect("canceled").is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        canceler.join().expect("join");
        assert_eq!(consumer.state(), ConsumerState::Canceled);
    }

    #[test]
    fn discovery_error_is_returned_then_sticky() {
        let (client, fs) = setup();
        let mut consumer = consumer(&fs, &CancelToken::new());
        client.inject(
            FsOp::ReadDir,
            Fault::new(ErrorKind::Permission, "denied")
                .with_exception("org.apache.hadoop.security.AccessControlException"),
            1,
        );
        let err = consumer.fetch_next().expect_err("permission");
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert_eq!(consumer.state(), ConsumerState::Errored);
        let err = consumer.fetch_next().expect_err("sticky");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn iterator_ends_after_yielding_the_error() {
        let (client, fs) = setup();
        let consumer = consumer(&fs, &CancelToken::new());
        client.inject(FsOp::ReadDir, Fault::new(ErrorKind::Permission, "denied"), 1);
        let items: Vec<_> = consumer.take(100).collect();
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().expect("item").expect_err("error");
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn truncated_record_is_corrupt_with_location() {
        let (_client, fs) = setup();
        write_file(&fs, A, b"ok\nbroken");
        let mut consumer = consumer(&fs, &CancelToken::new());
        consumer.fetch_next().expect("ok").expect("record");
        let err = consumer.fetch_next().expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.offset(), Some(3));
        assert_eq!(err.path(), Some(Path::new(DIR).join(A).as_path()));
        assert_eq!(consumer.state(), ConsumerState::Errored);
    }

    #[test]
    fn resume_continues_at_position() {
        let (_client, fs) = setup();
        write_file(&fs, A, b"a1\na2\n");
        write_file(&fs, B, b"b1\n");
        let position = Position {
            file: A.to_string(),
            offset: 3,
        };
        let mut consumer = Consumer::resume(
            fs,
            PathBuf::from(DIR),
            Framing::Delimited,
            Duration::from_millis(10),
            CancelToken::new(),
            &position,
        )
        .expect("resume");
        let payloads: Vec<Vec<u8>> = consumer
            .by_ref()
            .take(2)
            .map(|record| record.expect("record").payload.to_vec())
            .collect();
        assert_eq!(payloads, vec![b"a2".to_vec(), b"b1".to_vec()]);
        assert_eq!(
            consumer.position(),
            Some(Position {
                file: B.to_string(),
                offset: 3
            })
        );
    }

    #[test]
    fn resume_rejects_in_progress_and_foreign_names() {
        let (client, fs) = setup();
        write_file(&fs, "00000000000000000003.rec.open", b"unfinished\n");
        for name in ["00000000000000000003.rec.open", "../other/x", "notes.txt", ""] {
            let position = Position {
                file: name.to_string(),
                offset: 0,
            };
            let err = Consumer::resume(
                fs.clone(),
                PathBuf::from(DIR),
                Framing::Delimited,
                Duration::from_millis(10),
                CancelToken::new(),
                &position,
            )
            .err()
            .expect("rejected");
            assert_eq!(err.kind(), ErrorKind::Usage, "{name}");
        }
        assert_eq!(client.calls(FsOp::Open), 0);
    }
}
