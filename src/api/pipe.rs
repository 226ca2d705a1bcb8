//! Purpose: Pipe factory wiring one filesystem into per-topic producers and consumers.
//! Exports: `Pipe`.
//! Role: Entry point for hosts and the CLI; owns the cancel token discovery observes.
//! Invariants: Every producer and consumer of a pipe shares its filesystem and cancel token.
use std::sync::Arc;
use std::time::Duration;

use crate::api::config::{PipeConfig, PipeKind};
use crate::api::consumer::{Consumer, Position};
use crate::api::producer::Producer;
use crate::core::cancel::CancelToken;
use crate::core::client::DfsClient;
use crate::core::error::Error;
use crate::core::frame::Framing;
use crate::core::fs::{DfsAdapter, LocalFs, PipeFs};
use crate::core::rotation::{RotationPolicy, TopicLayout, parse_file_name};
use crate::core::webhdfs::WebHdfsClient;

#[derive(Clone)]
pub struct Pipe {
    fs: Arc<dyn PipeFs>,
    layout: TopicLayout,
    framing: Framing,
    rotation: RotationPolicy,
    backoff: Duration,
    cancel: CancelToken,
}

impl Pipe {
    /// Builds the backend named by `config.kind`.
    pub fn open(config: &PipeConfig) -> Result<Self, Error> {
        match config.kind {
            PipeKind::Hdfs => {
                let client = WebHdfsClient::new(&config.hdfs.namenode, config.hdfs.user.clone())?;
                Self::hdfs(config, client)
            }
            PipeKind::File => Self::local(config),
        }
    }

    pub fn hdfs<C>(config: &PipeConfig, client: C) -> Result<Self, Error>
    where
        C: DfsClient + 'static,
    {
        config.validate()?;
        let fs = DfsAdapter::new(client)
            .with_policies(config.metadata_policy(), config.close_policy());
        Ok(Self::with_fs(config, Arc::new(fs)))
    }

    pub fn local(config: &PipeConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::with_fs(config, Arc::new(LocalFs::new())))
    }

    pub fn with_fs(config: &PipeConfig, fs: Arc<dyn PipeFs>) -> Self {
        tracing::info!(
            kind = fs.kind(),
            base_dir = %config.base_dir.display(),
            framing = ?config.framing,
            max_file_size = config.max_file_size,
            "pipe ready"
        );
        Self {
            fs,
            layout: TopicLayout::new(config.base_dir.clone()),
            framing: config.framing,
            rotation: config.rotation_policy(),
            backoff: config.discovery_backoff(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.fs.kind()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn fs(&self) -> &Arc<dyn PipeFs> {
        &self.fs
    }

    pub fn producer(&self, topic: &str) -> Result<Producer, Error> {
        let topic_dir = self.layout.topic_dir(topic)?;
        Ok(Producer::new(
            self.fs.clone(),
            topic,
            topic_dir,
            self.framing,
            self.rotation,
        ))
    }

    pub fn consumer(&self, topic: &str) -> Result<Consumer, Error> {
        let topic_dir = self.layout.topic_dir(topic)?;
        Consumer::new(
            self.fs.clone(),
            topic_dir,
            self.framing,
            self.backoff,
            self.cancel.clone(),
        )
    }

    pub fn consumer_from(&self, topic: &str, position: &Position) -> Result<Consumer, Error> {
        let topic_dir = self.layout.topic_dir(topic)?;
        Consumer::resume(
            self.fs.clone(),
            topic_dir,
            self.framing,
            self.backoff,
            self.cancel.clone(),
            position,
        )
    }

    /// Pipe files of `topic` in rotation order, in-progress ones included.
    pub fn list_files(&self, topic: &str) -> Result<Vec<String>, Error> {
        let topic_dir = self.layout.topic_dir(topic)?;
        let mut files: Vec<_> = self
            .fs
            .list_dir(&topic_dir)?
            .iter()
            .filter_map(|name| parse_file_name(name))
            .collect();
        files.sort_by(|a, b| a.base.cmp(&b.base).then(a.in_progress.cmp(&b.in_progress)));
        Ok(files.iter().map(|file| file.file_name()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::Pipe;
    use crate::api::config::{PipeConfig, PipeKind};
    use crate::core::error::ErrorKind;
    use crate::core::memory::MemoryClient;

    #[test]
    fn kind_reflects_backend() {
        let config = PipeConfig::default();
        let pipe = Pipe::hdfs(&config, MemoryClient::new()).expect("hdfs");
        assert_eq!(pipe.kind(), "hdfs");

        let config = PipeConfig {
            kind: PipeKind::File,
            ..PipeConfig::default()
        };
        assert_eq!(Pipe::open(&config).expect("file").kind(), "file");
    }

    #[test]
    fn invalid_topics_are_rejected() {
        let pipe = Pipe::hdfs(&PipeConfig::default(), MemoryClient::new()).expect("pipe");
        let err = pipe.producer("../etc").err().expect("bad topic");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = pipe.consumer("").err().expect("bad topic");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn cancel_token_is_shared_with_consumers() {
        let pipe = Pipe::hdfs(&PipeConfig::default(), MemoryClient::new()).expect("pipe");
        let mut consumer = pipe.consumer("orders").expect("consumer");
        pipe.cancel_token().cancel();
        assert!(consumer.fetch_next().expect("canceled").is_none());
    }

    #[test]
    fn list_files_orders_and_filters() {
        let client = MemoryClient::new();
        let pipe = Pipe::hdfs(&PipeConfig::default(), client.clone()).expect("pipe");
        let mut producer = pipe.producer("orders").expect("producer");
        producer.push(b"a").expect("push");
        producer.rotate().expect("rotate");
        producer.push(b"b").expect("push");

        let files = pipe.list_files("orders").expect("list");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with(".rec"));
        assert!(files[1].ends_with(".rec.open"));
        producer.close().expect("close");
    }
}
