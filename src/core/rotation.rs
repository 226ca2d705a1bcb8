//! Purpose: Topic directory layout, pipe file naming and next-file discovery.
//! Exports: `TopicLayout`, `FileNamer`, `PipeFile`, `parse_file_name`, `NextFile`, `next_file`,
//!          `RotationPolicy`, `IN_PROGRESS_SUFFIX`.
//! Role: Shared bookkeeping between producers (naming, rotation) and consumers (discovery).
//! Invariants: Base names sort lexically in rotation order; `.open` marks an unfinished file.
//! Invariants: Discovery checks cancellation before touching the filesystem.
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind};
use crate::core::fs::PipeFs;

pub const IN_PROGRESS_SUFFIX: &str = ".open";
pub const FILE_EXTENSION: &str = ".rec";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

const STAMP_DIGITS: usize = 20;

#[derive(Clone, Debug)]
pub struct TopicLayout {
    base_dir: PathBuf,
}

impl TopicLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn topic_dir(&self, topic: &str) -> Result<PathBuf, Error> {
        validate_topic(topic)?;
        Ok(self.base_dir.join(topic))
    }
}

fn validate_topic(topic: &str) -> Result<(), Error> {
    let problem = if topic.is_empty() {
        Some("topic name is empty")
    } else if topic.contains('/') || topic.contains('\\') {
        Some("topic name must not contain path separators")
    } else if topic.starts_with('.') {
        Some("topic name must not start with '.'")
    } else {
        None
    };
    match problem {
        Some(message) => Err(Error::new(ErrorKind::Usage)
            .with_message(message)
            .with_hint("Use a plain directory name such as `orders`.")),
        None => Ok(()),
    }
}

/// A recognised pipe file name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PipeFile {
    /// Finalized name, without the in-progress suffix.
    pub base: String,
    pub in_progress: bool,
}

impl PipeFile {
    pub fn file_name(&self) -> String {
        if self.in_progress {
            format!("{}{IN_PROGRESS_SUFFIX}", self.base)
        } else {
            self.base.clone()
        }
    }
}

pub fn parse_file_name(name: &str) -> Option<PipeFile> {
    let (base, in_progress) = match name.strip_suffix(IN_PROGRESS_SUFFIX) {
        Some(base) => (base, true),
        None => (name, false),
    };
    let stamp = base.strip_suffix(FILE_EXTENSION)?;
    if stamp.len() != STAMP_DIGITS || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(PipeFile {
        base: base.to_string(),
        in_progress,
    })
}

pub fn in_progress_name(base: &str) -> String {
    format!("{base}{IN_PROGRESS_SUFFIX}")
}

/// Strictly increasing file names derived from the wall clock.
#[derive(Debug, Default)]
pub struct FileNamer {
    last: u128,
}

impl FileNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&mut self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        let stamp = now.max(self.last + 1);
        self.last = stamp;
        format!("{stamp:0width$}{FILE_EXTENSION}", width = STAMP_DIGITS)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NextFile {
    /// Finalized file, safe to open.
    Ready(String),
    /// Next file exists but is still being written.
    InProgress(String),
    /// Nothing after the current file yet.
    Pending,
    Canceled,
}

/// Finds the first file after `current` (a finalized base name) in rotation order.
pub fn next_file(
    fs: &dyn PipeFs,
    topic_dir: &Path,
    current: Option<&str>,
    cancel: &CancelToken,
) -> Result<NextFile, Error> {
    if cancel.is_canceled() {
        return Ok(NextFile::Canceled);
    }
    let names = match fs.list_dir(topic_dir) {
        Ok(names) => names,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(NextFile::Pending),
        Err(err) => return Err(err),
    };
    let mut candidates: Vec<PipeFile> = names
        .iter()
        .filter_map(|name| parse_file_name(name))
        .filter(|file| current.is_none_or(|current| file.base.as_str() > current))
        .collect();
    // Finalized before in-progress when both names are visible for one base.
    candidates.sort_by(|a, b| a.base.cmp(&b.base).then(a.in_progress.cmp(&b.in_progress)));
    let next = match candidates.into_iter().next() {
        None => NextFile::Pending,
        Some(file) if file.in_progress => NextFile::InProgress(file.file_name()),
        Some(file) => NextFile::Ready(file.base),
    };
    tracing::debug!(dir = %topic_dir.display(), current, ?next, "discovery poll");
    Ok(next)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RotationPolicy {
    max_file_size: u64,
}

impl RotationPolicy {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn should_rotate(&self, size: u64) -> bool {
        size >= self.max_file_size
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE)
    }
}
