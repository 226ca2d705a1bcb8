//! Purpose: Public pipe API used by the `dfspipe` CLI and embedding hosts.
//! Exports: `Pipe`, `Producer`, `Consumer`, records and positions, configuration and errors.
//! Role: Stable boundary over `core`; hosts should not need `core` paths for common use.
//! Invariants: Consumers report cancellation as `Ok(None)`, never as an error.

mod config;
mod consumer;
mod pipe;
mod producer;

pub use crate::core::cancel::CancelToken;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::frame::Framing;
pub use config::{HdfsConfig, PipeConfig, PipeKind, RetryConfig};
pub use consumer::{Consumer, ConsumerState, Position, Record};
pub use pipe::Pipe;
pub use producer::Producer;
