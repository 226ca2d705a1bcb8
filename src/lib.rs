//! Purpose: Library crate behind the `dfspipe` CLI: rotating-file message pipes.
//! Exports: `api` (pipe factory, producer, consumer, config), `core` (filesystem, retry, rotation).
//! Role: Hosts embed `api`; `core` holds the building blocks and is public for tests and embedders.
//! Invariants: Library code never installs a tracing subscriber; binaries do.
//! Invariants: All fallible operations return `core::error::Error`.
pub mod api;
pub mod core;
