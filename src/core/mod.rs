// Core modules: errors, retry, filesystem adapters, clients, rotation and framing.
pub mod cancel;
pub mod client;
pub mod error;
pub mod frame;
pub mod fs;
pub mod memory;
pub mod retry;
pub mod rotation;
pub mod webhdfs;
