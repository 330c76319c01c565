//! matrix-add: a TCP compute server for parallel matrix addition
//!
//! A client sends two square integer matrices and a worker count; the
//! server splits the rows into contiguous chunks, adds each chunk on its
//! own thread, and sends back the sum.
//!
//! Modules, leaves first:
//! - `codec`: strict line-framed wire format
//! - `planner`: row-range chunking
//! - `adder`: scoped-thread parallel addition
//! - `session`: per-connection state machine
//! - `server`: accept loop with graceful shutdown
//!
//! `client` holds the reference client used by the `matrix-client` binary.

pub mod adder;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod matrix;
pub mod planner;
pub mod server;
pub mod session;

pub use error::{ComputeError, ConfigError, ProtocolError, SessionError};
pub use matrix::Matrix;
