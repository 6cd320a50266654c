//! Selkie Net
//!
//! The per-worker socket multiplexer. Every socket opened by a service is
//! owned by its worker's multiplexer; connection tasks run on that worker's
//! `LocalSet`, so every completion is produced on the owning worker's
//! thread and delivered to the service as an ordinary message.
//!
//! # TigerStyle
//!
//! - One outstanding read per connection, explicit rejection otherwise
//! - Send-queue backpressure with explicit warn/error thresholds
//! - No locks: all multiplexer state is single-threaded by construction

mod connection;
pub mod mux;

pub use mux::{ConnState, SocketMux, WriteFlag};
