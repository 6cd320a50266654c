//! Selkie Runtime
//!
//! The multi-worker service scheduler: message dispatch, service lifecycle,
//! cross-worker routing, per-worker timers, and the prefab zero-copy
//! payload cache. Sockets are provided per worker by `selkie-net`; the
//! scripting layer that usually sits on top of services is a handler
//! implementation behind [`Service`], not a runtime concern.
//!
//! # Concurrency model
//!
//! N workers, each a dedicated OS thread running a cooperative
//! current-thread loop. A service lives on exactly one worker and its
//! handler is never invoked concurrently with itself; services share no
//! mutable memory and interact only by message passing. FIFO is guaranteed
//! per (sender, receiver) pair; nothing is promised across senders.

mod prefab;
mod timer;
mod worker;

pub mod server;
pub mod service;

pub use selkie_net::{SocketMux, WriteFlag};
pub use server::Server;
pub use service::{Service, ServiceConf, ServiceContext, ServiceFactory};
