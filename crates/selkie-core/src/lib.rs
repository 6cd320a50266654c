//! Selkie Core
//!
//! Core types for the selkie multi-worker service runtime: the message
//! envelope, the headroom-managed byte buffer, service identities, message
//! type tags, the cluster wire envelope, errors, limits, and the node
//! configuration model.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `CLUSTER_PAYLOAD_BYTES_MAX`)
//! - Assertions on internal invariants, error returns on fallible paths

pub mod buffer;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod message;

pub use buffer::Buffer;
pub use config::{NodeConfig, ServerConfigFile, ServiceBootConfig};
pub use constants::*;
pub use error::{Error, Result};
pub use message::{Field, Message, ServiceId};
