//! RedVault - A RESP-compatible key-value server with append-only persistence
//!
//! This library provides:
//! - A RESP wire codec shared by requests, replies and the persistence log
//! - A thread-safe store with string and hash keyspaces
//! - A fixed command registry with durability flags
//! - An append-only log with replay, periodic fsync and compaction
//! - A tokio TCP server and client

pub mod aof;
pub mod client;
pub mod command;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;

pub use aof::{AppendOnlyLog, FlushTask, LogState};
pub use client::Client;
pub use command::{CommandRegistry, Request};
pub use error::{RedVaultError, Result};
pub use protocol::{RespReader, Value};
pub use server::{RedVaultServer, ServerConfig};
pub use store::{Entry, MemoryStore, Store};
