//! # relaykv - a staged-pipeline in-memory key-value server
//!
//! relaykv speaks RESP over TCP and serves GET/SET/DEL against a sharded
//! in-memory store. Instead of a task per connection, it runs a fixed set of
//! OS threads arranged as a pipeline:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                relaykv                                  │
//! │                                                                         │
//! │  ┌──────────┐      ┌─────────────────┐                                  │
//! │  │ Acceptor │─────>│ Reactor (epoll) │  edge-triggered, one-shot        │
//! │  └──────────┘      └───────┬─────────┘                                  │
//! │                   readable │ writable                                   │
//! │              ┌─────────────┴──────────────┐                             │
//! │              ▼                            ▼                             │
//! │      ┌──────────────┐             ┌──────────────┐                      │
//! │      │  read pool   │────────┐    │  write pool  │                      │
//! │      └──────────────┘        ▼    └──────▲───────┘                      │
//! │                      ┌──────────────┐    │                              │
//! │                      │ execute pool │────┘                              │
//! │                      └──────┬───────┘                                   │
//! │                             ▼                                           │
//! │  ┌──────────────────────────────────────────────┐                       │
//! │  │              StorageEngine                   │                       │
//! │  │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │                       │
//! │  │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │                       │
//! │  │  │RwLock  │ │RwLock  │ │RwLock  │ │shards  │ │                       │
//! │  │  └────────┘ └────────┘ └────────┘ └────────┘ │                       │
//! │  └──────────────────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The reactor watches every idle connection with a one-shot, edge-triggered
//! registration. A readiness event moves the descriptor out of the reactor's
//! set and into a stage pool; the stage that finishes with the connection
//! arms it again. Because a descriptor lives in exactly one stage set at a
//! time, each connection is processed by at most one worker at any instant
//! without ever contending on its mutex for scheduling.
//!
//! ## Module overview
//!
//! - [`protocol`]: RESP value type, encoder, and incremental frame parser
//! - [`storage`]: sharded key-value engine
//! - [`commands`]: command validation and dispatch
//! - [`server`]: the orchestrator: acceptor, reactor, stage pools, teardown
//! - [`config`]: startup configuration
//!
//! ## Quick start
//!
//! ```no_run
//! use relaykv::{Config, Server};
//!
//! let config = Config::default();
//! let mut server = Server::bind(&config).expect("bind");
//! let handle = server.handle();
//! // ... later, from any thread:
//! handle.signal();
//! server.run();
//! ```

pub mod commands;
pub mod config;
pub mod protocol;
pub mod server;
pub mod storage;

pub use commands::CommandHandler;
pub use config::Config;
pub use protocol::{ParseError, RespValue};
pub use server::{Server, ServerError, ShutdownHandle, StatsSnapshot};
pub use storage::{StorageEngine, NUM_SHARDS};

/// The default port, shared with every other RESP server.
pub const DEFAULT_PORT: u16 = 6379;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
