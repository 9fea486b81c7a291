//! Command layer: shape validation and dispatch against the storage engine.
//!
//! ```text
//! framed RespValue ──> CommandHandler ──> StorageEngine
//!                          │
//!                          └──> reply RespValue
//! ```
//!
//! Every reply, including `-ERR ...` for unknown verbs or bad arity, goes
//! back to the client; only framing and transport failures close a
//! connection.

pub mod handler;

pub use handler::CommandHandler;
