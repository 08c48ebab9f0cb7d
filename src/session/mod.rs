//! Session lifecycle management for the chat proxy.
//!
//! This is the proxy's only piece of original logic: an in-memory map from
//! session id to a record owning a remote tool-client handle, a lazily
//! constructed agent, and an append-only conversation history.
//!
//! # Architecture
//!
//! - [`Session`]: one conversation, cheap to clone (shared inner)
//! - [`SessionManager`]: concurrency-safe store, injected via `AppState`
//!
//! Per-session turns are serialized by a record-level lock; the manager
//! sweeps idle sessions in the background.

mod store;

pub use store::{Session, SessionManager, SessionOptions, STEP_CEILING_REPLY};
