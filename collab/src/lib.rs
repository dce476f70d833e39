#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! nexus-collab library — the connection and state-synchronisation core of
//! the collection editor.
//!
//! - `config` — backend address, timeouts and log level resolution
//! - `client` — typed HTTP client for the collections backend
//! - `channel` — per-collection push channel feeding a text log
//! - `sync` — document/status state reconciled with load, save and run calls
//! - `session` — binds channel and sync to the active collection key
//! - `console` — stdio front end driving a session

pub mod channel;
pub mod client;
pub mod config;
pub mod console;
pub mod session;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelHandle, ChannelManager, ChannelState, LogSink};
pub use client::{ClientError, CollectionsClient};
pub use config::{BackendAddress, ResolvedConfig};
pub use session::{CollectionSession, SessionView};
pub use sync::ResourceSync;
