//! Document and status state for one collection, kept in step with the
//! backend.
//!
//! [`ResourceSync`] is bound to a single collection key. `load`, `save` and
//! `run` each spawn one request task and return immediately; when the response
//! settles the task writes the outcome into the shared state and fires the
//! change hook. Requests are independent: nothing is queued, and the status
//! reflects whichever response settled last.
//!
//! Once [`ResourceSync::retire`] has been called (the owning session moved to
//! another key) requests already in flight still run to completion, but their
//! results are discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientError, CollectionsClient};

pub const STATUS_SAVED: &str = "saved";
pub const STATUS_RUNNING: &str = "running";
/// Status prefix when a request could not be started at all.
pub const STATUS_NOT_SENT: &str = "Request not sent";

/// Called after every change to the document or status.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct SyncState {
    document: Option<String>,
    status: Option<String>,
    retired: bool,
}

fn lock(state: &Mutex<SyncState>) -> MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared by a `ResourceSync` and the request tasks it spawns.
#[derive(Clone)]
struct Slot {
    key: Arc<str>,
    state: Arc<Mutex<SyncState>>,
    on_change: ChangeHook,
}

impl Slot {
    /// Apply `update` unless the owner has been retired.
    fn settle(&self, op: &'static str, update: impl FnOnce(&mut SyncState)) {
        {
            let mut state = lock(&self.state);
            if state.retired {
                debug!(key = %self.key, op, "discarding result for retired collection");
                return;
            }
            update(&mut state);
        }
        (self.on_change)();
    }
}

pub struct ResourceSync {
    slot: Slot,
    client: Arc<CollectionsClient>,
}

impl ResourceSync {
    pub fn new(
        key: impl Into<String>,
        client: Arc<CollectionsClient>,
        on_change: ChangeHook,
    ) -> Self {
        let key: String = key.into();
        Self {
            slot: Slot {
                key: Arc::from(key),
                state: Arc::new(Mutex::new(SyncState::default())),
                on_change,
            },
            client,
        }
    }

    pub fn key(&self) -> &str {
        &self.slot.key
    }

    /// Current document text; `None` until the first successful load or edit.
    pub fn document(&self) -> Option<String> {
        lock(&self.slot.state).document.clone()
    }

    /// Replace the document text locally. No backend call is made.
    pub fn set_document(&self, text: impl Into<String>) {
        let text = text.into();
        self.slot.settle("edit", |state| state.document = Some(text));
    }

    /// Outcome of the most recent load/save/run attempt, if any.
    pub fn status(&self) -> Option<String> {
        lock(&self.slot.state).status.clone()
    }

    pub fn is_retired(&self) -> bool {
        lock(&self.slot.state).retired
    }

    /// Fetch the collection and store it, pretty-printed, as the document.
    /// On failure the document is left alone and the status carries the error.
    pub fn load(&self) -> Option<JoinHandle<()>> {
        let client = Arc::clone(&self.client);
        let slot = self.slot.clone();
        self.spawn("load", async move {
            match client.get(&slot.key).await.and_then(|body| render_document(&body)) {
                Ok(text) => {
                    debug!(key = %slot.key, bytes = text.len(), "collection loaded");
                    slot.settle("load", |state| state.document = Some(text));
                }
                Err(e) => {
                    info!(key = %slot.key, "load failed: {e}");
                    slot.settle("load", |state| state.status = Some(e.to_string()));
                }
            }
        })
    }

    /// Persist `content` under this key. Never touches the document.
    pub fn save(&self, content: impl Into<String>) -> Option<JoinHandle<()>> {
        let content = content.into();
        let client = Arc::clone(&self.client);
        let slot = self.slot.clone();
        self.spawn("save", async move {
            let status = match client.save(&slot.key, &content).await {
                Ok(_) => STATUS_SAVED.to_string(),
                Err(e) => {
                    info!(key = %slot.key, "save failed: {e}");
                    e.to_string()
                }
            };
            slot.settle("save", |state| state.status = Some(status));
        })
    }

    /// Execute the stored collection. The status reads [`STATUS_RUNNING`]
    /// as soon as this returns, then the compact JSON result or the error.
    pub fn run(&self) -> Option<JoinHandle<()>> {
        self.slot.settle("run", |state| {
            state.status = Some(STATUS_RUNNING.to_string());
        });
        let client = Arc::clone(&self.client);
        let slot = self.slot.clone();
        self.spawn("run", async move {
            let status = match client.run(&slot.key).await {
                Ok(result) => result.to_string(),
                Err(e) => {
                    info!(key = %slot.key, "run failed: {e}");
                    e.to_string()
                }
            };
            slot.settle("run", |state| state.status = Some(status));
        })
    }

    /// Mark this instance stale. Requests already in flight still complete,
    /// but nothing they return is applied.
    pub fn retire(&self) {
        let mut state = lock(&self.slot.state);
        if !state.retired {
            state.retired = true;
            debug!(key = %self.slot.key, "resource sync retired");
        }
    }

    /// Spawn `task` on the current runtime. Without one the request is never
    /// sent and the status says so.
    fn spawn<F>(&self, op: &'static str, task: F) -> Option<JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(task)),
            Err(e) => {
                warn!(key = %self.slot.key, op, "request not sent: {e}");
                let status = format!("{STATUS_NOT_SENT}: {e}");
                self.slot.settle(op, |state| state.status = Some(status));
                None
            }
        }
    }
}

impl Drop for ResourceSync {
    fn drop(&mut self) {
        self.retire();
    }
}

/// Render a fetched collection as the editable document text.
fn render_document(body: &Value) -> Result<String, ClientError> {
    serde_json::to_string_pretty(body)
        .map_err(|e| ClientError::Protocol(format!("Cannot render collection: {e}")))
}
