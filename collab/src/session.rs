//! Binds the push channel and the resource sync to the active collection.
//!
//! A [`CollectionSession`] owns at most one [`ActiveCollection`] at a time.
//! Activating a key loads the collection and opens its push channel; moving
//! to another key (or going idle, or dropping the session) first closes the
//! old channel and retires the old sync, so nothing from the previous key can
//! reach the new key's document, status or log.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::{close_handle, ChannelHandle, ChannelManager, LogSink};
use crate::client::{ClientError, CollectionsClient};
use crate::config::ResolvedConfig;
use crate::sync::{ChangeHook, ResourceSync};

/// Everything the presentation layer renders, captured at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub key: Option<String>,
    pub document: String,
    pub status: Option<String>,
    pub log: Vec<String>,
}

struct ActiveCollection {
    key: String,
    sync: ResourceSync,
    channel: Option<ChannelHandle>,
    log: Arc<Mutex<Vec<String>>>,
}

impl ActiveCollection {
    fn log(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct CollectionSession {
    client: Arc<CollectionsClient>,
    channels: ChannelManager,
    changed: Arc<Notify>,
    active: Option<ActiveCollection>,
}

impl CollectionSession {
    pub fn new(channels: ChannelManager, client: CollectionsClient) -> Self {
        Self {
            client: Arc::new(client),
            channels,
            changed: Arc::new(Notify::new()),
            active: None,
        }
    }

    /// Build the HTTP client and channel manager from one resolved address.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, ClientError> {
        let client = CollectionsClient::from_config(config)?;
        let channels = ChannelManager::new(config.address.clone());
        Ok(Self::new(channels, client))
    }

    /// Make `key` the active collection.
    ///
    /// An empty or absent key leaves the session idle. Re-activating the
    /// current key is a no-op.
    pub fn activate(&mut self, key: Option<&str>) {
        let key = key.filter(|k| !k.is_empty());
        if self.key() == key {
            return;
        }
        self.deactivate();
        let Some(key) = key else {
            return;
        };

        let notify = Arc::clone(&self.changed);
        let on_change: ChangeHook = Arc::new(move || notify.notify_one());

        let sync = ResourceSync::new(key, Arc::clone(&self.client), Arc::clone(&on_change));
        // Fire-and-forget: the task reports through the shared state.
        drop(sync.load());

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink: LogSink = {
            let log = Arc::clone(&log);
            Arc::new(move |entry| {
                log.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
                on_change();
            })
        };
        let channel = self.channels.open(key, sink);

        info!(key, channel = channel.is_some(), "collection activated");
        self.active = Some(ActiveCollection {
            key: key.to_string(),
            sync,
            channel,
            log,
        });
        self.changed.notify_one();
    }

    /// Close the active collection's channel and retire its sync. The session
    /// becomes idle.
    pub fn deactivate(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        close_handle(&mut active.channel);
        active.sync.retire();
        info!(key = %active.key, "collection deactivated");
        self.changed.notify_one();
    }

    pub fn key(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.key.as_str())
    }

    /// Document text; empty while idle or before the first load completes.
    pub fn document(&self) -> String {
        self.active
            .as_ref()
            .and_then(|a| a.sync.document())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<String> {
        self.active.as_ref().and_then(|a| a.sync.status())
    }

    /// Push-channel log of the active collection, oldest first.
    pub fn log(&self) -> Vec<String> {
        self.active.as_ref().map(ActiveCollection::log).unwrap_or_default()
    }

    pub fn channel(&self) -> Option<&ChannelHandle> {
        self.active.as_ref().and_then(|a| a.channel.as_ref())
    }

    pub fn snapshot(&self) -> SessionView {
        SessionView {
            key: self.key().map(String::from),
            document: self.document(),
            status: self.status(),
            log: self.log(),
        }
    }

    /// Woken after every change to document, status, log or active key.
    pub fn changed(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Replace the document with the editor's text. Ignored while idle.
    pub fn edit(&self, text: impl Into<String>) {
        if let Some(active) = &self.active {
            active.sync.set_document(text);
        }
    }

    /// Save the current document. `None` while idle or when the request
    /// could not be started.
    pub fn save(&self) -> Option<JoinHandle<()>> {
        let active = self.active.as_ref()?;
        let content = active.sync.document().unwrap_or_default();
        active.sync.save(content)
    }

    /// Run the active collection. `None` while idle or when the request
    /// could not be started.
    pub fn run(&self) -> Option<JoinHandle<()>> {
        self.active.as_ref().and_then(|a| a.sync.run())
    }

    /// Names of all collections on the backend.
    pub async fn list_collections(&self) -> Result<Vec<String>, ClientError> {
        self.client.list().await
    }
}

impl Drop for CollectionSession {
    fn drop(&mut self) {
        self.deactivate();
    }
}
