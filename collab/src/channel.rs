//! Push channel for a single collection.
//!
//! [`ChannelManager::open`] starts one WebSocket connection to
//! `ws(s)://<backend>/ws?room=<key>` and reports everything that happens on it
//! as plain text entries through a [`LogSink`]: a fixed entry for each
//! lifecycle event and the raw text of each server message, in arrival order.
//!
//! The channel is advisory. A failed or closed channel is never reconnected;
//! failures only ever show up as log entries. Each [`ChannelHandle`] is bound
//! to exactly one key for its whole life.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BackendAddress;

pub const LOG_CONNECTED: &str = "[ws] connected";
pub const LOG_DISCONNECTED: &str = "[ws] disconnected";
pub const LOG_ERROR: &str = "[ws] error";
pub const LOG_CONNECTION_FAILED: &str = "[ws] connection failed";

/// How long a caller-initiated close waits for the close frame to go out.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives one call per log entry, in order.
pub type LogSink = Arc<dyn Fn(String) + Send + Sync>;

/// Lifecycle of one push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Failed,
}

struct Shared {
    state: ChannelState,
    /// Set by [`ChannelHandle::close`]; nothing reaches the sink afterwards.
    detached: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forwards entries to the sink until the handle is closed.
struct Emitter {
    shared: Arc<Mutex<Shared>>,
    sink: LogSink,
}

impl Emitter {
    fn emit(&self, entry: impl Into<String>, next: Option<ChannelState>) {
        let mut shared = lock(&self.shared);
        if shared.detached {
            return;
        }
        if let Some(state) = next {
            shared.state = state;
        }
        // Held across the call so close() cannot interleave with delivery.
        (self.sink)(entry.into());
    }
}

/// Opens push channels against one backend.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    address: BackendAddress,
}

impl ChannelManager {
    pub fn new(address: BackendAddress) -> Self {
        Self { address }
    }

    /// Start connecting the push channel for `key`.
    ///
    /// Returns `None` after logging [`LOG_CONNECTION_FAILED`] when the channel
    /// cannot even be constructed (bad address, no async runtime). Otherwise
    /// the connection proceeds in the background and reports through `sink`.
    pub fn open(&self, key: &str, sink: LogSink) -> Option<ChannelHandle> {
        let url = match self.address.channel_url(key) {
            Ok(url) => url,
            Err(e) => {
                warn!(key, "push channel construction failed: {e}");
                sink(LOG_CONNECTION_FAILED.to_string());
                return None;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key, "push channel construction failed: no async runtime");
            sink(LOG_CONNECTION_FAILED.to_string());
            return None;
        };

        let shared = Arc::new(Mutex::new(Shared {
            state: ChannelState::Connecting,
            detached: false,
        }));
        let cancel = CancellationToken::new();
        let emitter = Emitter {
            shared: Arc::clone(&shared),
            sink,
        };

        debug!(key, %url, "opening push channel");
        runtime.spawn(channel_io_loop(url.to_string(), emitter, cancel.clone()));

        Some(ChannelHandle {
            key: key.to_string(),
            shared,
            cancel,
        })
    }
}

/// Owner's handle on one push channel. Dropping it closes the channel.
pub struct ChannelHandle {
    key: String,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    /// The collection key this channel was opened for.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.shared).state
    }

    /// Close the channel. Idempotent; once this returns no further entries
    /// from this channel reach the sink.
    pub fn close(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.detached {
                return;
            }
            shared.detached = true;
            if matches!(shared.state, ChannelState::Connecting | ChannelState::Open) {
                shared.state = ChannelState::Closed;
            }
        }
        self.cancel.cancel();
        debug!(key = %self.key, "push channel closed by owner");
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Close and discard whatever handle is stored in `slot`. A `None` slot is a
/// no-op.
pub fn close_handle(slot: &mut Option<ChannelHandle>) {
    if let Some(handle) = slot.take() {
        handle.close();
    }
}

/// Connect, then forward frames to the emitter until either side closes.
async fn channel_io_loop(url: String, emitter: Emitter, cancel: CancellationToken) {
    let connected = tokio::select! {
        () = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };
    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!(%url, "push channel connect failed: {e}");
            emitter.emit(LOG_ERROR, None);
            emitter.emit(LOG_DISCONNECTED, Some(ChannelState::Failed));
            return;
        }
    };

    emitter.emit(LOG_CONNECTED, Some(ChannelState::Open));
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = tokio::time::timeout(
                    CLOSE_FRAME_TIMEOUT,
                    ws_sink.send(Message::Close(None)),
                )
                .await;
                return;
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => emitter.emit(text, None),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(%url, ?frame, "push channel closed by server");
                        emitter.emit(LOG_DISCONNECTED, Some(ChannelState::Closed));
                        return;
                    }
                    None => {
                        emitter.emit(LOG_DISCONNECTED, Some(ChannelState::Closed));
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(%url, "push channel error: {e}");
                        emitter.emit(LOG_ERROR, None);
                        emitter.emit(LOG_DISCONNECTED, Some(ChannelState::Closed));
                        return;
                    }
                    Some(Ok(_)) => {} // Binary/Ping/Pong — ignore
                }
            }
        }
    }
}
