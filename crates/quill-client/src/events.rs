//! Server-wide job events.
//!
//! The server broadcasts on a fixed set of `ql:`-prefixed channels; this
//! maps each event name to an optional user callback.

use crate::error::{QuillError, QuillResult};
use crate::listener::Listener;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Channel namespace.
pub const NAMESPACE: &str = "ql:";

/// The events the server publishes.
pub const EVENTS: [&str; 8] = [
    "canceled",
    "completed",
    "failed",
    "popped",
    "put",
    "stalled",
    "track",
    "untrack",
];

/// Callback invoked with the message payload (a jid or a JSON record,
/// depending on the event).
pub type EventCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Event stream over the fixed channel set.
pub struct Events {
    listener: Arc<Listener>,
    callbacks: Arc<RwLock<HashMap<String, EventCallback>>>,
}

impl Events {
    pub fn new(redis: redis::Client) -> Self {
        let channels = EVENTS
            .iter()
            .map(|event| format!("{}{}", NAMESPACE, event))
            .collect();
        Self {
            listener: Arc::new(Listener::new(redis, channels)),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a callback for an event.
    pub fn on<F>(&self, event: &str, callback: F) -> QuillResult<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if !EVENTS.contains(&event) {
            return Err(QuillError::UnknownEvent(event.to_string()));
        }
        self.callbacks
            .write()
            .insert(event.to_string(), Arc::new(callback));
        Ok(())
    }

    /// Remove and return the callback for an event.
    pub fn off(&self, event: &str) -> Option<EventCallback> {
        self.callbacks.write().remove(event)
    }

    /// Start listening in a background task. Returns only after the
    /// subscription is live, so events published after this call are never
    /// missed.
    pub async fn start(&self) -> QuillResult<EventsHandle> {
        let listener = self.listener.clone();
        let callbacks = self.callbacks.clone();
        let join = tokio::spawn(async move {
            let result = listener
                .listen(move |message| {
                    let event = message
                        .channel
                        .strip_prefix(NAMESPACE)
                        .unwrap_or(&message.channel);
                    let callback = callbacks.read().get(event).cloned();
                    if let Some(callback) = callback {
                        callback(&message.data);
                    }
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "Events listener failed");
            }
        });

        if !self.listener.wait_until_listening().await {
            let _ = join.await;
            return Err(QuillError::Worker(
                "events listener failed to subscribe".to_string(),
            ));
        }
        Ok(EventsHandle {
            listener: self.listener.clone(),
            join,
        })
    }
}

/// Handle to a running events listener.
pub struct EventsHandle {
    listener: Arc<Listener>,
    join: JoinHandle<()>,
}

impl EventsHandle {
    /// Unsubscribe and wait for the listen task to finish.
    pub async fn stop(self) {
        self.listener.unlisten();
        let _ = self.join.await;
    }
}
