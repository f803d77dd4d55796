//! Pub/sub listener.
//!
//! Subscribes to a set of channels and delivers messages to a handler until
//! `unlisten` is called. The subscription is complete before the listening
//! future resolves, which is how other tasks avoid the race of unlistening
//! before the listener ever subscribed.

use crate::error::{QuillError, QuillResult};
use crate::future::Future;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// One pub/sub message.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub data: String,
}

struct ListenerState {
    is_listening: bool,
    listening: Arc<Future<bool>>,
}

/// A restartable subscription over a fixed channel set.
pub struct Listener {
    redis: redis::Client,
    channels: Vec<String>,
    shutdown: watch::Sender<u64>,
    state: Mutex<ListenerState>,
}

impl Listener {
    pub fn new(redis: redis::Client, channels: Vec<String>) -> Self {
        let (shutdown, _) = watch::channel(0);
        Self {
            redis,
            channels,
            shutdown,
            state: Mutex::new(ListenerState {
                is_listening: false,
                listening: Arc::new(Future::new()),
            }),
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Whether a listen cycle currently holds the subscription.
    pub fn is_listening(&self) -> bool {
        self.state.lock().is_listening
    }

    /// Resolves true once the current listen cycle has subscribed, false if
    /// it failed before subscribing.
    pub async fn wait_until_listening(&self) -> bool {
        let listening = self.state.lock().listening.clone();
        listening.result().await
    }

    /// Subscribe and deliver messages until `unlisten`. Only one cycle may
    /// run at a time; the listener can be restarted after it returns.
    pub async fn listen<F>(&self, mut handler: F) -> QuillResult<()>
    where
        F: FnMut(Message) + Send,
    {
        let listening = {
            let mut state = self.state.lock();
            if state.is_listening {
                return Err(QuillError::Worker(
                    "listener is already listening".to_string(),
                ));
            }
            state.is_listening = true;
            state.listening.clone()
        };

        let result = self.run(&mut handler, &listening).await;

        {
            let mut state = self.state.lock();
            state.is_listening = false;
            state.listening = Arc::new(Future::new());
        }
        // Unblock waiters if we failed before the subscription went live.
        listening.set_result(false);

        result
    }

    async fn run<F>(&self, handler: &mut F, listening: &Future<bool>) -> QuillResult<()>
    where
        F: FnMut(Message) + Send,
    {
        let mut shutdown = self.shutdown.subscribe();
        // Shutdown requests predating this cycle do not apply to it.
        shutdown.borrow_and_update();

        let mut pubsub = self.redis.get_async_pubsub().await?;
        for channel in &self.channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(channels = ?self.channels, "Subscribed");
        listening.set_result(true);

        {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = messages.next() => match message {
                        Some(message) => {
                            let data: String = message.get_payload().unwrap_or_default();
                            handler(Message {
                                channel: message.get_channel_name().to_string(),
                                data,
                            });
                        }
                        None => break,
                    }
                }
            }
        }

        for channel in &self.channels {
            let _ = pubsub.unsubscribe(channel).await;
        }
        debug!(channels = ?self.channels, "Unsubscribed");
        Ok(())
    }

    /// Ask the current listen cycle to stop. Idempotent; a no-op when no
    /// cycle is running.
    pub fn unlisten(&self) {
        self.shutdown.send_modify(|generation| *generation += 1);
    }
}
