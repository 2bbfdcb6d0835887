use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use shared::protocol::ListEvent;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the channel delivers to its subscriber: either a mutation event as
/// received, or a synthetic resynchronize marker emitted on reconnect
/// because events in the gap are presumed lost.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncSignal {
    Event(ListEvent),
    Resynchronize,
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub signal_buffer: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            signal_buffer: 256,
        }
    }
}

/// The underlying connection primitive. Only the observable contract is
/// modeled: connect once, then yield text frames until an error or close.
/// Heartbeats and handshake details stay inside the implementation.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<BoxStream<'static, Result<String, TransportError>>, TransportError>;
}

/// Production transport over tokio-tungstenite. Non-text frames are ignored;
/// a close frame or socket error ends the stream and the caller reconnects.
#[derive(Default)]
pub struct WebSocketTransport;

#[async_trait]
impl EventTransport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<BoxStream<'static, Result<String, TransportError>>, TransportError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|err| TransportError::WebSocket(err.to_string()))?;
        let frames = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::WebSocket(err.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Factory for channel handles. Each `connect` call produces one explicitly
/// owned handle with its own connection loop; handles are never shared
/// between views and never reach into ambient global state.
pub struct EventChannelClient {
    transport: Arc<dyn EventTransport>,
    options: ChannelOptions,
}

impl EventChannelClient {
    pub fn new(transport: Arc<dyn EventTransport>, options: ChannelOptions) -> Self {
        Self { transport, options }
    }

    pub fn connect(&self, url: &str) -> EventChannelHandle {
        let (signals, _) = broadcast::channel(self.options.signal_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);

        let task = tokio::spawn(run_connection(
            Arc::clone(&self.transport),
            url.to_string(),
            self.options.clone(),
            signals.clone(),
            Arc::clone(&state_tx),
        ));

        EventChannelHandle {
            signals,
            state_tx,
            state_rx,
            task,
        }
    }
}

/// One logical connection to the event channel. Dropping the handle (or
/// calling [`disconnect`](Self::disconnect)) tears the connection down
/// deterministically; a disconnected handle never reconnects.
pub struct EventChannelHandle {
    signals: broadcast::Sender<SyncSignal>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl EventChannelHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncSignal> {
        self.signals.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn disconnect(&self) {
        self.task.abort();
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }
}

impl Drop for EventChannelHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_connection(
    transport: Arc<dyn EventTransport>,
    url: String,
    options: ChannelOptions,
    signals: broadcast::Sender<SyncSignal>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut backoff = options.initial_backoff;
    let mut was_connected = false;

    loop {
        let _ = state.send(ConnectionState::Connecting);
        match transport.connect(&url).await {
            Ok(mut frames) => {
                backoff = options.initial_backoff;
                let _ = state.send(ConnectionState::Connected);
                if was_connected {
                    // Reconnect, not the initial connect: anything published
                    // during the gap is presumed lost.
                    info!(%url, "event channel reconnected, requesting resynchronize");
                    let _ = signals.send(SyncSignal::Resynchronize);
                }
                was_connected = true;

                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(text) => match serde_json::from_str::<ListEvent>(&text) {
                            Ok(event) => {
                                let _ = signals.send(SyncSignal::Event(event));
                            }
                            Err(err) => {
                                warn!(%err, "dropping malformed event frame");
                            }
                        },
                        Err(err) => {
                            warn!(%err, "event channel transport error");
                            break;
                        }
                    }
                }
                debug!(%url, "event channel stream ended");
            }
            Err(err) => {
                warn!(%err, backoff_ms = backoff.as_millis() as u64, "event channel connect failed");
            }
        }

        let _ = state.send(ConnectionState::Reconnecting);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(options.max_backoff);
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
