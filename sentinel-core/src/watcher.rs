use crate::config::WatcherConfig;
use crate::error::{Result, SentinelError};
use crate::metrics::Metrics;
use crate::normalize::parse_notification_frame;
use crate::retry::Backoff;
use crate::types::RawNotification;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SUBSCRIBE_REQUEST_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Subscribed,
    Reading,
    Stopped,
}

enum SessionEnd {
    Disconnected,
    Cancelled,
    ReceiverClosed,
}

/// Running watcher: notifications, observable state and the task itself.
pub struct WatcherHandle {
    pub notifications: mpsc::Receiver<RawNotification>,
    pub state: watch::Receiver<WatcherState>,
    pub task: JoinHandle<()>,
}

/// Keeps one `logsSubscribe` subscription alive and forwards its notifications.
///
/// Notifications are delivered in arrival order through a bounded channel.
/// The watcher waits for channel capacity rather than dropping; whatever
/// the node emits while the socket is down is not recovered.
pub struct SourceWatcher {
    config: WatcherConfig,
    metrics: Arc<Metrics>,
    state: watch::Sender<WatcherState>,
}

impl SourceWatcher {
    pub fn new(config: WatcherConfig, metrics: Arc<Metrics>) -> Self {
        let (state, _) = watch::channel(WatcherState::Disconnected);
        Self {
            config,
            metrics,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    pub fn subscribe_frame(&self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": SUBSCRIBE_REQUEST_ID,
            "method": "logsSubscribe",
            "params": [
                self.config.filter.to_json(),
                { "commitment": self.config.commitment.as_str() }
            ]
        })
    }

    pub fn spawn(self, cancel: CancellationToken) -> WatcherHandle {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let state = self.state();
        let task = tokio::spawn(async move { self.run(tx, cancel).await });
        WatcherHandle {
            notifications: rx,
            state,
            task,
        }
    }

    /// Connect, subscribe and read until cancelled or the receiver goes away.
    pub async fn run(&self, tx: mpsc::Sender<RawNotification>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_floor, self.config.backoff_ceiling);
        let mut first_attempt = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !first_attempt {
                self.metrics.record_ws_reconnection();
            }
            first_attempt = false;

            self.set_state(WatcherState::Connecting);
            match self.session(&tx, &cancel, &mut backoff).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::ReceiverClosed) => {
                    info!("Notification receiver dropped, stopping watcher");
                    break;
                }
                Ok(SessionEnd::Disconnected) => info!("WebSocket closed by peer"),
                Err(e) => warn!("WebSocket session failed: {}", e),
            }

            self.set_state(WatcherState::Disconnected);
            let delay = backoff.next_delay();
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(WatcherState::Stopped);
        info!("Watcher stopped");
    }

    async fn session(
        &self,
        tx: &mpsc::Sender<RawNotification>,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd> {
        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            connect_async(self.config.ws_url.as_str()),
        );
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = handshake => connected.map_err(|_| {
                SentinelError::Transport(format!(
                    "handshake with {} timed out after {:?}",
                    self.config.ws_url, self.config.handshake_timeout
                ))
            })??,
        };
        backoff.reset();
        info!("Connected to {}", self.config.ws_url);

        let (mut sink, mut stream) = ws.split();
        sink.send(Message::Text(self.subscribe_frame().to_string()))
            .await?;
        self.set_state(WatcherState::Subscribed);

        let ping_every = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        let deadline = tokio::time::sleep(self.config.read_timeout);
        tokio::pin!(deadline);

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                }
                _ = &mut deadline => {
                    return Err(SentinelError::Transport(format!(
                        "no frames for {:?}",
                        self.config.read_timeout
                    )));
                }
                _ = ping.tick() => {
                    tokio::time::timeout(self.config.read_timeout, sink.send(Message::Ping(Vec::new())))
                        .await
                        .map_err(|_| {
                            SentinelError::Transport(format!(
                                "ping not written within {:?}",
                                self.config.read_timeout
                            ))
                        })??;
                    continue;
                }
                message = stream.next() => message,
            };

            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionEnd::Disconnected),
            };
            deadline
                .as_mut()
                .reset(Instant::now() + self.config.read_timeout);

            let text = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(frame) => {
                    debug!("Close frame received: {:?}", frame);
                    return Ok(SessionEnd::Disconnected);
                }
                _ => continue,
            };

            let notification = match parse_notification_frame(&text) {
                Some(notification) => notification,
                None => {
                    check_subscribe_reply(&text)?;
                    continue;
                }
            };

            if *self.state.borrow() != WatcherState::Reading {
                self.set_state(WatcherState::Reading);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                sent = tx.send(notification) => {
                    if sent.is_err() {
                        return Ok(SessionEnd::ReceiverClosed);
                    }
                }
            }
            // Time spent waiting on the consumer is not silence from the server.
            deadline
                .as_mut()
                .reset(Instant::now() + self.config.read_timeout);
        }
    }

    fn set_state(&self, state: WatcherState) {
        self.state.send_replace(state);
    }
}

/// A rejected subscribe request ends the session; anything else is ignored.
fn check_subscribe_reply(text: &str) -> Result<()> {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        debug!("Ignoring non-JSON frame");
        return Ok(());
    };

    if frame.get("id").and_then(Value::as_u64) != Some(SUBSCRIBE_REQUEST_ID) {
        return Ok(());
    }
    match frame.get("error") {
        Some(error) => Err(SentinelError::RemoteRejection {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        None => {
            debug!("Subscription acknowledged: {}", frame["result"]);
            Ok(())
        }
    }
}
