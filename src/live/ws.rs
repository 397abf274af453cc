use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LiveEvent;
use crate::config::LiveConfig;

/// Callback receiving connection state changes (`true` = connected).
pub type ConnectionCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Callback receiving frames that could not be decoded into a [`LiveEvent`].
pub type RejectCallback = Box<dyn Fn(&str) + Send + Sync>;

/// WebSocket client for the backend's push channel.
///
/// Reconnects after `reconnect_delay` whenever the connection drops, and
/// forwards every decoded event to the supplied channel.
pub struct LiveSubscriber {
    url: String,
    reconnect_delay: Duration,
    on_connection: Option<ConnectionCallback>,
    on_reject: Option<RejectCallback>,
}

impl LiveSubscriber {
    pub fn new(cfg: &LiveConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            reconnect_delay: cfg.reconnect_delay,
            on_connection: None,
            on_reject: None,
        }
    }

    pub fn with_connection_callback(mut self, cb: ConnectionCallback) -> Self {
        self.on_connection = Some(cb);
        self
    }

    pub fn with_reject_callback(mut self, cb: RejectCallback) -> Self {
        self.on_reject = Some(cb);
        self
    }

    fn set_connected(&self, connected: bool) {
        if let Some(cb) = &self.on_connection {
            cb(connected);
        }
    }

    fn reject(&self, reason: &str) {
        if let Some(cb) = &self.on_reject {
            cb(reason);
        }
    }

    /// Spawns the receive loop. It ends when `cancel` fires or the receiver
    /// side of `tx` is dropped.
    pub fn spawn(self, tx: mpsc::Sender<LiveEvent>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let connect = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
                };

                match connect {
                    Ok((mut socket, _)) => {
                        info!(url = %self.url, "connected to live feed");
                        self.set_connected(true);

                        loop {
                            let frame = tokio::select! {
                                _ = cancel.cancelled() => {
                                    self.set_connected(false);
                                    return;
                                }
                                frame = socket.next() => frame,
                            };

                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    match LiveEvent::from_message(&text, Utc::now()) {
                                        Ok(event) => {
                                            if tx.send(event).await.is_err() {
                                                debug!("live event receiver dropped");
                                                self.set_connected(false);
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            debug!(error = %e, "ignoring live frame");
                                            self.reject("decode");
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "live feed read failed");
                                    break;
                                }
                            }
                        }

                        self.set_connected(false);
                        warn!(url = %self.url, "live feed disconnected");
                    }
                    Err(e) => {
                        warn!(url = %self.url, error = %e, "live feed connection failed");
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                }
            }
        })
    }
}
