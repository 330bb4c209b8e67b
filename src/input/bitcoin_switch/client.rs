//! WebSocket client for the Bitcoin Switch endpoint.

use super::message::{SwitchError, SwitchHandler};
use crate::error::{Result, WashError};
use crate::input::backoff::ReconnectBackoff;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Long-lived WebSocket connection to BTCPay's Bitcoin Switch plugin.
///
/// Reconnects forever with exponential backoff; the delay resets once a
/// connection is established.
pub struct BitcoinSwitchClient {
    url: String,
    handler: SwitchHandler,
    backoff: ReconnectBackoff,
}

impl BitcoinSwitchClient {
    pub fn new(url: impl Into<String>, handler: SwitchHandler) -> Result<Self> {
        let url = url.into();
        validate_url(&url)?;
        Ok(Self {
            url,
            handler,
            backoff: ReconnectBackoff::default().with_jitter(),
        })
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawn the connect/read/reconnect loop.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!("[Switch] Connecting to {}", self.url);
        let mut attempt = 0;
        loop {
            match self.session().await {
                Ok(()) => {
                    warn!("[Switch] WebSocket connection closed");
                    attempt = 0;
                }
                Err(SessionError::Connect(e)) => {
                    error!("[Switch] Failed to connect to WebSocket: {}", e);
                }
                Err(SessionError::Stream(e)) => {
                    error!("[Switch] WebSocket error: {}", e);
                    attempt = 0;
                }
            }

            let delay = self.backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            info!("[Switch] Reconnecting in {:.1} seconds...", delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection, until the server closes it or the stream fails.
    async fn session(&self) -> std::result::Result<(), SessionError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(SessionError::Connect)?;
        info!("[Switch] WebSocket connection established");

        let (_write, mut read) = ws_stream.split();
        while let Some(msg) = read.next().await {
            match msg.map_err(SessionError::Stream)? {
                Message::Text(text) => {
                    let text_str: &str = &text;
                    self.dispatch(text_str);
                }
                Message::Close(frame) => {
                    debug!("[Switch] Close frame: {:?}", frame);
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn dispatch(&self, text: &str) {
        info!("[Switch] Received message: {}", text);
        match self.handler.handle_message(text) {
            Ok(duration) => info!("[Switch] Washing machine started for {}s", duration),
            Err(e @ SwitchError::OtherPin { .. }) => warn!("[Switch] {}", e),
            Err(SwitchError::Message(e)) => warn!("[Switch] {}", e),
            Err(SwitchError::Refused(e)) => warn!("[Switch] Failed to start washing machine: {}", e),
        }
    }
}

enum SessionError {
    Connect(tokio_tungstenite::tungstenite::Error),
    Stream(tokio_tungstenite::tungstenite::Error),
}

fn validate_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| WashError::InvalidWebSocketUrl(url.to_string()))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(WashError::InvalidWebSocketUrl(url.to_string()));
    }
    Ok(())
}
