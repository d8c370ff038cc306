use crate::application::market_data::LtpCache;
use crate::domain::ports::LtpStream;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_SECS: u64 = 60;

/// WebSocket LTP feed. Writes observations straight into the shared
/// `LtpCache`; it never calls back into higher layers, so reconciliation
/// can run concurrently without re-entrancy.
pub struct LtpWebSocket {
    ws_url: String,
    cache: Arc<LtpCache>,
    desired: Arc<RwLock<HashSet<String>>>,
    outbound: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LtpWebSocket {
    pub fn new(ws_url: String, cache: Arc<LtpCache>) -> Self {
        Self {
            ws_url,
            cache,
            desired: Arc::new(RwLock::new(HashSet::new())),
            outbound: Arc::new(RwLock::new(None)),
            task_handle: Mutex::new(None),
        }
    }

    /// Start the connection loop. Idempotent; the previous task is aborted.
    pub async fn start(&self) {
        let mut handle_guard = self.task_handle.lock().await;
        if let Some(handle) = handle_guard.take() {
            debug!("LtpWebSocket: Aborting previous stream task");
            handle.abort();
        }

        let ws_url = self.ws_url.clone();
        let cache = self.cache.clone();
        let desired = self.desired.clone();
        let outbound = self.outbound.clone();

        let handle = tokio::spawn(async move {
            Self::run(ws_url, cache, desired, outbound).await;
        });
        *handle_guard = Some(handle);
    }

    pub async fn stop(&self) {
        let mut handle_guard = self.task_handle.lock().await;
        if let Some(handle) = handle_guard.take() {
            handle.abort();
            info!("LtpWebSocket: Stream task stopped");
        }
    }

    async fn run(
        ws_url: String,
        cache: Arc<LtpCache>,
        desired: Arc<RwLock<HashSet<String>>>,
        outbound: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    ) {
        let mut backoff = 1u64;

        loop {
            match Self::connect_and_stream(&ws_url, &cache, &desired, &outbound).await {
                Ok(_) => {
                    info!("LtpWebSocket: Connection closed gracefully");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    backoff = 1;
                }
                Err(e) => {
                    // Jittered exponential backoff to avoid thundering-herd
                    // reconnects across users
                    let jitter_ms: u64 = rand::rng().random_range(0..500);
                    error!(
                        "LtpWebSocket: Stream error: {}. Reconnecting in {}s...",
                        e, backoff
                    );
                    tokio::time::sleep(
                        std::time::Duration::from_secs(backoff)
                            + std::time::Duration::from_millis(jitter_ms),
                    )
                    .await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    async fn connect_and_stream(
        ws_url: &str,
        cache: &Arc<LtpCache>,
        desired: &Arc<RwLock<HashSet<String>>>,
        outbound: &Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    ) -> Result<()> {
        info!("LtpWebSocket: Connecting to {}", ws_url);
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .context("Failed to connect to LTP WebSocket")?;
        info!("LtpWebSocket: Connected");

        let (mut write, mut read) = ws_stream.split();

        // Writer task fed by a channel so subscribe commands and pings
        // share one sink
        let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(100);
        *outbound.write().await = Some(ws_tx.clone());

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Re-subscribe the desired set after every (re)connect
        let current: Vec<String> = desired.read().await.iter().cloned().collect();
        if !current.is_empty() {
            let msg = subscribe_message("subscribe", &current);
            ws_tx
                .send(Message::Text(msg.into()))
                .await
                .context("Failed to send initial subscribe")?;
            info!("LtpWebSocket: Re-subscribed {} symbols", current.len());
        }

        let tx_ping = ws_tx.clone();
        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ping_interval.tick().await;
                if tx_ping.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Err(e) = Self::handle_message(&text, cache) {
                        warn!("LtpWebSocket: Failed to handle message: {}", e);
                    }
                }
                Ok(Message::Ping(_)) => {
                    let _ = ws_tx.send(Message::Pong(vec![].into())).await;
                }
                Ok(Message::Close(frame)) => {
                    info!("LtpWebSocket: Closed by server: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("LtpWebSocket: Read error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        *outbound.write().await = None;
        Ok(())
    }

    fn handle_message(text: &str, cache: &Arc<LtpCache>) -> Result<()> {
        #[derive(Debug, Deserialize)]
        struct Tick {
            symbol: String,
            ltp: f64,
            #[serde(default)]
            timestamp: Option<i64>,
        }

        let tick: Tick = serde_json::from_str(text)?;
        let price = Decimal::from_f64_retain(tick.ltp).unwrap_or_default();
        let at = tick
            .timestamp
            .and_then(|t| DateTime::from_timestamp(t, 0))
            .unwrap_or_else(Utc::now);

        cache.update(tick.symbol, price, at);
        Ok(())
    }
}

fn subscribe_message(action: &str, symbols: &[String]) -> String {
    serde_json::json!({
        "action": action,
        "symbols": symbols,
    })
    .to_string()
}

#[async_trait]
impl LtpStream for LtpWebSocket {
    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        {
            let mut desired = self.desired.write().await;
            for s in symbols {
                desired.insert(s.clone());
            }
        }
        if let Some(tx) = self.outbound.read().await.as_ref() {
            let msg = subscribe_message("subscribe", symbols);
            tx.send(Message::Text(msg.into()))
                .await
                .context("Failed to send subscribe")?;
        } else {
            debug!("LtpWebSocket: Not connected, subscribe deferred to reconnect");
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        {
            let mut desired = self.desired.write().await;
            for s in symbols {
                desired.remove(s);
            }
        }
        if let Some(tx) = self.outbound.read().await.as_ref() {
            let msg = subscribe_message("unsubscribe", symbols);
            tx.send(Message::Text(msg.into()))
                .await
                .context("Failed to send unsubscribe")?;
        }
        Ok(())
    }
}
