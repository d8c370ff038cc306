use crate::domain::ports::LtpStream;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reference-counted symbol subscriptions.
///
/// Holders are identified by `service_id`. The first holder of a symbol
/// opens the underlying broker subscription; the last one leaving closes
/// it. Mutations are serialized by a single lock.
pub struct SubscriptionManager {
    stream: Arc<dyn LtpStream>,
    holders: Mutex<HashMap<String, HashSet<String>>>,
}

impl SubscriptionManager {
    pub fn new(stream: Arc<dyn LtpStream>) -> Self {
        Self {
            stream,
            holders: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent per holder: re-subscribing with the same service id is a
    /// no-op.
    pub async fn subscribe(&self, symbols: &[String], service_id: &str) -> Result<()> {
        let mut newly_active = Vec::new();
        {
            let mut holders = self.holders.lock().await;
            for symbol in symbols {
                let set = holders.entry(symbol.clone()).or_default();
                if set.is_empty() {
                    newly_active.push(symbol.clone());
                }
                set.insert(service_id.to_string());
            }
        }

        if !newly_active.is_empty() {
            info!(
                "SubscriptionManager: Opening broker subscription for {} symbols ({})",
                newly_active.len(),
                service_id
            );
            self.stream.subscribe(&newly_active).await?;
        }
        Ok(())
    }

    /// Drops the underlying subscription only when the holder set empties.
    pub async fn unsubscribe(&self, symbols: &[String], service_id: &str) -> Result<()> {
        let mut now_empty = Vec::new();
        {
            let mut holders = self.holders.lock().await;
            for symbol in symbols {
                if let Some(set) = holders.get_mut(symbol) {
                    set.remove(service_id);
                    if set.is_empty() {
                        holders.remove(symbol);
                        now_empty.push(symbol.clone());
                    }
                } else {
                    debug!("SubscriptionManager: {} was not subscribed", symbol);
                }
            }
        }

        if !now_empty.is_empty() {
            if let Err(e) = self.stream.unsubscribe(&now_empty).await {
                warn!("SubscriptionManager: Failed to drop broker subscription: {}", e);
            }
        }
        Ok(())
    }

    pub async fn is_subscribed(&self, symbol: &str) -> bool {
        let holders = self.holders.lock().await;
        holders.get(symbol).is_some_and(|s| !s.is_empty())
    }

    pub async fn active_symbols(&self) -> Vec<String> {
        let holders = self.holders.lock().await;
        holders.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingStream {
        subscribed: StdMutex<Vec<String>>,
        unsubscribed: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl LtpStream for RecordingStream {
        async fn subscribe(&self, symbols: &[String]) -> Result<()> {
            self.subscribed.lock().unwrap().extend_from_slice(symbols);
            Ok(())
        }

        async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
            self.unsubscribed.lock().unwrap().extend_from_slice(symbols);
            Ok(())
        }
    }

    fn symbols(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_holder_opens_subscription() {
        let stream = Arc::new(RecordingStream::default());
        let manager = SubscriptionManager::new(stream.clone());

        manager.subscribe(&symbols(&["ACME"]), "monitor").await.unwrap();
        assert_eq!(stream.subscribed.lock().unwrap().len(), 1);

        // Second holder does not re-open
        manager.subscribe(&symbols(&["ACME"]), "validator").await.unwrap();
        assert_eq!(stream.subscribed.lock().unwrap().len(), 1);
        assert!(manager.is_subscribed("ACME").await);
    }

    #[tokio::test]
    async fn test_subscription_survives_until_last_holder_leaves() {
        let stream = Arc::new(RecordingStream::default());
        let manager = SubscriptionManager::new(stream.clone());

        manager.subscribe(&symbols(&["ACME"]), "monitor").await.unwrap();
        manager.subscribe(&symbols(&["ACME"]), "validator").await.unwrap();

        manager.unsubscribe(&symbols(&["ACME"]), "monitor").await.unwrap();
        assert!(manager.is_subscribed("ACME").await);
        assert!(stream.unsubscribed.lock().unwrap().is_empty());

        manager.unsubscribe(&symbols(&["ACME"]), "validator").await.unwrap();
        assert!(!manager.is_subscribed("ACME").await);
        assert_eq!(*stream.unsubscribed.lock().unwrap(), symbols(&["ACME"]));
    }

    #[tokio::test]
    async fn test_duplicate_holder_is_idempotent() {
        let stream = Arc::new(RecordingStream::default());
        let manager = SubscriptionManager::new(stream.clone());

        manager.subscribe(&symbols(&["ACME"]), "monitor").await.unwrap();
        manager.subscribe(&symbols(&["ACME"]), "monitor").await.unwrap();

        manager.unsubscribe(&symbols(&["ACME"]), "monitor").await.unwrap();
        assert!(!manager.is_subscribed("ACME").await);
    }
}
