use crate::domain::ports::{EventKind, NotificationEvent, NotificationTransport};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    DroppedRateLimit,
    TransportError,
}

struct SlidingWindows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

/// Rate-limited outbound alerts. Over-limit calls are dropped and counted;
/// transport failures are swallowed. Trading code never blocks on, or
/// fails because of, notification delivery.
pub struct RateLimitedNotifier {
    transport: Arc<dyn NotificationTransport>,
    per_minute: usize,
    per_hour: usize,
    windows: Mutex<SlidingWindows>,
    dropped: AtomicU64,
}

impl RateLimitedNotifier {
    pub fn new(transport: Arc<dyn NotificationTransport>, per_minute: u32, per_hour: u32) -> Self {
        Self {
            transport,
            per_minute: per_minute as usize,
            per_hour: per_hour as usize,
            windows: Mutex::new(SlidingWindows {
                minute: VecDeque::new(),
                hour: VecDeque::new(),
            }),
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn notify(&self, kind: EventKind, user_id: i64, message: String) -> NotifyOutcome {
        if !self.try_admit() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Notifier: Dropped {} for user {} (rate limit)",
                kind.as_str(),
                user_id
            );
            return NotifyOutcome::DroppedRateLimit;
        }

        let event = NotificationEvent {
            kind,
            user_id,
            message,
            occurred_at: Utc::now(),
        };

        match self.transport.deliver(&event).await {
            Ok(()) => NotifyOutcome::Sent,
            Err(e) => {
                warn!("Notifier: Transport error for {}: {}", kind.as_str(), e);
                NotifyOutcome::TransportError
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn try_admit(&self) -> bool {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        prune(&mut windows.minute, now, Duration::from_secs(60));
        prune(&mut windows.hour, now, Duration::from_secs(3600));

        if windows.minute.len() >= self.per_minute || windows.hour.len() >= self.per_hour {
            return false;
        }

        windows.minute.push_back(now);
        windows.hour.push_back(now);
        true
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) > span {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Transport that logs events; the default when no external channel is
/// configured.
pub struct LogTransport;

#[async_trait::async_trait]
impl NotificationTransport for LogTransport {
    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        tracing::info!(
            "NOTIFY [{}] user={}: {}",
            event.kind.as_str(),
            event.user_id,
            event.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTransport {
        delivered: StdMutex<Vec<NotificationEvent>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl NotificationTransport for RecordingTransport {
        async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
            if self.fail {
                anyhow::bail!("transport down");
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_within_limit_sends() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = RateLimitedNotifier::new(transport.clone(), 10, 100);

        let outcome = notifier
            .notify(EventKind::OrderPlaced, 1, "placed ACME x10".to_string())
            .await;

        assert_eq!(outcome, NotifyOutcome::Sent);
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_minute_limit_drops_excess() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = RateLimitedNotifier::new(transport.clone(), 3, 100);

        for _ in 0..3 {
            assert_eq!(
                notifier
                    .notify(EventKind::OrderPlaced, 1, "msg".to_string())
                    .await,
                NotifyOutcome::Sent
            );
        }
        assert_eq!(
            notifier
                .notify(EventKind::OrderPlaced, 1, "msg".to_string())
                .await,
            NotifyOutcome::DroppedRateLimit
        );
        assert_eq!(notifier.dropped_count(), 1);
        assert_eq!(transport.delivered.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transport_error_does_not_propagate() {
        let transport = Arc::new(RecordingTransport {
            delivered: StdMutex::new(Vec::new()),
            fail: true,
        });
        let notifier = RateLimitedNotifier::new(transport, 10, 100);

        let outcome = notifier
            .notify(EventKind::OrderRejected, 1, "msg".to_string())
            .await;
        assert_eq!(outcome, NotifyOutcome::TransportError);
    }
}
