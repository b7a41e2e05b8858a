use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::BasicAckOptions;
use tokio::sync::Mutex;

use fieldhub_shared::clients::rabbitmq::RabbitMQClient;
use fieldhub_shared::types::RawChangeEvent;

use super::change_feed::{ChangeFeed, ChangeFilter, EventCallback, SubscriptionHandle};

/// Exponential reconnect delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Change feed consumed from the AMQP change exchange.
///
/// The broker connection is opened lazily by the first subscription and
/// re-opened by whichever subscription notices it is gone.
#[derive(Clone)]
pub struct RabbitChangeFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    url: String,
    backoff: Backoff,
    client: Mutex<Option<RabbitMQClient>>,
    consumers: AtomicUsize,
}

impl RabbitChangeFeed {
    pub fn new(url: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                url: url.into(),
                backoff,
                client: Mutex::new(None),
                consumers: AtomicUsize::new(0),
            }),
        }
    }
}

impl FeedInner {
    async fn client(&self) -> Result<RabbitMQClient, lapin::Error> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref().filter(|c| c.is_connected()) {
            return Ok(client.clone());
        }

        let client = RabbitMQClient::connect(&self.url).await?;
        *slot = Some(client.clone());
        Ok(client)
    }
}

/// Counts one running consumer for as long as it lives, including when
/// the subscription task is aborted mid-stream.
struct ConsumerGuard<'a> {
    consumers: &'a AtomicUsize,
}

impl<'a> ConsumerGuard<'a> {
    fn new(consumers: &'a AtomicUsize) -> Self {
        consumers.fetch_add(1, Ordering::SeqCst);
        Self { consumers }
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeFeed for RabbitChangeFeed {
    async fn subscribe(
        &self,
        channel: &str,
        filter: ChangeFilter,
        on_event: EventCallback,
    ) -> SubscriptionHandle {
        let task = tokio::spawn(run_subscription(
            self.inner.clone(),
            channel.to_string(),
            filter,
            on_event,
        ));
        SubscriptionHandle::new(channel, task)
    }

    async fn unsubscribe(&self, mut handle: SubscriptionHandle) {
        if let Some(task) = handle.take_task() {
            task.abort();
        }

        let client = self.inner.client.lock().await.clone();
        if let Some(client) = client.filter(|c| c.is_connected()) {
            if let Err(e) = client.cancel(handle.channel()).await {
                tracing::debug!(error = %e, queue = %handle.channel(), "change feed cancel failed, ignoring");
            }
        }
    }

    /// True while at least one subscription is consuming.
    fn is_connected(&self) -> bool {
        self.inner.consumers.load(Ordering::SeqCst) > 0
    }
}

/// Consume `queue` until aborted, reconnecting with backoff on any failure.
async fn run_subscription(
    inner: Arc<FeedInner>,
    queue: String,
    filter: ChangeFilter,
    on_event: EventCallback,
) {
    let routing_keys = [filter.routing_key()];
    let mut delay = inner.backoff.initial;

    loop {
        let consumer = match inner.client().await {
            Ok(client) => client.subscribe(&queue, &routing_keys).await,
            Err(e) => Err(e),
        };

        match consumer {
            Ok(mut consumer) => {
                let _consuming = ConsumerGuard::new(&inner.consumers);
                delay = inner.backoff.initial;

                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            dispatch(&filter, &on_event, &queue, &delivery.data);
                            let _ = delivery.ack(BasicAckOptions::default()).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, queue = %queue, "change feed consumer error");
                            break;
                        }
                    }
                }

                tracing::warn!(queue = %queue, "change feed consumer ended");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    queue = %queue,
                    retry_in_ms = delay.as_millis() as u64,
                    "change feed subscribe failed"
                );
            }
        }

        metrics::counter!("fieldhub_change_feed_reconnects_total").increment(1);
        tokio::time::sleep(delay).await;
        delay = inner.backoff.next(delay);
    }
}

/// Decode one delivery and hand it to the callback if it passes the filter.
fn dispatch(filter: &ChangeFilter, on_event: &EventCallback, queue: &str, payload: &[u8]) {
    match serde_json::from_slice::<RawChangeEvent>(payload) {
        Ok(event) if filter.matches(&event) => on_event(event),
        Ok(event) => {
            tracing::trace!(queue = %queue, table = %event.table, "change event filtered out");
        }
        Err(e) => {
            tracing::warn!(error = %e, queue = %queue, "failed to decode change event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RowPredicate;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[test]
    fn backoff_doubles_up_to_max() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let mut delay = backoff.initial;
        let mut seen = Vec::new();
        for _ in 0..5 {
            delay = backoff.next(delay);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen, vec![1000, 2000, 3000, 3000, 3000]);
    }

    #[test]
    fn dispatch_applies_filter_and_skips_garbage() {
        let viewer = Uuid::new_v4();
        let filter = ChangeFilter::inserts_into("messages")
            .with_predicate(RowPredicate::not_eq("sender_id", viewer));

        let seen: Arc<StdMutex<Vec<RawChangeEvent>>> = Arc::default();
        let on_event: EventCallback = {
            let seen = seen.clone();
            Arc::new(move |event| seen.lock().unwrap().push(event))
        };

        let other = serde_json::json!({
            "table": "messages", "type": "INSERT",
            "new": { "id": Uuid::new_v4().to_string(), "sender_id": Uuid::new_v4().to_string() }
        });
        let own = serde_json::json!({
            "table": "messages", "type": "INSERT",
            "new": { "id": Uuid::new_v4().to_string(), "sender_id": viewer.to_string() }
        });

        dispatch(&filter, &on_event, "q", other.to_string().as_bytes());
        dispatch(&filter, &on_event, "q", own.to_string().as_bytes());
        dispatch(&filter, &on_event, "q", b"{not json");

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn feed_starts_disconnected() {
        let feed = RabbitChangeFeed::new("amqp://localhost:5672/%2f", Backoff::default());
        assert!(!feed.is_connected());
    }

    #[test]
    fn one_lost_consumer_leaves_the_feed_connected() {
        let feed = RabbitChangeFeed::new("amqp://localhost:5672/%2f", Backoff::default());
        let first = ConsumerGuard::new(&feed.inner.consumers);
        let second = ConsumerGuard::new(&feed.inner.consumers);
        assert!(feed.is_connected());

        drop(first);
        assert!(feed.is_connected());

        drop(second);
        assert!(!feed.is_connected());
    }

    #[tokio::test]
    async fn aborted_consumer_is_no_longer_counted() {
        let feed = RabbitChangeFeed::new("amqp://localhost:5672/%2f", Backoff::default());
        let inner = feed.inner.clone();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let _consuming = ConsumerGuard::new(&inner.consumers);
            let _ = started_tx.send(());
            std::future::pending::<()>().await;
        });

        started_rx.await.unwrap();
        assert!(feed.is_connected());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!feed.is_connected());
    }
}
