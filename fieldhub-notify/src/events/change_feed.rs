// Event Source Adapter contract.
//
// A subscription is identified by a channel name that is never reused, is
// filtered by table + operation + row predicates, and delivers raw rows to a
// callback. Implementations swallow transport failures: a broken feed looks
// exactly like a quiet one to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use uuid::Uuid;

use fieldhub_shared::types::{change_routing_key, ChangeOperation, RawChangeEvent};

/// Invoked once per delivered row change, on the feed's task.
pub type EventCallback = Arc<dyn Fn(RawChangeEvent) + Send + Sync>;

/// Column condition applied to the new row before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowPredicate {
    Eq { column: String, value: String },
    NotEq { column: String, value: String },
}

impl RowPredicate {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn not_eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self::NotEq {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// A missing column fails `Eq` and passes `NotEq`.
    pub fn matches(&self, event: &RawChangeEvent) -> bool {
        match self {
            Self::Eq { column, value } => event.text_column(column).as_deref() == Some(value.as_str()),
            Self::NotEq { column, value } => event.text_column(column).as_deref() != Some(value.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: String,
    pub operation: ChangeOperation,
    pub predicates: Vec<RowPredicate>,
}

impl ChangeFilter {
    pub fn inserts_into(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            operation: ChangeOperation::Insert,
            predicates: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: RowPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn routing_key(&self) -> String {
        change_routing_key(&self.table, self.operation)
    }

    pub fn matches(&self, event: &RawChangeEvent) -> bool {
        event.table == self.table
            && event.operation == self.operation
            && self.predicates.iter().all(|p| p.matches(event))
    }
}

/// Live subscription returned by [`ChangeFeed::subscribe`].
///
/// Dropping a handle aborts its delivery task, so a handle lost on an error
/// path still stops deliveries; `unsubscribe` additionally releases
/// transport-side resources.
#[derive(Debug)]
pub struct SubscriptionHandle {
    channel: String,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn new(channel: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            channel: channel.into(),
            task: Some(task),
        }
    }

    /// Handle with no delivery task of its own (the feed delivers inline).
    pub fn detached(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            task: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open exactly one subscription. Never fails; transport errors are
    /// logged and retried behind the handle.
    async fn subscribe(
        &self,
        channel: &str,
        filter: ChangeFilter,
        on_event: EventCallback,
    ) -> SubscriptionHandle;

    /// Stop delivery for `handle`. Best-effort: errors are logged, not retried.
    async fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Whether the transport currently has a live connection.
    fn is_connected(&self) -> bool {
        true
    }
}

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique channel name for one subscription of `purpose` by `viewer_id`.
///
/// The timestamp + process-wide sequence suffix keeps a rapid remount from
/// colliding with a stale channel of the previous subscription.
pub fn channel_name(purpose: &str, viewer_id: Uuid) -> String {
    let seq = CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
    let millis = chrono::Utc::now().timestamp_millis();
    format!("fieldhub-notify.{purpose}.{viewer_id}.{millis}-{seq}")
}
