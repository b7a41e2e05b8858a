//! In-memory fakes of the change feed and the store, plus fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use fieldhub_shared::errors::{AppError, AppResult, ErrorCode};
use fieldhub_shared::types::RawChangeEvent;

use crate::events::{ChangeFeed, ChangeFilter, EventCallback, SubscriptionHandle};
use crate::models::{MessageSnapshot, NotificationRecord, ResolvedMessage, SenderSnapshot, ViewerId};
use crate::services::cache::BatchSink;
use crate::services::store::NotificationStore;

pub(crate) fn record(id: Uuid) -> NotificationRecord {
    NotificationRecord {
        id,
        viewed: false,
        message_id: Uuid::new_v4(),
        sender_id: Uuid::new_v4(),
        message: MessageSnapshot {
            content: "distribution list updated".into(),
            sent_at: Utc::now(),
            thread_id: Uuid::new_v4(),
        },
        sender: SenderSnapshot {
            name: "Kofi".into(),
            avatar_url: None,
            role: Some("member".into()),
        },
    }
}

pub(crate) fn resolved(sender_id: Uuid, thread_id: Uuid) -> ResolvedMessage {
    ResolvedMessage {
        message_id: Uuid::new_v4(),
        sender_id,
        thread_id,
        content: "are we still on for the 3pm visit?".into(),
        sent_at: Utc::now(),
        sender_name: "Lina".into(),
        sender_avatar: Some("https://cdn.fieldhub.test/a/lina.png".into()),
        sender_role: Some("coordinator".into()),
    }
}

fn row(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

pub(crate) fn insert_event(table: &str, row_id: Uuid, sender_id: Uuid) -> RawChangeEvent {
    RawChangeEvent::insert(
        table,
        row(json!({ "id": row_id.to_string(), "sender_id": sender_id.to_string() })),
    )
}

pub(crate) fn header_event(row_id: Uuid, sender_id: Uuid, recipient_id: ViewerId) -> RawChangeEvent {
    RawChangeEvent::insert(
        "message_notifications",
        row(json!({
            "id": row_id.to_string(),
            "sender_id": sender_id.to_string(),
            "recipient_id": recipient_id.to_string(),
        })),
    )
}

/// Let spawned tasks run to their next real suspension point.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<NotificationRecord>>>>,
}

impl RecordingSink {
    pub(crate) fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

impl BatchSink for RecordingSink {
    fn insert_many(&self, records: Vec<NotificationRecord>) -> usize {
        let len = records.len();
        self.batches.lock().unwrap().push(records);
        len
    }
}

#[derive(Default)]
struct FeedState {
    live: Vec<(String, ChangeFilter, EventCallback)>,
    subscribes: usize,
    unsubscribes: usize,
}

/// Change feed that delivers only what a test emits.
#[derive(Clone, Default)]
pub(crate) struct FakeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl FakeFeed {
    /// Deliver `event` to every live subscription whose filter accepts it.
    pub(crate) fn emit(&self, event: RawChangeEvent) {
        let callbacks: Vec<EventCallback> = self
            .state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|(_, filter, _)| filter.matches(&event))
            .map(|(_, _, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.state.lock().unwrap().subscribes
    }

    pub(crate) fn unsubscribe_count(&self) -> usize {
        self.state.lock().unwrap().unsubscribes
    }

    pub(crate) fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        self.state.lock().unwrap().live.iter().map(|(c, _, _)| c.clone()).collect()
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(
        &self,
        channel: &str,
        filter: ChangeFilter,
        on_event: EventCallback,
    ) -> SubscriptionHandle {
        let mut state = self.state.lock().unwrap();
        state.subscribes += 1;
        state.live.push((channel.to_string(), filter, on_event));
        SubscriptionHandle::detached(channel)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut state = self.state.lock().unwrap();
        state.unsubscribes += 1;
        state.live.retain(|(channel, _, _)| channel != handle.channel());
    }
}

#[derive(Default)]
struct StoreState {
    rows: Mutex<HashMap<Uuid, ResolvedMessage>>,
    recent: Mutex<Vec<NotificationRecord>>,
    marked_read: Mutex<Vec<(Uuid, ViewerId)>>,
    delay: Mutex<Option<Duration>>,
    lookups: AtomicUsize,
    recent_calls: AtomicUsize,
    mark_all_calls: AtomicUsize,
    fail_lookups: AtomicBool,
    fail_writes: AtomicBool,
}

/// Store backed by maps; lookups can be delayed or made to fail.
#[derive(Clone, Default)]
pub(crate) struct FakeStore {
    state: Arc<StoreState>,
}

impl FakeStore {
    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock().unwrap() = Some(delay);
        self
    }

    pub(crate) fn put(&self, row_id: Uuid, resolved: ResolvedMessage) {
        self.state.rows.lock().unwrap().insert(row_id, resolved);
    }

    pub(crate) fn set_recent(&self, records: Vec<NotificationRecord>) {
        *self.state.recent.lock().unwrap() = records;
    }

    pub(crate) fn fail_lookups(&self, fail: bool) {
        self.state.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn lookups(&self) -> usize {
        self.state.lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn recent_calls(&self) -> usize {
        self.state.recent_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_all_calls(&self) -> usize {
        self.state.mark_all_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn marked_read(&self) -> Vec<(Uuid, ViewerId)> {
        self.state.marked_read.lock().unwrap().clone()
    }

    async fn lookup(&self, row_id: Uuid) -> AppResult<Option<ResolvedMessage>> {
        self.state.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_lookups.load(Ordering::SeqCst) {
            return Err(AppError::new(ErrorCode::LookupFailed, "lookup unavailable"));
        }
        Ok(self.state.rows.lock().unwrap().get(&row_id).cloned())
    }

    fn check_writes(&self) -> AppResult<()> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::internal("store is read-only"));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for FakeStore {
    async fn resolve_notification(
        &self,
        row_id: Uuid,
        _viewer_id: ViewerId,
    ) -> AppResult<Option<ResolvedMessage>> {
        self.lookup(row_id).await
    }

    async fn resolve_message_with_sender(&self, row_id: Uuid) -> AppResult<Option<ResolvedMessage>> {
        self.lookup(row_id).await
    }

    async fn recent_notifications(
        &self,
        _viewer_id: ViewerId,
        limit: i64,
    ) -> AppResult<Vec<NotificationRecord>> {
        self.state.recent_calls.fetch_add(1, Ordering::SeqCst);
        let recent = self.state.recent.lock().unwrap();
        Ok(recent.iter().take(limit.max(0) as usize).cloned().collect())
    }

    async fn mark_read(&self, notification_id: Uuid, viewer_id: ViewerId) -> AppResult<()> {
        self.check_writes()?;
        self.state.marked_read.lock().unwrap().push((notification_id, viewer_id));
        Ok(())
    }

    async fn mark_all_read(&self, _viewer_id: ViewerId) -> AppResult<usize> {
        self.check_writes()?;
        self.state.mark_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}
