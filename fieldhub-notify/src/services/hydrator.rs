use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use fieldhub_shared::types::RawChangeEvent;

use crate::models::{NotificationRecord, ThreadId, ViewerId};
use crate::services::purpose::LookupKind;
use crate::services::store::NotificationStore;

/// Read-only view of the thread the viewer currently has open.
pub trait ActiveThreadSource: Send + Sync {
    fn active_thread_id(&self) -> Option<ThreadId>;
}

/// Viewer-scoped active thread shared by every inbox of that viewer.
///
/// Only the session surface writes it; the pipeline reads it at hydration
/// time and the header inbox watches it to re-subscribe.
#[derive(Clone)]
pub struct ActiveThread {
    tx: Arc<watch::Sender<Option<ThreadId>>>,
}

impl Default for ActiveThread {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl ActiveThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ThreadId> {
        *self.tx.borrow()
    }

    /// Returns `true` when the value actually changed.
    pub fn set(&self, thread_id: Option<ThreadId>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == thread_id {
                false
            } else {
                *current = thread_id;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ThreadId>> {
        self.tx.subscribe()
    }
}

impl ActiveThreadSource for ActiveThread {
    fn active_thread_id(&self) -> Option<ThreadId> {
        self.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    SelfAuthored,
    ActiveThread,
    NotFound,
    LookupFailed,
    Malformed,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfAuthored => "self_authored",
            Self::ActiveThread => "active_thread",
            Self::NotFound => "not_found",
            Self::LookupFailed => "lookup_failed",
            Self::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Hydration {
    Ready(NotificationRecord),
    Suppressed(SuppressReason),
}

impl Hydration {
    pub fn into_record(self) -> Option<NotificationRecord> {
        match self {
            Self::Ready(record) => Some(record),
            Self::Suppressed(_) => None,
        }
    }
}

/// Turns raw row inserts into display-ready records for one viewer.
#[derive(Clone)]
pub struct Hydrator {
    viewer_id: ViewerId,
    lookup: LookupKind,
    store: Arc<dyn NotificationStore>,
    active_thread: Arc<dyn ActiveThreadSource>,
}

impl Hydrator {
    pub fn new(
        viewer_id: ViewerId,
        lookup: LookupKind,
        store: Arc<dyn NotificationStore>,
        active_thread: Arc<dyn ActiveThreadSource>,
    ) -> Self {
        Self {
            viewer_id,
            lookup,
            store,
            active_thread,
        }
    }

    pub async fn hydrate(&self, event: &RawChangeEvent) -> Hydration {
        let outcome = self.resolve(event).await;
        match &outcome {
            Hydration::Ready(record) => {
                metrics::counter!("fieldhub_notifications_hydrated_total").increment(1);
                tracing::debug!(notification_id = %record.id, viewer_id = %self.viewer_id, "notification hydrated");
            }
            Hydration::Suppressed(reason) => {
                metrics::counter!("fieldhub_notifications_suppressed_total", "reason" => reason.as_str())
                    .increment(1);
                tracing::trace!(reason = reason.as_str(), viewer_id = %self.viewer_id, "notification suppressed");
            }
        }
        outcome
    }

    async fn resolve(&self, event: &RawChangeEvent) -> Hydration {
        let Some(row_id) = event.uuid_column("id") else {
            tracing::warn!(table = %event.table, "change event without a usable id");
            return Hydration::Suppressed(SuppressReason::Malformed);
        };

        // Cheap rejection before the round-trip.
        if self.is_viewer(event.uuid_column("sender_id")) {
            return Hydration::Suppressed(SuppressReason::SelfAuthored);
        }

        let lookup = match self.lookup {
            LookupKind::Notification => self.store.resolve_notification(row_id, self.viewer_id).await,
            LookupKind::MessageWithSender => self.store.resolve_message_with_sender(row_id).await,
        };

        let resolved = match lookup {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Hydration::Suppressed(SuppressReason::NotFound),
            Err(e) => {
                tracing::warn!(error = %e, row_id = %row_id, viewer_id = %self.viewer_id, "notification lookup failed");
                return Hydration::Suppressed(SuppressReason::LookupFailed);
            }
        };

        // The row predicate is best-effort; the resolved sender is authoritative.
        if self.is_viewer(Some(resolved.sender_id)) {
            return Hydration::Suppressed(SuppressReason::SelfAuthored);
        }

        // Read after the lookup: the viewer may have switched threads meanwhile.
        if self.active_thread.active_thread_id() == Some(resolved.thread_id) {
            return Hydration::Suppressed(SuppressReason::ActiveThread);
        }

        Hydration::Ready(resolved.into_record(row_id))
    }

    fn is_viewer(&self, id: Option<Uuid>) -> bool {
        id == Some(self.viewer_id)
    }
}
