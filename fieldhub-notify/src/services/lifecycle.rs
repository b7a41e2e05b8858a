use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use fieldhub_shared::types::RawChangeEvent;

use crate::events::{channel_name, ChangeFeed, EventCallback, SubscriptionHandle};
use crate::models::ViewerId;
use crate::services::cache::NotificationCache;
use crate::services::debounce::Debouncer;
use crate::services::hydrator::{ActiveThreadSource, Hydrator};
use crate::services::purpose::Purpose;
use crate::services::store::NotificationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Active,
    TearingDown,
}

/// The one live subscription of a manager.
struct LiveSubscription {
    viewer_id: ViewerId,
    channel: String,
    handle: Option<SubscriptionHandle>,
    debouncer: Debouncer<NotificationCache>,
}

impl Drop for LiveSubscription {
    // Covers every exit path, including a cancelled `connect`.
    fn drop(&mut self) {
        self.debouncer.cancel();
    }
}

/// Puts the state back to `Idle` if a transition is dropped half-way,
/// e.g. when the task awaiting `connect` is aborted.
struct IdleOnDrop<'a> {
    state: &'a Mutex<SubscriptionState>,
    armed: bool,
}

impl IdleOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SubscriptionState::Idle;
        }
    }
}

/// Owns the subscription of one (viewer, purpose) pair and feeds its cache.
///
/// Transitions are serialised by an async mutex held across the feed calls,
/// so two live handles can never coexist: `connect` always releases the
/// previous handle before asking the feed for a new one.
pub struct SubscriptionManager {
    purpose: Purpose,
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn NotificationStore>,
    active_thread: Arc<dyn ActiveThreadSource>,
    cache: NotificationCache,
    debounce_window: Duration,
    slot: AsyncMutex<Option<LiveSubscription>>,
    state: Mutex<SubscriptionState>,
}

impl SubscriptionManager {
    pub fn new(
        purpose: Purpose,
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn NotificationStore>,
        active_thread: Arc<dyn ActiveThreadSource>,
        cache: NotificationCache,
        debounce_window: Duration,
    ) -> Self {
        Self {
            purpose,
            feed,
            store,
            active_thread,
            cache,
            debounce_window,
            slot: AsyncMutex::new(None),
            state: Mutex::new(SubscriptionState::Idle),
        }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn cache(&self) -> &NotificationCache {
        &self.cache
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SubscriptionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn idle_on_drop(&self) -> IdleOnDrop<'_> {
        IdleOnDrop {
            state: &self.state,
            armed: true,
        }
    }

    /// Viewer of the live subscription, if any.
    pub async fn viewer_id(&self) -> Option<ViewerId> {
        self.slot.lock().await.as_ref().map(|live| live.viewer_id)
    }

    /// (Re)subscribe for `viewer_id`. Any existing handle is released first;
    /// switching to another viewer also empties the cache.
    pub async fn connect(&self, viewer_id: ViewerId) {
        let mut slot = self.slot.lock().await;
        let reset = self.idle_on_drop();

        if let Some(previous) = slot.take() {
            let same_viewer = previous.viewer_id == viewer_id;
            self.release(previous).await;
            if !same_viewer {
                self.cache.clear();
            }
        }

        self.set_state(SubscriptionState::Connecting);

        let debouncer = Debouncer::new(self.cache.clone(), self.debounce_window);
        let hydrator = Hydrator::new(
            viewer_id,
            self.purpose.lookup(),
            self.store.clone(),
            self.active_thread.clone(),
        );
        let on_event: EventCallback = {
            let debouncer = debouncer.clone();
            Arc::new(move |event: RawChangeEvent| {
                let hydrator = hydrator.clone();
                let debouncer = debouncer.clone();
                tokio::spawn(async move {
                    if let Some(record) = hydrator.hydrate(&event).await.into_record() {
                        debouncer.submit(record);
                    }
                });
            })
        };

        let channel = channel_name(self.purpose.as_str(), viewer_id);
        let handle = self
            .feed
            .subscribe(&channel, self.purpose.filter(viewer_id), on_event)
            .await;

        tracing::info!(
            viewer_id = %viewer_id,
            purpose = %self.purpose,
            channel = %channel,
            "notification subscription active"
        );

        *slot = Some(LiveSubscription {
            viewer_id,
            channel,
            handle: Some(handle),
            debouncer,
        });
        self.set_state(SubscriptionState::Active);
        reset.disarm();
    }

    /// Release the live subscription, if any. Pending records are dropped.
    pub async fn teardown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(live) = slot.take() {
            self.release(live).await;
        }
    }

    async fn release(&self, mut live: LiveSubscription) {
        let _reset = self.idle_on_drop();
        self.set_state(SubscriptionState::TearingDown);

        let dropped = live.debouncer.cancel();
        if let Some(handle) = live.handle.take() {
            self.feed.unsubscribe(handle).await;
        }

        tracing::info!(
            viewer_id = %live.viewer_id,
            purpose = %self.purpose,
            channel = %live.channel,
            dropped,
            "notification subscription released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeFilter;
    use crate::services::hydrator::ActiveThread;
    use crate::testing::{header_event, insert_event, resolved, settle, FakeFeed, FakeStore};
    use tokio::time::sleep;
    use uuid::Uuid;

    const WINDOW: Duration = Duration::from_millis(100);

    fn manager(purpose: Purpose, feed: &FakeFeed, store: &FakeStore) -> SubscriptionManager {
        SubscriptionManager::new(
            purpose,
            Arc::new(feed.clone()),
            Arc::new(store.clone()),
            Arc::new(ActiveThread::new()),
            NotificationCache::new(),
            WINDOW,
        )
    }

    /// Feed whose calls never complete, to cancel transitions mid-way.
    struct StallingFeed {
        stall_subscribe: bool,
    }

    #[async_trait::async_trait]
    impl ChangeFeed for StallingFeed {
        async fn subscribe(
            &self,
            channel: &str,
            _filter: ChangeFilter,
            _on_event: EventCallback,
        ) -> SubscriptionHandle {
            if self.stall_subscribe {
                std::future::pending::<()>().await;
            }
            SubscriptionHandle::detached(channel)
        }

        async fn unsubscribe(&self, _handle: SubscriptionHandle) {
            std::future::pending::<()>().await;
        }
    }

    fn stalling_manager(stall_subscribe: bool) -> Arc<SubscriptionManager> {
        Arc::new(SubscriptionManager::new(
            Purpose::Header,
            Arc::new(StallingFeed { stall_subscribe }),
            Arc::new(FakeStore::default()),
            Arc::new(ActiveThread::new()),
            NotificationCache::new(),
            WINDOW,
        ))
    }

    #[tokio::test]
    async fn cancelled_connect_returns_to_idle() {
        let m = stalling_manager(true);
        let task = tokio::spawn({
            let m = m.clone();
            async move { m.connect(Uuid::new_v4()).await }
        });
        settle().await;
        assert_eq!(m.state(), SubscriptionState::Connecting);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(m.state(), SubscriptionState::Idle);
        assert_eq!(m.viewer_id().await, None);
    }

    #[tokio::test]
    async fn cancelled_teardown_returns_to_idle() {
        let m = stalling_manager(false);
        m.connect(Uuid::new_v4()).await;
        assert_eq!(m.state(), SubscriptionState::Active);

        let task = tokio::spawn({
            let m = m.clone();
            async move { m.teardown().await }
        });
        settle().await;
        assert_eq!(m.state(), SubscriptionState::TearingDown);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(m.state(), SubscriptionState::Idle);
    }

    #[tokio::test]
    async fn state_machine_round_trip() {
        let feed = FakeFeed::default();
        let m = manager(Purpose::Header, &feed, &FakeStore::default());
        let viewer = Uuid::new_v4();

        assert_eq!(m.state(), SubscriptionState::Idle);
        m.connect(viewer).await;
        assert_eq!(m.state(), SubscriptionState::Active);
        assert_eq!(m.viewer_id().await, Some(viewer));

        m.teardown().await;
        assert_eq!(m.state(), SubscriptionState::Idle);
        assert_eq!(m.viewer_id().await, None);
        assert_eq!(feed.live_count(), 0);

        // Tearing down an idle manager is a no-op.
        m.teardown().await;
        assert_eq!(feed.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_keeps_exactly_one_live_handle() {
        let feed = FakeFeed::default();
        let m = manager(Purpose::Header, &feed, &FakeStore::default());
        let viewer = Uuid::new_v4();

        m.connect(viewer).await;
        let first = feed.channels();
        m.connect(viewer).await;

        assert_eq!(feed.subscribe_count(), 2);
        assert_eq!(feed.unsubscribe_count(), 1);
        assert_eq!(feed.live_count(), 1);
        assert_ne!(feed.channels(), first);
    }

    #[tokio::test]
    async fn concurrent_connects_serialise() {
        let feed = FakeFeed::default();
        let m = Arc::new(manager(Purpose::Dashboard, &feed, &FakeStore::default()));
        let viewer = Uuid::new_v4();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                tokio::spawn(async move { m.connect(viewer).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(feed.subscribe_count(), 4);
        assert_eq!(feed.unsubscribe_count(), 3);
        assert_eq!(feed.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_the_cache_after_the_window() {
        let feed = FakeFeed::default();
        let store = FakeStore::default();
        let m = manager(Purpose::Header, &feed, &store);
        let viewer = Uuid::new_v4();
        m.connect(viewer).await;

        for _ in 0..2 {
            let (row, sender) = (Uuid::new_v4(), Uuid::new_v4());
            store.put(row, resolved(sender, Uuid::new_v4()));
            feed.emit(header_event(row, sender, viewer));
        }
        settle().await;
        assert_eq!(m.cache().count(), 0);

        sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(m.cache().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_discards_pending_batch() {
        let feed = FakeFeed::default();
        let store = FakeStore::default();
        let m = manager(Purpose::Dashboard, &feed, &store);
        m.connect(Uuid::new_v4()).await;

        for _ in 0..3 {
            let (row, sender) = (Uuid::new_v4(), Uuid::new_v4());
            store.put(row, resolved(sender, Uuid::new_v4()));
            feed.emit(insert_event("messages", row, sender));
        }
        settle().await;
        m.teardown().await;

        sleep(Duration::from_millis(500)).await;
        assert_eq!(m.cache().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_hydration_after_teardown_is_discarded() {
        let feed = FakeFeed::default();
        let store = FakeStore::default().with_delay(Duration::from_millis(50));
        let m = manager(Purpose::Dashboard, &feed, &store);
        m.connect(Uuid::new_v4()).await;

        let (row, sender) = (Uuid::new_v4(), Uuid::new_v4());
        store.put(row, resolved(sender, Uuid::new_v4()));
        feed.emit(insert_event("messages", row, sender));
        settle().await;
        m.teardown().await;

        sleep(Duration::from_millis(500)).await;
        assert_eq!(store.lookups(), 1);
        assert_eq!(m.cache().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_viewer_clears_the_cache() {
        let feed = FakeFeed::default();
        let store = FakeStore::default();
        let m = manager(Purpose::Dashboard, &feed, &store);
        m.connect(Uuid::new_v4()).await;

        let (row, sender) = (Uuid::new_v4(), Uuid::new_v4());
        store.put(row, resolved(sender, Uuid::new_v4()));
        feed.emit(insert_event("messages", row, sender));
        sleep(Duration::from_millis(150)).await;
        assert_eq!(m.cache().count(), 1);

        m.connect(Uuid::new_v4()).await;
        assert_eq!(m.cache().count(), 0);
    }
}
