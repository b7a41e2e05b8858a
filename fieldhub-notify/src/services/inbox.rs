use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::events::ChangeFeed;
use crate::models::{NotificationRecord, ThreadId, ViewerId};
use crate::services::cache::{BadgeMode, NotificationCache};
use crate::services::hydrator::ActiveThread;
use crate::services::lifecycle::{SubscriptionManager, SubscriptionState};
use crate::services::purpose::Purpose;
use crate::services::store::NotificationStore;

#[derive(Debug, Clone, Copy)]
pub struct InboxSettings {
    pub debounce_window: Duration,
    pub recent_limit: i64,
    pub badge_mode: BadgeMode,
    /// Inboxes untouched for this long are released by the sweeper.
    pub idle_ttl: Duration,
}

impl Default for InboxSettings {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(100),
            recent_limit: 20,
            badge_mode: BadgeMode::default(),
            idle_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// What the UI sees for one (viewer, purpose): the cache, its live
/// subscription and the read-state operations.
pub struct Inbox {
    viewer_id: ViewerId,
    purpose: Purpose,
    cache: NotificationCache,
    manager: SubscriptionManager,
    store: Arc<dyn NotificationStore>,
    active_thread: ActiveThread,
    settings: InboxSettings,
    started: OnceCell<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    last_access: Mutex<Instant>,
}

impl Inbox {
    pub fn new(
        viewer_id: ViewerId,
        purpose: Purpose,
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn NotificationStore>,
        active_thread: ActiveThread,
        settings: InboxSettings,
    ) -> Self {
        let cache = NotificationCache::new();
        let manager = SubscriptionManager::new(
            purpose,
            feed,
            store.clone(),
            Arc::new(active_thread.clone()),
            cache.clone(),
            settings.debounce_window,
        );

        Self {
            viewer_id,
            purpose,
            cache,
            manager,
            store,
            active_thread,
            settings,
            started: OnceCell::new(),
            watcher: Mutex::new(None),
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn viewer_id(&self) -> ViewerId {
        self.viewer_id
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn state(&self) -> SubscriptionState {
        self.manager.state()
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_access.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    /// Subscribe and load the initial page. Only the first call does work.
    pub async fn start(self: &Arc<Self>) {
        self.started
            .get_or_init(|| async {
                self.manager.connect(self.viewer_id).await;
                self.reload().await;
                if self.purpose.resubscribe_on_thread_change() {
                    self.spawn_thread_watcher();
                }
            })
            .await;
    }

    fn spawn_thread_watcher(self: &Arc<Self>) {
        let mut rx = self.active_thread.subscribe();
        let inbox: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(inbox) = inbox.upgrade() else { break };
                let thread_id = *rx.borrow_and_update();
                tracing::debug!(
                    viewer_id = %inbox.viewer_id,
                    purpose = %inbox.purpose,
                    thread_id = ?thread_id,
                    "active thread changed, resubscribing"
                );
                // No reload: rows suppressed for the previous thread stay out.
                inbox.manager.connect(inbox.viewer_id).await;
            }
        });

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Merge the store's most recent page into the cache. Returns how many
    /// entries were added; store failures leave the cache as it is.
    pub async fn reload(&self) -> usize {
        if !self.purpose.durable_read_state() {
            return 0;
        }

        match self
            .store
            .recent_notifications(self.viewer_id, self.settings.recent_limit)
            .await
        {
            Ok(records) => {
                let added = self.cache.merge_durable(records);
                tracing::debug!(viewer_id = %self.viewer_id, purpose = %self.purpose, added, "inbox reloaded");
                added
            }
            Err(e) => {
                tracing::warn!(error = %e, viewer_id = %self.viewer_id, "failed to load recent notifications");
                0
            }
        }
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.cache.snapshot()
    }

    pub fn badge_count(&self) -> usize {
        self.cache.badge_count(self.settings.badge_mode)
    }

    /// Local-first: the cache flips immediately and the durable write
    /// follows in the background without rollback on failure.
    pub fn mark_read(&self, id: Uuid) -> bool {
        let updated = self.cache.mark_read(id);

        if self.purpose.durable_read_state() {
            let store = self.store.clone();
            let viewer_id = self.viewer_id;
            tokio::spawn(async move {
                if let Err(e) = store.mark_read(id, viewer_id).await {
                    tracing::warn!(
                        error = %e,
                        notification_id = %id,
                        viewer_id = %viewer_id,
                        "durable mark-read failed, local state kept"
                    );
                }
            });
        }

        updated
    }

    pub fn mark_all_read(&self) -> usize {
        let changed = self.cache.mark_all_read();

        if self.purpose.durable_read_state() {
            let store = self.store.clone();
            let viewer_id = self.viewer_id;
            tokio::spawn(async move {
                if let Err(e) = store.mark_all_read(viewer_id).await {
                    tracing::warn!(error = %e, viewer_id = %viewer_id, "durable mark-all-read failed, local state kept");
                }
            });
        }

        changed
    }

    /// Stop watching the active thread and release the subscription.
    pub async fn shutdown(&self) {
        let watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.manager.teardown().await;
    }
}

/// Every open inbox of the process, keyed by (viewer, purpose), plus the
/// per-viewer active thread they share.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn NotificationStore>,
    settings: InboxSettings,
    inboxes: DashMap<(ViewerId, Purpose), Arc<Inbox>>,
    threads: DashMap<ViewerId, ViewerThread>,
}

/// Active thread of a viewer, kept for inboxes opened later.
struct ViewerThread {
    thread: ActiveThread,
    touched: Instant,
}

impl SessionRegistry {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn NotificationStore>,
        settings: InboxSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                feed,
                store,
                settings,
                inboxes: DashMap::new(),
                threads: DashMap::new(),
            }),
        }
    }

    pub fn active_thread(&self, viewer_id: ViewerId) -> ActiveThread {
        let mut slot = self.inner.threads.entry(viewer_id).or_insert_with(|| ViewerThread {
            thread: ActiveThread::new(),
            touched: Instant::now(),
        });
        slot.touched = Instant::now();
        slot.thread.clone()
    }

    /// Set the viewer's open thread. Returns `true` when it changed.
    pub fn set_active_thread(&self, viewer_id: ViewerId, thread_id: Option<ThreadId>) -> bool {
        self.active_thread(viewer_id).set(thread_id)
    }

    /// The started inbox for (viewer, purpose), opened on first access.
    pub async fn inbox(&self, viewer_id: ViewerId, purpose: Purpose) -> Arc<Inbox> {
        let active_thread = self.active_thread(viewer_id);
        let inbox = self
            .inner
            .inboxes
            .entry((viewer_id, purpose))
            .or_insert_with(|| {
                Arc::new(Inbox::new(
                    viewer_id,
                    purpose,
                    self.inner.feed.clone(),
                    self.inner.store.clone(),
                    active_thread,
                    self.inner.settings,
                ))
            })
            .clone();

        inbox.touch();
        inbox.start().await;
        inbox
    }

    /// Release inboxes idle for at least the configured TTL, then forget
    /// active threads of viewers left without an inbox. Returns how many
    /// inboxes were released.
    pub async fn evict_idle(&self) -> usize {
        let ttl = self.inner.settings.idle_ttl;
        let now = Instant::now();
        let stale: Vec<_> = self
            .inner
            .inboxes
            .iter()
            .filter(|entry| entry.value().idle_for(now) >= ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for key in stale {
            // Re-checked under the shard lock; an access since the scan wins.
            let removed = self
                .inner
                .inboxes
                .remove_if(&key, |_, inbox| inbox.idle_for(now) >= ttl);
            if let Some((_, inbox)) = removed {
                inbox.shutdown().await;
                evicted += 1;
            }
        }

        let inboxes = &self.inner.inboxes;
        self.inner.threads.retain(|viewer_id, slot| {
            Purpose::all()
                .iter()
                .any(|purpose| inboxes.contains_key(&(*viewer_id, *purpose)))
                || now.saturating_duration_since(slot.touched) < ttl
        });

        if evicted > 0 {
            tracing::info!(evicted, remaining = self.session_count(), "idle notification sessions released");
        }
        evicted
    }

    /// Run `evict_idle` every `every` until the registry is dropped or the
    /// returned task is aborted.
    pub fn spawn_idle_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                SessionRegistry { inner }.evict_idle().await;
            }
        })
    }

    /// Release every inbox of `viewer_id`. Returns how many were open.
    pub async fn close(&self, viewer_id: ViewerId) -> usize {
        let mut closed = 0;
        for purpose in Purpose::all() {
            if let Some((_, inbox)) = self.inner.inboxes.remove(&(viewer_id, purpose)) {
                inbox.shutdown().await;
                closed += 1;
            }
        }
        self.inner.threads.remove(&viewer_id);

        if closed > 0 {
            tracing::info!(viewer_id = %viewer_id, closed, "session closed");
        }
        closed
    }

    pub async fn shutdown_all(&self) {
        let keys: Vec<_> = self.inner.inboxes.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, inbox)) = self.inner.inboxes.remove(&key) {
                inbox.shutdown().await;
            }
        }
        self.inner.threads.clear();
        tracing::info!("all notification sessions released");
    }

    pub fn session_count(&self) -> usize {
        self.inner.inboxes.len()
    }

    pub fn feed_connected(&self) -> bool {
        self.inner.feed.is_connected()
    }

    pub fn store_ready(&self) -> bool {
        self.inner.store.is_ready()
    }
}
