use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::models::NotificationRecord;
use crate::services::cache::BatchSink;

/// Trailing-edge debounce in front of a [`BatchSink`].
///
/// Every `submit` pushes the single flush timer back by `window`; a burst
/// is delivered as one batch `window` after its last record. Once
/// cancelled, nothing reaches the sink again, including batches whose timer
/// already fired.
pub struct Debouncer<S: BatchSink> {
    inner: Arc<DebounceInner<S>>,
}

impl<S: BatchSink> Clone for Debouncer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct DebounceInner<S> {
    window: Duration,
    sink: S,
    state: Mutex<DebounceState>,
}

struct DebounceState {
    pending: Vec<NotificationRecord>,
    // Bumped on every submit; a timer only flushes its own generation.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    live: bool,
}

impl<S: BatchSink> Debouncer<S> {
    pub fn new(sink: S, window: Duration) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                window,
                sink,
                state: Mutex::new(DebounceState {
                    pending: Vec::new(),
                    generation: 0,
                    timer: None,
                    live: true,
                }),
            }),
        }
    }

    /// Queue `record` and (re)arm the flush timer. Ignored after `cancel`.
    pub fn submit(&self, record: NotificationRecord) {
        let mut state = self.inner.lock();
        if !state.live {
            tracing::trace!(notification_id = %record.id, "debouncer cancelled, dropping record");
            return;
        }

        state.pending.push(record);
        state.generation += 1;
        let generation = state.generation;

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let weak: Weak<DebounceInner<S>> = Arc::downgrade(&self.inner);
        let window = self.inner.window;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush(generation);
            }
        }));
    }

    /// Stop for good: disarm the timer and drop pending records.
    /// Returns how many records were dropped.
    pub fn cancel(&self) -> usize {
        let mut state = self.inner.lock();
        state.live = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().live
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl<S: BatchSink> DebounceInner<S> {
    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, generation: u64) {
        // The sink is written while the state lock is held so a concurrent
        // `cancel` either precedes the whole batch or follows it.
        let mut state = self.lock();
        if !state.live || state.generation != generation {
            return;
        }
        state.timer = None;
        let batch = std::mem::take(&mut state.pending);
        if batch.is_empty() {
            return;
        }

        let size = batch.len();
        let inserted = self.sink.insert_many(batch);
        drop(state);

        metrics::counter!("fieldhub_notification_batches_flushed_total").increment(1);
        tracing::debug!(batch = size, inserted, "notification batch flushed");
    }
}
