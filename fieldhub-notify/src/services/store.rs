use async_trait::async_trait;
use diesel::prelude::*;
use uuid::Uuid;

use fieldhub_shared::clients::db::DbPool;
use fieldhub_shared::errors::{AppError, AppResult};

use crate::models::{NotificationRecord, ResolvedMessage, ViewerId};
use crate::schema::{message_notifications, messages, profiles};

/// Read/write operations the pipeline needs from the relational store.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Resolve a `message_notifications` row addressed to `viewer_id`.
    /// `None` when the row is gone or not visible to the viewer.
    async fn resolve_notification(
        &self,
        row_id: Uuid,
        viewer_id: ViewerId,
    ) -> AppResult<Option<ResolvedMessage>>;

    /// Resolve a `messages` row together with its sender.
    async fn resolve_message_with_sender(&self, row_id: Uuid) -> AppResult<Option<ResolvedMessage>>;

    /// The viewer's `limit` most recent notifications, newest first.
    async fn recent_notifications(
        &self,
        viewer_id: ViewerId,
        limit: i64,
    ) -> AppResult<Vec<NotificationRecord>>;

    async fn mark_read(&self, notification_id: Uuid, viewer_id: ViewerId) -> AppResult<()>;

    async fn mark_all_read(&self, viewer_id: ViewerId) -> AppResult<usize>;

    /// Cheap readiness probe for health checks.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Postgres-backed store; diesel calls run on the blocking pool.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: DbPool,
}

impl PgNotificationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn blocking<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DbPool) -> AppResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || op(&pool))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("store task failed: {e}")))?
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn resolve_notification(
        &self,
        row_id: Uuid,
        viewer_id: ViewerId,
    ) -> AppResult<Option<ResolvedMessage>> {
        self.blocking(move |pool| resolve_notification(pool, row_id, viewer_id)).await
    }

    async fn resolve_message_with_sender(&self, row_id: Uuid) -> AppResult<Option<ResolvedMessage>> {
        self.blocking(move |pool| resolve_message_with_sender(pool, row_id)).await
    }

    async fn recent_notifications(
        &self,
        viewer_id: ViewerId,
        limit: i64,
    ) -> AppResult<Vec<NotificationRecord>> {
        self.blocking(move |pool| recent_notifications(pool, viewer_id, limit)).await
    }

    async fn mark_read(&self, notification_id: Uuid, viewer_id: ViewerId) -> AppResult<()> {
        self.blocking(move |pool| mark_read(pool, notification_id, viewer_id)).await
    }

    async fn mark_all_read(&self, viewer_id: ViewerId) -> AppResult<usize> {
        self.blocking(move |pool| mark_all_read(pool, viewer_id)).await
    }

    fn is_ready(&self) -> bool {
        // Lazily-opened pool: no idle connection yet is still ready as long
        // as the pool is not saturated.
        let state = self.pool.state();
        state.idle_connections > 0 || state.connections < self.pool.max_size()
    }
}

type Conn = diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<diesel::pg::PgConnection>>;

fn connection(pool: &DbPool) -> AppResult<Conn> {
    pool.get().map_err(|e| {
        tracing::error!(error = %e, "failed to get db connection");
        AppError::internal("database connection error")
    })
}

/// Columns of [`ResolvedMessage`], in field order.
macro_rules! resolved_columns {
    () => {
        (
            messages::id,
            messages::sender_id,
            messages::thread_id,
            messages::content,
            messages::sent_at,
            profiles::full_name,
            profiles::avatar_url,
            profiles::role,
        )
    };
}

fn resolve_notification(
    pool: &DbPool,
    row_id: Uuid,
    viewer_id: ViewerId,
) -> AppResult<Option<ResolvedMessage>> {
    let mut conn = connection(pool)?;

    let resolved = message_notifications::table
        .inner_join(messages::table.inner_join(profiles::table))
        .filter(message_notifications::id.eq(row_id))
        .filter(message_notifications::recipient_id.eq(viewer_id))
        .select(resolved_columns!())
        .first::<ResolvedMessage>(&mut conn)
        .optional()?;

    Ok(resolved)
}

fn resolve_message_with_sender(pool: &DbPool, row_id: Uuid) -> AppResult<Option<ResolvedMessage>> {
    let mut conn = connection(pool)?;

    let resolved = messages::table
        .inner_join(profiles::table)
        .filter(messages::id.eq(row_id))
        .select(resolved_columns!())
        .first::<ResolvedMessage>(&mut conn)
        .optional()?;

    Ok(resolved)
}

fn recent_notifications(
    pool: &DbPool,
    viewer_id: ViewerId,
    limit: i64,
) -> AppResult<Vec<NotificationRecord>> {
    let mut conn = connection(pool)?;

    let rows = message_notifications::table
        .inner_join(messages::table.inner_join(profiles::table))
        .filter(message_notifications::recipient_id.eq(viewer_id))
        .order(messages::sent_at.desc())
        .limit(limit)
        .select((
            message_notifications::id,
            message_notifications::viewed,
            resolved_columns!(),
        ))
        .load::<(Uuid, bool, ResolvedMessage)>(&mut conn)?;

    Ok(rows
        .into_iter()
        .map(|(id, viewed, resolved)| resolved.into_record_with(id, viewed))
        .collect())
}

fn mark_read(pool: &DbPool, notification_id: Uuid, viewer_id: ViewerId) -> AppResult<()> {
    let mut conn = connection(pool)?;

    let updated = diesel::update(
        message_notifications::table
            .filter(message_notifications::id.eq(notification_id))
            .filter(message_notifications::recipient_id.eq(viewer_id)),
    )
    .set(message_notifications::viewed.eq(true))
    .execute(&mut conn)?;

    tracing::debug!(
        notification_id = %notification_id,
        viewer_id = %viewer_id,
        updated,
        "notification marked read"
    );

    Ok(())
}

fn mark_all_read(pool: &DbPool, viewer_id: ViewerId) -> AppResult<usize> {
    let mut conn = connection(pool)?;

    let updated = diesel::update(
        message_notifications::table
            .filter(message_notifications::recipient_id.eq(viewer_id))
            .filter(message_notifications::viewed.eq(false)),
    )
    .set(message_notifications::viewed.eq(true))
    .execute(&mut conn)?;

    Ok(updated)
}
