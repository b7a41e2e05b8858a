use crate::events::{ChangeFilter, RowPredicate};
use crate::models::ViewerId;

/// Which store lookup turns a raw row into a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// Row is a `message_notifications` row addressed to the viewer.
    Notification,
    /// Row is a `messages` row; the message id doubles as notification id.
    MessageWithSender,
}

/// Consumer context owning its own subscription and cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Purpose {
    /// Global header badge.
    #[default]
    Header,
    /// Badge embedded in a dashboard.
    Dashboard,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Dashboard => "dashboard",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Header => "message_notifications",
            Self::Dashboard => "messages",
        }
    }

    pub fn lookup(&self) -> LookupKind {
        match self {
            Self::Header => LookupKind::Notification,
            Self::Dashboard => LookupKind::MessageWithSender,
        }
    }

    /// Feed filter for `viewer_id`; evaluated before delivery, re-checked by
    /// the hydrator.
    pub fn filter(&self, viewer_id: ViewerId) -> ChangeFilter {
        let filter = ChangeFilter::inserts_into(self.table())
            .with_predicate(RowPredicate::not_eq("sender_id", viewer_id));
        match self {
            Self::Header => filter.with_predicate(RowPredicate::eq("recipient_id", viewer_id)),
            Self::Dashboard => filter,
        }
    }

    /// Re-subscribe whenever the viewer's active thread changes.
    pub fn resubscribe_on_thread_change(&self) -> bool {
        matches!(self, Self::Header)
    }

    /// Read state is mirrored to, and reloaded from, the store.
    pub fn durable_read_state(&self) -> bool {
        matches!(self, Self::Header)
    }

    pub fn all() -> [Purpose; 2] {
        [Self::Header, Self::Dashboard]
    }
}

impl std::str::FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|purpose| purpose.as_str() == s)
            .ok_or_else(|| format!("unknown purpose: {s}"))
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
