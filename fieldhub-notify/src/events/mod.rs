pub mod change_feed;
pub mod subscriber;

pub use change_feed::{channel_name, ChangeFeed, ChangeFilter, EventCallback, RowPredicate, SubscriptionHandle};
pub use subscriber::{Backoff, RabbitChangeFeed};
