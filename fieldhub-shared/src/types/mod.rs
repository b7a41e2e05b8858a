pub mod api;
pub mod auth;
pub mod change;

pub use api::*;
pub use auth::*;
pub use change::*;
