pub mod cache;
pub mod debounce;
pub mod hydrator;
pub mod inbox;
pub mod lifecycle;
pub mod purpose;
pub mod store;
