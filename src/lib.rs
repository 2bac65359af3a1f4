//! feedvault: a feed synchronizer that keeps an archival history of items.
//!
//! Each run fetches subscribed feeds conditionally, normalizes their entries,
//! reconciles them against the stored items and commits the difference. Items
//! that drop out of a feed are archived rather than deleted, and come back to
//! life if they reappear.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
