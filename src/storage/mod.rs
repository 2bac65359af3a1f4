//! Persistent feed and item records (SQLite via `sqlx`).
//!
//! [`Database`] is the archival store: it owns every feed and item row,
//! applies reconciliation deltas one transaction per feed, and is the only
//! place items are ever deleted (purge by archive age, or cascading from a
//! feed that left the subscription list).

mod feeds;
mod items;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    AppliedDelta, CacheValidators, DatabaseError, DeltaCounts, Feed, FeedMeta, InsertedItem,
    ItemChange, ItemCounts, ItemDelta, ItemFilter, ItemStatus, ParsedItem, StoredItem,
};
