//! Getting feeds off the network and into normalized items.
//!
//! - [`fetcher`] - conditional HTTP GET with cache validators and a hard timeout
//! - [`parser`] - RSS, Atom and JSON Feed normalization via `feed-rs`
//! - [`subscriptions`] - OPML and plain-text subscription lists
//!
//! None of these touch the database; the sync layer wires them to storage.

pub mod fetcher;
pub mod parser;
pub mod subscriptions;

pub use fetcher::{
    build_client, fetch_feed, ErrorKind, FetchError, FetchResponse, FetchedBody, DEFAULT_TIMEOUT,
};
pub use parser::{
    content_hash, fingerprint, parse_feed, sniff_format, FeedFormat, ParseError, ParsedFeed,
};
pub use subscriptions::{load_subscriptions, parse_opml, parse_url_list, SubscriptionError};
