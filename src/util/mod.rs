//! Utility functions for common operations.
//!
//! - **Feed URLs**: canonicalization so a URL can act as a feed's identity
//! - **Text**: whitespace normalization for stable hashing of item text

mod feed_url;
mod text;

pub use feed_url::{canonicalize_feed_url, UrlError};
pub use text::collapse_whitespace;
