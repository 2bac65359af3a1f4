use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::storage::ParsedItem;
use crate::util::collapse_whitespace;

/// Bytes inspected when sniffing the document type.
const SNIFF_WINDOW: usize = 1024;

/// Field separator for hashed inputs (ASCII unit separator, never in feed text).
const SEP: u8 = 0x1f;

/// Wire format of a feed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Rss,
    Atom,
    Json,
    /// An HTML page, typically a site homepage or an error page served with 200
    Html,
    Unknown,
}

/// Errors produced while turning a response body into items.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Not a feed: response body is {0}")]
    NotAFeed(&'static str),
    #[error("Malformed feed: {0}")]
    Malformed(String),
}

/// A feed document normalized into the shape the store understands.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub format: FeedFormat,
    /// Items in document order. May contain duplicate GUIDs.
    pub items: Vec<ParsedItem>,
}

/// Guess the document type from leading markup, falling back to the declared
/// content type.
///
/// Body markers win because servers frequently label feeds `text/html` or
/// `text/plain`.
pub fn sniff_format(content_type: Option<&str>, bytes: &[u8]) -> FeedFormat {
    let head = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let head = head.strip_prefix(b"\xef\xbb\xbf").unwrap_or(head);
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let trimmed = head.trim_start();

    if trimmed.starts_with('{') {
        return FeedFormat::Json;
    }
    if trimmed.contains("<rss") || trimmed.contains("<rdf:rdf") {
        return FeedFormat::Rss;
    }
    if trimmed.contains("<feed") {
        return FeedFormat::Atom;
    }
    if trimmed.contains("<html") || trimmed.starts_with("<!doctype html") {
        return FeedFormat::Html;
    }

    let declared = content_type.map(str::to_ascii_lowercase).unwrap_or_default();
    if declared.contains("atom") {
        FeedFormat::Atom
    } else if declared.contains("rss") || declared.contains("rdf") {
        FeedFormat::Rss
    } else if declared.contains("json") {
        FeedFormat::Json
    } else {
        FeedFormat::Unknown
    }
}

/// Parse an RSS, Atom or JSON Feed document.
///
/// Items without a feed-supplied id get a [`fingerprint`] of their link and
/// title. Items without a date are kept with `published = None`.
///
/// # Errors
///
/// [`ParseError::NotAFeed`] when the body is an HTML page,
/// [`ParseError::Malformed`] when the document cannot be parsed.
pub fn parse_feed(bytes: &[u8], content_type: Option<&str>) -> Result<ParsedFeed, ParseError> {
    let format = sniff_format(content_type, bytes);
    if format == FeedFormat::Html {
        return Err(ParseError::NotAFeed("an HTML page"));
    }

    // Returning an empty id for id-less entries lets us apply our own
    // whitespace-insensitive fingerprint instead of the parser's.
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)
        .map_err(|e| ParseError::Malformed(e.to_string()))?;

    let items = feed.entries.into_iter().map(normalize_entry).collect();

    Ok(ParsedFeed {
        title: feed.title.and_then(|t| non_empty(&t.content)),
        description: feed.description.and_then(|t| non_empty(&t.content)),
        link: preferred_link(&feed.links),
        format,
        items,
    })
}

fn normalize_entry(entry: Entry) -> ParsedItem {
    let link = preferred_link(&entry.links);
    let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let summary = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .filter(|s| !s.trim().is_empty());
    let raw_title = entry
        .title
        .map(|t| collapse_whitespace(&t.content).into_owned())
        .unwrap_or_default();

    let guid = match entry.id.trim() {
        "" => fingerprint(link.as_deref(), &raw_title),
        id => id.to_string(),
    };
    let content_hash = content_hash(&raw_title, link.as_deref(), published, summary.as_deref());
    let title = if raw_title.is_empty() {
        "Untitled".to_string()
    } else {
        raw_title
    };

    ParsedItem {
        guid,
        title,
        link,
        published,
        summary,
        content_hash,
    }
}

/// The `alternate` (or unlabelled) link, else the first link at all.
fn preferred_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .and_then(|l| non_empty(&l.href))
}

fn non_empty(s: &str) -> Option<String> {
    let collapsed = collapse_whitespace(s);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.into_owned())
    }
}

/// Stable identity for an item that has no GUID.
///
/// SHA-256 over the whitespace-normalized link and title, so re-indented or
/// re-wrapped upstream XML maps to the same item.
pub fn fingerprint(link: Option<&str>, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collapse_whitespace(link.unwrap_or("")).as_bytes());
    hasher.update([SEP]);
    hasher.update(collapse_whitespace(title).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Change detector for an item's visible content.
pub fn content_hash(
    title: &str,
    link: Option<&str>,
    published: Option<i64>,
    summary: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collapse_whitespace(title).as_bytes());
    hasher.update([SEP]);
    hasher.update(collapse_whitespace(link.unwrap_or("")).as_bytes());
    hasher.update([SEP]);
    hasher.update(published.map(|p| p.to_string()).unwrap_or_default().as_bytes());
    hasher.update([SEP]);
    hasher.update(collapse_whitespace(summary.unwrap_or("")).as_bytes());
    format!("{:x}", hasher.finalize())
}
