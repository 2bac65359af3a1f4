use thiserror::Error;
use url::Url;

/// Errors that can occur while canonicalizing a feed URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Canonicalizes a feed URL so that it can serve as the feed's identity.
///
/// The `url` crate already lowercases the scheme and host, removes default
/// ports and normalizes percent-encoding. On top of that the fragment is
/// dropped, since it never reaches the server and two subscriptions that only
/// differ by fragment are the same feed.
///
/// # Errors
///
/// Returns [`UrlError`] if the string does not parse, is not HTTP(S), or has
/// no host.
///
/// # Examples
///
/// ```
/// use feedvault::util::canonicalize_feed_url;
///
/// let url = canonicalize_feed_url("  HTTPS://Example.COM:443/feed.xml#top ").unwrap();
/// assert_eq!(url, "https://example.com/feed.xml");
///
/// assert!(canonicalize_feed_url("file:///etc/passwd").is_err());
/// ```
pub fn canonicalize_feed_url(raw: &str) -> Result<String, UrlError> {
    let mut url = Url::parse(raw.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingHost);
    }

    url.set_fragment(None);
    Ok(url.into())
}
