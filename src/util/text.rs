use std::borrow::Cow;

/// Trims a string and collapses every run of Unicode whitespace into a single
/// ASCII space.
///
/// Feed publishers routinely re-indent their XML or re-wrap long titles
/// between builds. Anything derived from item text that must stay stable
/// across fetches (fallback GUIDs, content hashes) goes through this first.
///
/// Returns a borrowed string when no change is needed.
///
/// # Examples
///
/// ```
/// use feedvault::util::collapse_whitespace;
///
/// assert_eq!(collapse_whitespace("  Hello \n\t world "), "Hello world");
/// assert_eq!(collapse_whitespace("already clean"), "already clean");
/// assert_eq!(collapse_whitespace(" \n "), "");
/// ```
pub fn collapse_whitespace(s: &str) -> Cow<'_, str> {
    let trimmed = s.trim();

    let mut prev_space = false;
    let needs_rewrite = trimmed.chars().any(|c| {
        let bad = c.is_whitespace() && (c != ' ' || prev_space);
        prev_space = c.is_whitespace();
        bad
    });

    if !needs_rewrite {
        return Cow::Borrowed(trimmed);
    }

    let mut out = String::with_capacity(trimmed.len());
    for word in trimmed.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    Cow::Owned(out)
}
