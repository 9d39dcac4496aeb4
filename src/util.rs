/// Safe ID prefix — never panics on non-ASCII or short strings.
#[inline]
pub fn short_id(id: &str) -> &str {
    let mut end = 8.min(id.len());
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

/// Truncate a string to `max` characters, appending "…" if truncated.
/// Handles multi-byte correctly via char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

/// Truncate to `max` chars without the ellipsis marker. Used where the
/// output feeds a prompt template that adds its own quoting.
pub fn clip_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
