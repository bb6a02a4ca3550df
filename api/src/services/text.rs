//! Small string helpers shared by the transcript, summary and queue code

/// Keep at most `max` chars (Unicode scalar values, never bytes)
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Replace every run of whitespace with a single space and trim the ends
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim, drop if empty, then clamp to `max` chars
pub fn clamp_optional(value: Option<String>, max: usize) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| truncate_chars(&v, max))
}

/// Strip punctuation that has no place in a title/summary search, then trim and clamp
pub fn sanitize_search_query(query: &str, max: usize) -> String {
    let kept: String = query
        .chars()
        .filter(|c| !matches!(*c, ',' | '.' | '(' | ')' | '"' | '\'' | '\\'))
        .collect();
    truncate_chars(kept.trim(), max)
}
