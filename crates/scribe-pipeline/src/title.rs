//! Chat title derivation.

/// First `max_words` words of `text`, cut to at most `max_chars` characters.
/// `None` when the text has no words.
pub fn derive_title(text: &str, max_words: usize, max_chars: usize) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().take(max_words).collect();
    if words.is_empty() {
        return None;
    }
    let joined = words.join(" ");
    let title = match joined.char_indices().nth(max_chars) {
        Some((cut, _)) => joined[..cut].trim_end().to_owned(),
        None => joined,
    };
    (!title.is_empty()).then_some(title)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
