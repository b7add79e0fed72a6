//! Character-accurate truncation helpers.
//!
//! Several components (Stage0 doc digesting, KB snippet previews, reranker
//! candidate rendering) truncate text to a char budget and append an
//! ellipsis. `str::len` counts bytes, which would panic on a multi-byte
//! boundary, so everything here walks `chars()`.

/// Truncate `text` to at most `max_chars` characters, appending `…` when
/// anything was cut.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Truncate without an ellipsis marker (used where a hard byte/char budget
/// matters more than readability, e.g. chunking windows).
pub fn truncate_plain(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_and_marks() {
        assert_eq!(truncate_text("hello world", 5), "hello…");
    }

    #[test]
    fn leaves_short_text_untouched() {
        assert_eq!(truncate_text("hi", 5), "hi");
    }

    #[test]
    fn respects_multibyte_boundaries() {
        let s = "你好世界和平";
        assert_eq!(truncate_text(s, 2), "你好…");
    }
}
