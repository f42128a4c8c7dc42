//! Deterministic text segmentation.
//!
//! Splits text into overlapping windows of roughly `target_tokens` tokens
//! (one token ≈ 4 characters), snapping window ends back to a blank-line
//! boundary when one exists in the second half of the window, and to a
//! sentence boundary otherwise.

/// Default window size in tokens.
pub const DEFAULT_TARGET_TOKENS: usize = 400;
/// Default overlap between consecutive windows in tokens.
pub const DEFAULT_OVERLAP_TOKENS: usize = 80;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a text.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Chunk text with the default window and overlap.
pub fn chunk_default(text: &str) -> Vec<String> {
    chunk(text, DEFAULT_TARGET_TOKENS, DEFAULT_OVERLAP_TOKENS)
}

/// Split `text` into an ordered sequence of trimmed, non-empty windows.
///
/// Each window targets `target_tokens * 4` characters. A window that does not
/// reach the end of the text tries to end at the last blank line (`"\n\n"`)
/// in its second half, falling back to the last sentence boundary (`". "`)
/// there, with the end placed just after the period. Consecutive windows
/// overlap by `overlap_tokens * 4` characters; the start never regresses.
pub fn chunk(text: &str, target_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let len = text.len();
    if text.trim().is_empty() {
        return Vec::new();
    }

    let window = (target_tokens * CHARS_PER_TOKEN).max(CHARS_PER_TOKEN);
    let overlap = overlap_tokens * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let mut end = floor_char_boundary(text, (start + window).min(len));

        if end < len {
            let floor = floor_char_boundary(text, (start + window / 2).min(end));
            let slice = &text[floor..end];
            if let Some(pos) = slice.rfind("\n\n") {
                end = floor + pos;
            } else if let Some(pos) = slice.rfind(". ") {
                // Keep the period with the chunk it terminates
                end = floor + pos + 1;
            }
        }

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= len {
            break;
        }

        let next = floor_char_boundary(text, end.saturating_sub(overlap));
        // The overlap must never move the window backwards
        start = if next > start { next } else { end };
    }

    chunks
}

/// Largest char boundary `<= index`.
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
