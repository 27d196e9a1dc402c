//! Token cost estimation and line-based chunking
//!
//! The pool reserves capacity before a call is made, so every dispatch needs
//! a token estimate up front. Estimates are heuristic: the larger of a
//! word-based count (about 1.3 tokens per word) and a character-based count
//! (about 4 characters per token), which keeps dense text without whitespace
//! from being underestimated.

/// Estimate the token count of a string.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count() as u64;
    let chars = text.chars().count() as u64;
    let by_words = (words * 13).div_ceil(10);
    let by_chars = chars.div_ceil(4);
    by_words.max(by_chars)
}

/// Split text on line boundaries into chunks of at most `max_tokens`
/// estimated tokens.
///
/// A single line larger than the limit still becomes its own chunk, so every
/// chunk holds at least one line and the loop always advances.
pub fn chunk_by_tokens(text: &str, max_tokens: u64) -> Vec<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    let counts: Vec<u64> = lines.iter().map(|l| estimate_tokens(l)).collect();

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < lines.len() {
        let mut end = start;
        let mut total = 0u64;
        while end < lines.len() && total + counts[end] <= max_tokens {
            total += counts[end];
            end += 1;
        }
        if end == start {
            end = start + 1;
        }
        chunks.push(lines[start..end].join("\n"));
        start = end;
    }
    chunks
}

/// Split text into chunks of at most `max_tokens`, where each new chunk
/// begins with trailing lines of the previous one covering roughly
/// `overlap_ratio` of its tokens.
///
/// `overlap_ratio` is clamped to `[0, 1)`. Overlap is taken in whole lines,
/// so it may slightly exceed the target.
pub fn chunk_with_overlap(text: &str, max_tokens: u64, overlap_ratio: f64) -> Vec<String> {
    let ratio = overlap_ratio.clamp(0.0, 0.99);
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0u64;

    for line in text.split('\n') {
        let line_tokens = estimate_tokens(line);
        if current_tokens + line_tokens > max_tokens && !current.is_empty() {
            let target = (current_tokens as f64 * ratio) as u64;
            let mut overlap: Vec<&str> = Vec::new();
            let mut overlap_tokens = 0u64;
            if target > 0 {
                for prev in current.iter().rev() {
                    overlap.insert(0, *prev);
                    overlap_tokens += estimate_tokens(prev);
                    if overlap_tokens >= target {
                        break;
                    }
                }
            }
            chunks.push(current.join("\n"));
            current = overlap;
            current.push(line);
            current_tokens = overlap_tokens + line_tokens;
        } else {
            current.push(line);
            current_tokens += line_tokens;
        }
    }

    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    chunks
}
