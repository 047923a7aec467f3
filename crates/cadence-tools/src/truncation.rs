//! Output truncation strategies for tool results fed back to a model.

/// How to truncate output that exceeds the maximum character limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationMode {
    /// Keep first 40% and last 60%, with a marker in the middle.
    HeadTail,
    /// Keep the first `max_chars`, with a marker at the end.
    Head,
}

/// Truncate `output` to at most `max_chars` characters using the given mode.
///
/// Counts characters, not bytes, so multi-byte text is never split inside a
/// code point. Output within the limit is returned unchanged.
pub fn truncate_output(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let removed = total - max_chars;

    match mode {
        TruncationMode::HeadTail => {
            let head_size = max_chars * 40 / 100;
            let tail_size = max_chars - head_size;
            let head: String = output.chars().take(head_size).collect();
            let tail: String = output.chars().skip(total - tail_size).collect();
            format!(
                "{}\n[WARNING: Output truncated. {} characters removed from middle]\n{}",
                head, removed, tail
            )
        }
        TruncationMode::Head => {
            let head: String = output.chars().take(max_chars).collect();
            format!(
                "{}\n[WARNING: Output truncated. {} characters removed from end]",
                head, removed
            )
        }
    }
}
