//! Middle-omission truncation for captured task output.
//!
//! The start of a log usually says what a task was doing and the end says how
//! it failed, so both are kept and the middle is replaced by a marker.

/// Shorten `output` to at most `max_chars` characters of content, keeping
/// the first and last halves. Counts `char`s, never splits a code point.
pub fn truncate_middle(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let head_len = max_chars / 2;
    let tail_len = max_chars - head_len;
    let head_end = byte_offset(output, head_len);
    let tail_start = byte_offset(output, total - tail_len);
    let omitted = total - max_chars;

    format!(
        "{}\n... [{omitted} chars of output omitted] ...\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

/// Byte index of the `n`th char, or the string length if there are fewer.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}
