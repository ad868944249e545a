//! Single-line log rendering for message text and radio-supplied strings.
//!
//! Message bodies and advertised device names come off the air; they may carry
//! newlines or control bytes that would split or corrupt a log line.

use std::fmt::Write;

/// Default preview length for message text in logs.
pub const LOG_PREVIEW: usize = 160;

/// Escape `s` for a single log line, truncated to [`LOG_PREVIEW`] characters.
pub fn escape_log(s: &str) -> String {
    preview(s, LOG_PREVIEW)
}

/// Escape `s` for a single log line, keeping at most `max` source characters.
///
/// `\n`, `\r`, `\t` and `\\` get their usual escapes, other control
/// characters become `\xNN`. Truncation is marked with `…`.
pub fn preview(s: &str, max: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
