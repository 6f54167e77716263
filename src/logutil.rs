//! Logging helpers for raw link data so logs stay single-line.
//! Radio noise regularly contains control bytes and partial UTF-8.

const MAX_PREVIEW: usize = 120;

/// Escape received bytes for single-line logging:
/// - `\n`, `\r`, `\t` and backslash are escaped
/// - other control characters and invalid UTF-8 become `\xNN`
/// - input longer than the preview cap is cut with an ellipsis
pub fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len().min(MAX_PREVIEW) + 8);
    let mut shown = 0usize;
    for chunk in data.utf8_chunks() {
        for ch in chunk.valid().chars() {
            if shown >= MAX_PREVIEW {
                out.push('…');
                return out;
            }
            shown += 1;
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
        for b in chunk.invalid() {
            let _ = write!(&mut out, "\\x{:02X}", b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::escape_bytes;

    #[test]
    fn escapes_control_and_invalid_bytes() {
        let esc = escape_bytes(b"S001;1;2E\r\n\x00\xff");
        assert_eq!(esc, "S001;1;2E\\r\\n\\x00\\xFF");
    }

    #[test]
    fn truncates_long_input() {
        let long = vec![b'a'; 500];
        let esc = escape_bytes(&long);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), 121);
    }
}
