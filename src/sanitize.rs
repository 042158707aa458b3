//! Text sanitization for untrusted API payloads.
//!
//! Everything harvested from the API passes through here before assembly and
//! again before persistence, so no malformed sequence or unbounded document
//! ever reaches storage.

/// Maximum characters kept from a repository's primary document.
pub const DOC_CHAR_CAP: usize = 10_000;

/// Appended when a document is cut at the cap.
const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Decode arbitrary bytes into valid UTF-8, replacing each invalid byte with
/// one U+FFFD.
///
/// Granularity matters here: an invalid three-byte run becomes three
/// replacement characters, not one. Stored rows produced by earlier harvests
/// used byte-level replacement, and re-harvesting must reproduce them
/// byte-for-byte, which rules out `String::from_utf8_lossy` (it collapses a
/// whole invalid run into a single replacement).
pub fn sanitize_bytes(input: &[u8]) -> String {
    match std::str::from_utf8(input) {
        Ok(valid) => valid.to_string(),
        Err(_) => {
            let mut out = String::with_capacity(input.len());
            let mut rest = input;
            loop {
                match std::str::from_utf8(rest) {
                    Ok(valid) => {
                        out.push_str(valid);
                        break;
                    }
                    Err(e) => {
                        let valid_up_to = e.valid_up_to();
                        if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                            out.push_str(valid);
                        }
                        out.push('\u{FFFD}');
                        // Advance exactly one byte past the valid prefix and
                        // re-validate from there.
                        rest = &rest[valid_up_to + 1..];
                    }
                }
            }
            out
        }
    }
}

/// Sanitize text that is already a `str`.
///
/// A `str` is valid UTF-8 by construction, so this is an identity pass; it
/// exists so every field flows through the same chokepoint as the raw byte
/// paths, and it keeps the idempotence guarantee trivially checkable.
pub fn sanitize_str(s: &str) -> String {
    sanitize_bytes(s.as_bytes())
}

/// Cap a document at `max_chars`, replacing the tail with a marker when cut.
///
/// The marker counts against the cap, so a truncated document is exactly
/// `max_chars` characters long; caps too small to fit the marker degrade to
/// a bare cut. Counts characters, not bytes, so multi-byte content is never
/// split mid-scalar.
pub fn cap_document(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
