/// Replacement for every byte that may not reach a reply or a log line.
pub const REPLACEMENT: char = '?';

/// Make an untrusted value safe to echo into a protocol reply or a log line.
///
/// Every byte outside printable ASCII (0x20..=0x7E) and the field separator
/// `|` is replaced with `?`. Works on bytes, so a multi-byte UTF-8 character
/// turns into one `?` per byte.
pub fn clean(s: &str) -> String {
    clean_bytes(s.as_bytes())
}

pub fn clean_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if (0x20..=0x7e).contains(&b) && b != b'|' {
                b as char
            } else {
                REPLACEMENT
            }
        })
        .collect()
}
