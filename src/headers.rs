//! Header blocks and the media-type parameters found in them. Unfolding,
//! encoded words (RFC 2047) and parameter continuations (RFC 2231) are
//! handled by `mailparse`; only the header lines are ever handed to it.

use crate::decoder::TransferEncoding;
use crate::sanitize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("continuation line before the first header field")]
    LeadingContinuation,
    #[error("header line without colon: {0}")]
    MissingColon(String),
    #[error("invalid header field name: {0}")]
    InvalidName(String),
    #[error("malformed header block: {0}")]
    Malformed(String),
}

/// An unfolded header block. Field names are matched case-insensitively,
/// the first occurrence wins.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn parse(lines: &[Vec<u8>]) -> Result<Self, HeaderError> {
        let mut raw = Vec::with_capacity(lines.iter().map(|l| l.len() + 2).sum::<usize>() + 2);
        for (index, line) in lines.iter().enumerate() {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            check_line(line, index == 0)?;
            raw.extend_from_slice(line);
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");

        let (parsed, _) = mailparse::parse_headers(&raw)
            .map_err(|e| HeaderError::Malformed(sanitize::clean(&e.to_string())))?;

        let fields = parsed
            .iter()
            .map(|h| (h.get_key(), h.get_value().trim().to_string()))
            .collect();
        Ok(Headers { fields })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn content_type(&self) -> Option<MediaType> {
        self.get("content-type").and_then(MediaType::parse)
    }

    pub fn transfer_encoding(&self) -> TransferEncoding {
        TransferEncoding::from_header(self.get("content-transfer-encoding"))
    }

    /// Attachment filename: `Content-Disposition` `filename`, else the
    /// `Content-Type` `name` parameter. Encoded-words are decoded and any
    /// directory part is dropped.
    pub fn filename(&self) -> Option<String> {
        let raw = self
            .get("content-disposition")
            .map(mailparse::parse_content_disposition)
            .and_then(|d| d.params.get("filename").cloned())
            .filter(|f| !f.is_empty())
            .or_else(|| {
                self.content_type()
                    .and_then(|t| t.param("name").map(str::to_owned))
            })?;

        let decoded = decode_encoded_words(&raw);
        let base = decoded.rsplit(['/', '\\']).next().unwrap_or_default().trim();
        if base.is_empty() {
            None
        } else {
            Some(base.to_string())
        }
    }
}

// Structural checks mailparse is lenient about. A part failing them is a
// malformed part, not a part with odd headers.
fn check_line(line: &[u8], first: bool) -> Result<(), HeaderError> {
    if matches!(line.first(), Some(b' ') | Some(b'\t')) {
        return if first {
            Err(HeaderError::LeadingContinuation)
        } else {
            Ok(())
        };
    }
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return Err(HeaderError::MissingColon(sanitize::clean_bytes(line)));
    };
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| (33..=126).contains(&b)) {
        return Err(HeaderError::InvalidName(sanitize::clean_bytes(name)));
    }
    Ok(())
}

/// A parsed `Content-Type` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    essence: String,
    params: BTreeMap<String, String>,
}

impl MediaType {
    /// `None` when the type itself is not `token/token`. Malformed
    /// parameters are skipped rather than failing the whole value.
    pub fn parse(value: &str) -> Option<Self> {
        let head = value.split(';').next().unwrap_or_default().trim();
        let valid = match head.split_once('/') {
            Some((t, s)) => is_token(t) && is_token(s),
            None => false,
        };
        if !valid {
            return None;
        }

        let parsed = mailparse::parse_content_type(value);
        Some(MediaType {
            essence: head.to_ascii_lowercase(),
            params: parsed
                .params
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        })
    }

    pub fn essence(&self) -> &str {
        &self.essence
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_multipart(&self) -> bool {
        self.essence.starts_with("multipart/")
    }

    pub fn boundary(&self) -> Option<&str> {
        self.param("boundary").filter(|b| !b.is_empty())
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| (33..=126).contains(&b) && !b"()<>@,;:\\\"/[]?=".contains(&b))
}

/// Expand RFC 2047 encoded-words left in a parameter value. Whitespace
/// between two adjacent encoded-words is dropped.
pub fn decode_encoded_words(input: &str) -> String {
    if !input.contains("=?") {
        return input.to_string();
    }
    let mut raw = b"X: ".to_vec();
    raw.extend_from_slice(input.as_bytes());
    match mailparse::parse_header(&raw) {
        Ok((header, _)) => header.get_value(),
        Err(e) => {
            log::debug!("Leaving encoded words as they are: {e}");
            input.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<Vec<u8>> {
        text.lines().map(|l| l.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_parse_headers_with_continuation() {
        let headers = Headers::parse(&lines(
            "From: a@example.com\nContent-Type: multipart/mixed;\n\tboundary=\"XYZ\"\nSubject: hi",
        ))
        .unwrap();
        assert_eq!(headers.len(), 3);
        assert!(headers.get("content-type").unwrap().starts_with("multipart/mixed;"));
        assert_eq!(headers.content_type().unwrap().boundary(), Some("XYZ"));
        assert_eq!(headers.get("SUBJECT"), Some("hi"));
    }

    #[test]
    fn test_parse_headers_errors() {
        assert_eq!(
            Headers::parse(&lines(" leading: continuation")).unwrap_err(),
            HeaderError::LeadingContinuation
        );
        assert!(matches!(
            Headers::parse(&lines("From: a\nthis is not a header")),
            Err(HeaderError::MissingColon(_))
        ));
        assert!(matches!(
            Headers::parse(&lines("Bad Name: value")),
            Err(HeaderError::InvalidName(_))
        ));
        assert!(Headers::parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_media_type_parse() {
        let mt = MediaType::parse("Multipart/Mixed; Boundary=\"a b c\"; format=flowed").unwrap();
        assert_eq!(mt.essence(), "multipart/mixed");
        assert!(mt.is_multipart());
        assert_eq!(mt.boundary(), Some("a b c"));
        assert_eq!(mt.param("FORMAT"), Some("flowed"));
    }

    #[test]
    fn test_media_type_invalid() {
        assert!(MediaType::parse("").is_none());
        assert!(MediaType::parse("text/").is_none());
        assert!(MediaType::parse("attachment; filename=x").is_none());
        assert!(MediaType::parse("no spaces/allowed here").is_none());
    }

    #[test]
    fn test_media_type_skips_malformed_params() {
        let mt = MediaType::parse("multipart/mixed; junk; boundary=abc").unwrap();
        assert_eq!(mt.boundary(), Some("abc"));
    }

    #[test]
    fn test_rfc2231_extended_and_continued() {
        let headers = Headers::parse(&lines(
            "Content-Disposition: attachment; filename*=utf-8''%E2%82%AC%20rates.pdf",
        ))
        .unwrap();
        assert_eq!(headers.filename().as_deref(), Some("\u{20ac} rates.pdf"));

        let headers = Headers::parse(&lines(
            "Content-Disposition: attachment; filename*0*=utf-8''very%20; filename*1=long.exe",
        ))
        .unwrap();
        assert_eq!(headers.filename().as_deref(), Some("very long.exe"));
    }

    #[test]
    fn test_decode_encoded_words() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?cmVwb3J0LnBkZg==?="), "report.pdf");
        assert_eq!(decode_encoded_words("=?iso-8859-1?Q?caf=E9_au_lait?="), "caf\u{e9} au lait");
        assert_eq!(
            decode_encoded_words("=?utf-8?Q?in?= =?utf-8?Q?voice.exe?="),
            "invoice.exe"
        );
        assert_eq!(decode_encoded_words("=?koi8-r?B?8NLJ18XULnR4dA==?="), "Привет.txt");
        assert_eq!(decode_encoded_words("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_filename_sources() {
        let headers = Headers::parse(&lines(
            "Content-Type: application/octet-stream; name=\"fallback.bin\"\nContent-Disposition: attachment; filename=\"=?utf-8?B?ZXZpbC5leGU=?=\"",
        ))
        .unwrap();
        assert_eq!(headers.filename().as_deref(), Some("evil.exe"));

        let headers = Headers::parse(&lines(
            "Content-Type: application/octet-stream; name=\"C:\\temp\\fallback.bin\"",
        ))
        .unwrap();
        assert_eq!(headers.filename().as_deref(), Some("fallback.bin"));

        let headers = Headers::parse(&lines("Content-Type: text/plain")).unwrap();
        assert_eq!(headers.filename(), None);
    }

    #[test]
    fn test_transfer_encoding_from_headers() {
        let headers = Headers::parse(&lines("Content-Transfer-Encoding:  Base64 ")).unwrap();
        assert_eq!(headers.transfer_encoding(), TransferEncoding::Base64);
        assert_eq!(Headers::default().transfer_encoding(), TransferEncoding::Identity);
    }
}
