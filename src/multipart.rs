//! Lazy walk over the parts of a buffered multipart body.
//!
//! Everything here borrows the session's stored lines. Part content is
//! exposed through [`LineReader`], which hands out each stored line followed
//! by `\n` without ever joining them into one buffer.

use crate::decoder::TransferEncoding;
use crate::headers::{HeaderError, Headers, MediaType};
use std::io::{self, BufRead, Read};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartError {
    #[error("part header is not terminated by an empty line")]
    UnterminatedHeader,
    #[error("invalid part header: {0}")]
    Header(#[from] HeaderError),
}

fn is_blank(line: &[u8]) -> bool {
    line.is_empty() || line == b"\r"
}

/// Split an entity at its first empty line into header lines and body lines.
/// `None` when there is no empty line.
pub fn split_entity(lines: &[Vec<u8>]) -> Option<(&[Vec<u8>], &[Vec<u8>])> {
    let blank = lines.iter().position(|l| is_blank(l))?;
    Some((&lines[..blank], &lines[blank + 1..]))
}

/// Pull-based reader over stored lines, yielding each line plus `\n`.
///
/// With `terminate_last` unset the final line is yielded without its line
/// break, which is how a part's content ends right before a delimiter.
#[derive(Debug, Clone)]
pub struct LineReader<'a> {
    lines: &'a [Vec<u8>],
    index: usize,
    offset: usize,
    terminate_last: bool,
}

impl<'a> LineReader<'a> {
    pub fn new(lines: &'a [Vec<u8>], terminate_last: bool) -> Self {
        Self {
            lines,
            index: 0,
            offset: 0,
            terminate_last,
        }
    }
}

impl BufRead for LineReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        let lines = self.lines;
        loop {
            let Some(line) = lines.get(self.index) else {
                return Ok(&[]);
            };
            if self.offset < line.len() {
                return Ok(&line[self.offset..]);
            }
            let last = self.index + 1 == lines.len();
            if self.offset == line.len() && (!last || self.terminate_last) {
                return Ok(b"\n");
            }
            self.index += 1;
            self.offset = 0;
        }
    }

    fn consume(&mut self, amt: usize) {
        self.offset += amt;
    }
}

impl Read for LineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

/// One part of a multipart body, borrowing its content lines.
#[derive(Debug, Clone)]
pub struct MimePart<'a> {
    pub headers: Headers,
    pub filename: Option<String>,
    pub transfer_encoding: TransferEncoding,
    /// Declared type, used only to find nested structure.
    pub content_type: Option<MediaType>,
    body: &'a [Vec<u8>],
    terminated: bool,
}

impl<'a> MimePart<'a> {
    pub fn new(headers: Headers, body: &'a [Vec<u8>], terminated: bool) -> Self {
        Self {
            filename: headers.filename(),
            transfer_encoding: headers.transfer_encoding(),
            content_type: headers.content_type(),
            headers,
            body,
            terminated,
        }
    }

    pub fn body(&self) -> &'a [Vec<u8>] {
        self.body
    }

    pub fn raw_reader(&self) -> LineReader<'a> {
        LineReader::new(self.body, self.terminated)
    }

    /// Content with the declared transfer encoding undone.
    pub fn decoded_reader(&self) -> Box<dyn Read + 'a> {
        self.transfer_encoding.decode(self.raw_reader())
    }

    /// The message carried by a `message/rfc822` part, if its header parses.
    pub fn embedded_message(&self) -> Option<MimePart<'a>> {
        let (head, body) = split_entity(self.body)?;
        if head.is_empty() {
            return None;
        }
        let headers = Headers::parse(head).ok()?;
        Some(MimePart::new(headers, body, self.terminated))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Open,
    Close,
}

/// Iterator over the parts of a multipart body, in wire order.
///
/// The preamble before the first delimiter and the epilogue after the close
/// delimiter are ignored. A missing close delimiter ends the last part at the
/// end of input.
pub struct MultipartWalker<'a> {
    lines: &'a [Vec<u8>],
    dash_boundary: Vec<u8>,
    pos: usize,
    started: bool,
    done: bool,
}

impl<'a> MultipartWalker<'a> {
    pub fn new(lines: &'a [Vec<u8>], boundary: &str) -> Self {
        let mut dash_boundary = Vec::with_capacity(boundary.len() + 2);
        dash_boundary.extend_from_slice(b"--");
        dash_boundary.extend_from_slice(boundary.as_bytes());
        Self {
            lines,
            dash_boundary,
            pos: 0,
            started: false,
            done: false,
        }
    }

    fn delimiter(&self, line: &[u8]) -> Option<Delimiter> {
        let rest = line.strip_prefix(self.dash_boundary.as_slice())?;
        let (kind, tail) = match rest.strip_prefix(b"--") {
            Some(tail) => (Delimiter::Close, tail),
            None => (Delimiter::Open, rest),
        };
        if tail.iter().all(|&b| matches!(b, b' ' | b'\t' | b'\r')) {
            Some(kind)
        } else {
            None
        }
    }

    fn next_delimiter(&self, from: usize) -> Option<(usize, Delimiter)> {
        self.lines[from..]
            .iter()
            .enumerate()
            .find_map(|(i, line)| self.delimiter(line).map(|d| (from + i, d)))
    }
}

impl<'a> Iterator for MultipartWalker<'a> {
    type Item = Result<MimePart<'a>, PartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.started {
            self.started = true;
            match self.next_delimiter(0) {
                Some((index, Delimiter::Open)) => self.pos = index + 1,
                _ => {
                    self.done = true;
                    return None;
                }
            }
        }

        if self.pos >= self.lines.len() {
            self.done = true;
            return None;
        }

        let start = self.pos;
        let (end, terminated) = match self.next_delimiter(start) {
            Some((index, Delimiter::Open)) => {
                self.pos = index + 1;
                (index, false)
            }
            Some((index, Delimiter::Close)) => {
                self.done = true;
                (index, false)
            }
            None => {
                self.done = true;
                (self.lines.len(), true)
            }
        };
        let lines = &self.lines[start..end];

        let Some((head, body)) = split_entity(lines) else {
            return Some(Err(PartError::UnterminatedHeader));
        };
        Some(
            Headers::parse(head)
                .map(|headers| MimePart::new(headers, body, terminated))
                .map_err(PartError::from),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<Vec<u8>> {
        text.lines().map(|l| l.as_bytes().to_vec()).collect()
    }

    fn read_all(mut reader: impl Read) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_line_reader_terminators() {
        let stored = lines("one\ntwo\n\nthree");
        assert_eq!(read_all(LineReader::new(&stored, true)), b"one\ntwo\n\nthree\n");
        assert_eq!(read_all(LineReader::new(&stored, false)), b"one\ntwo\n\nthree");
        assert_eq!(read_all(LineReader::new(&[], true)), b"");
    }

    #[test]
    fn test_line_reader_buf_read_lines() {
        let stored = lines("alpha\nbeta");
        let reader = LineReader::new(&stored, true);
        let collected: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();
        assert_eq!(collected, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_walk_parts_in_order() {
        let body = lines(
            "preamble\n--b1\nContent-Type: text/plain\n\nhello\nworld\n--b1\nContent-Disposition: attachment; filename=a.bin\nContent-Transfer-Encoding: base64\n\nAAEC\n--b1--\nepilogue",
        );
        let parts: Vec<_> = MultipartWalker::new(&body, "b1").map(|p| p.unwrap()).collect();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].filename, None);
        assert_eq!(read_all(parts[0].raw_reader()), b"hello\nworld");

        assert_eq!(parts[1].filename.as_deref(), Some("a.bin"));
        assert_eq!(parts[1].transfer_encoding, TransferEncoding::Base64);
        assert_eq!(read_all(parts[1].decoded_reader()), vec![0u8, 1, 2]);
    }

    #[test]
    fn test_walk_tolerates_missing_close_and_crlf() {
        let body = lines("--b1 \r\nContent-Type: text/plain\r\n\r\nlast line");
        let parts: Vec<_> = MultipartWalker::new(&body, "b1").collect();
        assert_eq!(parts.len(), 1);
        let part = parts[0].as_ref().unwrap();
        assert_eq!(read_all(part.raw_reader()), b"last line\n");
    }

    #[test]
    fn test_walk_without_delimiter_yields_nothing() {
        let body = lines("just text\n--other\n");
        assert_eq!(MultipartWalker::new(&body, "b1").count(), 0);
        let body = lines("--b1--\n");
        assert_eq!(MultipartWalker::new(&body, "b1").count(), 0);
    }

    #[test]
    fn test_delimiter_requires_exact_boundary() {
        let body = lines("--b1\n\n--b1x\n--b1 trailing\n--b1--");
        let parts: Vec<_> = MultipartWalker::new(&body, "b1").map(|p| p.unwrap()).collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(read_all(parts[0].raw_reader()), b"--b1x\n--b1 trailing");
    }

    #[test]
    fn test_malformed_part_does_not_stop_the_walk() {
        let body = lines("--b1\nnot a header\n\nx\n--b1\nContent-Type: text/plain\n\ny\n--b1--");
        let parts: Vec<_> = MultipartWalker::new(&body, "b1").collect();
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], Err(PartError::Header(_))));
        assert!(parts[1].is_ok());

        let body = lines("--b1\nContent-Type: text/plain\n--b1--");
        let parts: Vec<_> = MultipartWalker::new(&body, "b1").collect();
        assert!(matches!(parts[0], Err(PartError::UnterminatedHeader)));
    }

    #[test]
    fn test_empty_part_body() {
        let body = lines("--b1\nContent-Type: text/plain\n\n--b1--");
        let parts: Vec<_> = MultipartWalker::new(&body, "b1").map(|p| p.unwrap()).collect();
        assert_eq!(read_all(parts[0].raw_reader()), b"");
    }

    #[test]
    fn test_embedded_message() {
        let body = lines(
            "--b1\nContent-Type: message/rfc822\n\nSubject: inner\nContent-Type: text/plain\n\ninner body\n--b1--",
        );
        let part = MultipartWalker::new(&body, "b1").next().unwrap().unwrap();
        let inner = part.embedded_message().unwrap();
        assert_eq!(inner.headers.get("subject"), Some("inner"));
        assert_eq!(read_all(inner.raw_reader()), b"inner body");
    }
}
