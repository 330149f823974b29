use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::io::{self, BufRead, Read};

// Standard alphabet, lenient about non-zero trailing bits the way most mail
// clients are.
const BASE64_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

const CHUNK_SIZE: usize = 3072;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    Identity,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    /// Map a `Content-Transfer-Encoding` value. Anything unrecognised
    /// (7bit, 8bit, binary, garbage) is passed through unchanged.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "base64" => TransferEncoding::Base64,
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            _ => TransferEncoding::Identity,
        }
    }

    pub fn from_header(value: Option<&str>) -> Self {
        value.map(Self::parse).unwrap_or(TransferEncoding::Identity)
    }

    /// Wrap a raw content stream with the matching decoding layer.
    pub fn decode<'a, R: BufRead + 'a>(self, reader: R) -> Box<dyn Read + 'a> {
        match self {
            TransferEncoding::Identity => Box::new(reader),
            TransferEncoding::Base64 => Box::new(Base64Decoder::new(reader)),
            TransferEncoding::QuotedPrintable => Box::new(QuotedPrintableDecoder::new(reader)),
        }
    }
}

/// Streaming base64 decoder.
///
/// Whitespace and line breaks are skipped. Decoding ends at the first byte
/// outside the alphabet or after a padded quantum; everything decoded from
/// complete quanta before that point is still returned, a trailing partial
/// quantum is dropped.
pub struct Base64Decoder<R> {
    inner: R,
    quantum: [u8; 4],
    quantum_len: usize,
    encoded: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> Base64Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            quantum: [0; 4],
            quantum_len: 0,
            encoded: Vec::with_capacity(CHUNK_SIZE),
            decoded: Vec::with_capacity(CHUNK_SIZE),
            pos: 0,
            finished: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.decoded.clear();
        self.encoded.clear();
        self.pos = 0;

        let mut chunk = [0u8; CHUNK_SIZE];
        let n = match self.inner.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };
        if n == 0 {
            self.finished = true;
            return Ok(());
        }

        for &b in &chunk[..n] {
            if b.is_ascii_whitespace() {
                continue;
            }
            if !is_base64_byte(b) {
                self.finished = true;
                break;
            }
            self.quantum[self.quantum_len] = b;
            self.quantum_len += 1;
            if self.quantum_len < 4 {
                continue;
            }
            self.quantum_len = 0;
            match padding(&self.quantum) {
                Some(0) => self.encoded.extend_from_slice(&self.quantum),
                Some(_) => {
                    self.encoded.extend_from_slice(&self.quantum);
                    self.finished = true;
                    break;
                }
                None => {
                    self.finished = true;
                    break;
                }
            }
        }

        if !self.encoded.is_empty() {
            BASE64_LENIENT
                .decode_vec(&self.encoded, &mut self.decoded)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Ok(())
    }
}

impl<R: Read> Read for Base64Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.decoded.len() {
            if self.finished {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = buf.len().min(self.decoded.len() - self.pos);
        buf[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn is_base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}

/// Number of padding characters in a complete quantum, or `None` when `=`
/// sits somewhere padding cannot.
fn padding(quantum: &[u8; 4]) -> Option<usize> {
    match (quantum[0], quantum[1], quantum[2], quantum[3]) {
        (b'=', _, _, _) | (_, b'=', _, _) => None,
        (_, _, b'=', b'=') => Some(2),
        (_, _, b'=', _) => None,
        (_, _, _, b'=') => Some(1),
        _ => Some(0),
    }
}

/// Streaming quoted-printable decoder, one encoded line at a time.
pub struct QuotedPrintableDecoder<R> {
    inner: R,
    line: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: BufRead> QuotedPrintableDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
            decoded: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.line.clear();
        self.decoded.clear();
        self.pos = 0;

        let n = self.inner.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            self.finished = true;
            return Ok(());
        }
        decode_qp_line(&self.line, &mut self.decoded);
        Ok(())
    }
}

impl<R: BufRead> Read for QuotedPrintableDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.decoded.len() {
            if self.finished {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = buf.len().min(self.decoded.len() - self.pos);
        buf[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn decode_qp_line(raw: &[u8], out: &mut Vec<u8>) {
    let ending: &[u8] = if raw.ends_with(b"\r\n") {
        b"\r\n"
    } else if raw.ends_with(b"\n") {
        b"\n"
    } else {
        b""
    };

    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b' ' | b'\t' | b'\r' | b'\n') {
        end -= 1;
    }
    let mut line = &raw[..end];
    let soft_break = line.last() == Some(&b'=');
    if soft_break {
        line = &line[..line.len() - 1];
    }

    match quoted_printable::decode(line, quoted_printable::ParseMode::Robust) {
        Ok(bytes) => out.extend_from_slice(&bytes),
        Err(e) => {
            log::debug!("Undecodable quoted-printable line kept as is: {e}");
            out.extend_from_slice(line);
        }
    }
    if !soft_break {
        out.extend_from_slice(ending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode_all(encoding: TransferEncoding, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encoding
            .decode(Cursor::new(input.to_vec()))
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_parse_encoding_names() {
        assert_eq!(TransferEncoding::parse("base64"), TransferEncoding::Base64);
        assert_eq!(TransferEncoding::parse("  BASE64 "), TransferEncoding::Base64);
        assert_eq!(
            TransferEncoding::parse("Quoted-Printable"),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(TransferEncoding::parse("7bit"), TransferEncoding::Identity);
        assert_eq!(TransferEncoding::parse("x-uuencode"), TransferEncoding::Identity);
        assert_eq!(TransferEncoding::from_header(None), TransferEncoding::Identity);
    }

    #[test]
    fn test_identity_passthrough() {
        assert_eq!(
            decode_all(TransferEncoding::Identity, b"\x89PNG\r\n\x1a\n"),
            b"\x89PNG\r\n\x1a\n"
        );
    }

    #[test]
    fn test_base64_across_lines() {
        // "%PDF-1.7 test" split over several lines
        let input = b"JVBE\nRi0xLjcg\r\ndGVzdA==\n";
        assert_eq!(decode_all(TransferEncoding::Base64, input), b"%PDF-1.7 test");
    }

    #[test]
    fn test_base64_stops_at_invalid_byte() {
        // Complete quanta before the '.' are kept, the partial one is dropped
        let out = decode_all(TransferEncoding::Base64, b"TVqQAAMAAAAEAAAA//8AALg...");
        assert_eq!(&out[..2], b"MZ");
        assert_eq!(out.len(), 15);
    }

    #[test]
    fn test_base64_stops_after_padding() {
        let out = decode_all(TransferEncoding::Base64, b"TQ==TWFu");
        assert_eq!(out, b"M");
    }

    #[test]
    fn test_base64_trailing_bits_tolerated() {
        assert_eq!(decode_all(TransferEncoding::Base64, b"TR=="), b"M");
    }

    #[test]
    fn test_base64_large_input_in_small_reads() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&payload);
        let wrapped: Vec<u8> = encoded
            .as_bytes()
            .chunks(76)
            .flat_map(|c| c.iter().copied().chain(std::iter::once(b'\n')))
            .collect();

        let mut reader = TransferEncoding::Base64.decode(Cursor::new(wrapped));
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn test_quoted_printable_escapes_and_soft_breaks() {
        let input = b"caf=C3=A9 =\nau lait=20\nnext=3d";
        assert_eq!(
            decode_all(TransferEncoding::QuotedPrintable, input),
            "caf\u{e9} au lait \nnext=".as_bytes()
        );
    }

    #[test]
    fn test_quoted_printable_invalid_escape_passthrough() {
        let input = b"a=ZZb\r\n";
        assert_eq!(decode_all(TransferEncoding::QuotedPrintable, input), b"a=ZZb\r\n");
    }

    #[test]
    fn test_quoted_printable_binary_signature() {
        let input = b"=89PNG=0D=0A=1A=0A";
        assert_eq!(
            decode_all(TransferEncoding::QuotedPrintable, input),
            b"\x89PNG\r\n\x1a\n"
        );
    }
}
