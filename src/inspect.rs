use crate::config::Config;
use crate::decoder::TransferEncoding;
use crate::headers::Headers;
use crate::multipart::{split_entity, MimePart, MultipartWalker};
use crate::sanitize;
use crate::sniff;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::ops::ControlFlow;

pub const DEFAULT_HEADER_INSPECT_SIZE: usize = 512;
const DRAIN_CHUNK: usize = 4096;
const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

impl Verdict {
    /// Build a rejection; the reason is sanitized here so it can be placed
    /// into a reply or a log line as is.
    pub fn reject(reason: &str) -> Self {
        Verdict::Reject(sanitize::clean(reason))
    }
}

/// Set of permitted MIME types, stored and queried in lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    types: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            types: types
                .into_iter()
                .map(|t| t.as_ref().trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, mime_type: &str) -> bool {
        self.types.contains(&mime_type.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn sorted(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.types.iter().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// What to do with a multipart part whose header cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPartPolicy {
    /// Log it and continue with the next part.
    #[default]
    Skip,
    /// Stop inspecting; the message is accepted.
    Abort,
}

enum Halt {
    Reject(String),
    Abort,
}

/// Decides whether a buffered message may pass, from the sniffed types of
/// its parts.
#[derive(Debug, Clone)]
pub struct MimeInspector {
    whitelist: Whitelist,
    header_inspect_size: usize,
    max_inspect_bytes: u64,
    malformed_parts: MalformedPartPolicy,
    inspect_single_part: bool,
}

impl MimeInspector {
    pub fn new(whitelist: Whitelist) -> Self {
        Self {
            whitelist,
            header_inspect_size: DEFAULT_HEADER_INSPECT_SIZE,
            max_inspect_bytes: 0,
            malformed_parts: MalformedPartPolicy::Skip,
            inspect_single_part: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.whitelist())
            .with_header_inspect_size(config.header_inspect_size())
            .with_max_inspect_bytes(config.max_inspect_bytes())
            .with_malformed_parts(config.malformed_parts)
            .with_single_part(config.inspect_single_part)
    }

    pub fn with_header_inspect_size(mut self, size: usize) -> Self {
        self.header_inspect_size = if size == 0 {
            DEFAULT_HEADER_INSPECT_SIZE
        } else {
            size
        };
        self
    }

    pub fn with_max_inspect_bytes(mut self, max: u64) -> Self {
        self.max_inspect_bytes = max;
        self
    }

    pub fn with_malformed_parts(mut self, policy: MalformedPartPolicy) -> Self {
        self.malformed_parts = policy;
        self
    }

    pub fn with_single_part(mut self, enabled: bool) -> Self {
        self.inspect_single_part = enabled;
        self
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Inspect a whole message, header block included. Mail whose header
    /// cannot be parsed is accepted.
    pub fn inspect(&self, lines: &[Vec<u8>]) -> Verdict {
        let empty: &[Vec<u8>] = &[];
        let (head, body) = split_entity(lines).unwrap_or((lines, empty));
        if head.is_empty() {
            log::debug!("Message has no header block, accepting");
            return Verdict::Accept;
        }
        let headers = match Headers::parse(head) {
            Ok(headers) => headers,
            Err(e) => {
                log::debug!("Unparsable message header, accepting: {e}");
                return Verdict::Accept;
            }
        };
        let message = MimePart::new(headers, body, true);

        let flow = match message
            .content_type
            .as_ref()
            .filter(|ct| ct.is_multipart())
            .and_then(|ct| ct.boundary())
        {
            Some(boundary) => match self.walk(body, boundary, 0) {
                ControlFlow::Break(halt) => ControlFlow::Break(halt),
                ControlFlow::Continue(_) => ControlFlow::Continue(()),
            },
            None if self.inspect_single_part => self.check_single_part(&message),
            None => ControlFlow::Continue(()),
        };

        match flow {
            ControlFlow::Break(Halt::Reject(reason)) => Verdict::reject(&reason),
            ControlFlow::Break(Halt::Abort) | ControlFlow::Continue(()) => Verdict::Accept,
        }
    }

    /// Check every part of one multipart body; yields the number of parts seen.
    fn walk(&self, body: &[Vec<u8>], boundary: &str, depth: usize) -> ControlFlow<Halt, usize> {
        let mut seen = 0;
        for part in MultipartWalker::new(body, boundary) {
            let part = match part {
                Ok(part) => part,
                Err(e) => match self.malformed_parts {
                    MalformedPartPolicy::Skip => {
                        log::debug!("Skipping malformed part: {e}");
                        continue;
                    }
                    MalformedPartPolicy::Abort => {
                        log::debug!("Malformed part, ending inspection: {e}");
                        return ControlFlow::Break(Halt::Abort);
                    }
                },
            };
            seen += 1;
            self.check_part(&part, depth)?;
        }
        ControlFlow::Continue(seen)
    }

    fn check_part(&self, part: &MimePart<'_>, depth: usize) -> ControlFlow<Halt> {
        let container = part.filename.is_none()
            && part.transfer_encoding == TransferEncoding::Identity
            && depth < MAX_DEPTH;

        if container {
            if let Some(ct) = &part.content_type {
                if let (true, Some(boundary)) = (ct.is_multipart(), ct.boundary()) {
                    if self.walk(part.body(), boundary, depth + 1)? > 0 {
                        return ControlFlow::Continue(());
                    }
                } else if ct.essence() == "message/rfc822" {
                    if let Some(inner) = part.embedded_message() {
                        return self.check_part(&inner, depth + 1);
                    }
                }
            }
        }

        self.check_leaf(part)
    }

    /// A message that is not multipart. Only the sniffed type counts here:
    /// text passes, anything else has to be whitelisted.
    fn check_single_part(&self, message: &MimePart<'_>) -> ControlFlow<Halt> {
        let mut reader = message.decoded_reader();
        let window = read_window(reader.as_mut(), self.header_inspect_size);
        let detected = sniff::essence(sniff::classify(&window));

        if !detected.starts_with("text/") && !self.whitelist.contains(&detected) {
            return ControlFlow::Break(Halt::Reject(format!("Forbidden MIME type: {detected}")));
        }

        log::debug!("Allowed single-part body: type={}", sanitize::clean(&detected));
        self.drain(reader.as_mut(), window.len() as u64);
        ControlFlow::Continue(())
    }

    fn check_leaf(&self, part: &MimePart<'_>) -> ControlFlow<Halt> {
        let mut reader = part.decoded_reader();
        let window = read_window(reader.as_mut(), self.header_inspect_size);

        if window.is_empty() && part.filename.is_none() {
            log::debug!("Skipping empty part without filename");
            return ControlFlow::Continue(());
        }

        let detected = sniff::essence(sniff::classify(&window));
        let enforced = part.filename.is_some() || !detected.starts_with("text/");

        if enforced && !self.whitelist.contains(&detected) {
            let reason = format!(
                "Forbidden MIME type: {} (File: {})",
                detected,
                part.filename.as_deref().unwrap_or_default()
            );
            return ControlFlow::Break(Halt::Reject(reason));
        }

        log::debug!(
            "Allowed part: type={} file={}",
            sanitize::clean(&detected),
            sanitize::clean(part.filename.as_deref().unwrap_or("-"))
        );

        self.drain(reader.as_mut(), window.len() as u64);
        ControlFlow::Continue(())
    }

    /// Keep consuming decoded content up to `max_inspect_bytes`, in fixed
    /// chunks, so a bounded amount is ever held at once.
    fn drain(&self, reader: &mut dyn Read, already: u64) {
        let mut remaining = self.max_inspect_bytes.saturating_sub(already);
        let mut chunk = [0u8; DRAIN_CHUNK];
        while remaining > 0 {
            let want = remaining.min(DRAIN_CHUNK as u64) as usize;
            match reader.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => remaining -= n as u64,
                Err(e) => {
                    log::debug!("Read error while draining part: {e}");
                    break;
                }
            }
        }
    }
}

/// Up to `size` leading bytes. A read error ends the window early.
fn read_window(reader: &mut dyn Read, size: usize) -> Vec<u8> {
    let mut window = Vec::with_capacity(size);
    if let Err(e) = reader.take(size as u64).read_to_end(&mut window) {
        log::debug!("Read error while sniffing part: {e}");
    }
    window
}
