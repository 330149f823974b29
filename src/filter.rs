use crate::config::Config;
use crate::inspect::{MimeInspector, Verdict};
use crate::protocol::{ControlEvent, FilterPhase, Reply};
use crate::sanitize;
use crate::session::{lock, SessionStore};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Result of handling one control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Replies to send, in order, as one burst. May be empty.
    Dispatched(Vec<Reply>),
    /// Malformed or not ours; nothing to do.
    Dropped,
    /// Handling panicked; the message is the panic payload.
    Failed(String),
}

/// Decides whether a buffered message may pass.
pub trait MessageCheck: Send + Sync {
    fn check(&self, lines: &[Vec<u8>]) -> Verdict;
}

impl MessageCheck for MimeInspector {
    fn check(&self, lines: &[Vec<u8>]) -> Verdict {
        self.inspect(lines)
    }
}

/// Drives sessions and inspection from control-channel events.
pub struct FilterEngine {
    sessions: SessionStore,
    check: Box<dyn MessageCheck>,
    require_headers: bool,
}

impl FilterEngine {
    pub fn new<C: MessageCheck + 'static>(check: C) -> Self {
        FilterEngine {
            sessions: SessionStore::new(),
            check: Box::new(check),
            require_headers: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(MimeInspector::from_config(config)).with_require_headers(config.require_headers)
    }

    pub fn with_require_headers(mut self, enabled: bool) -> Self {
        self.require_headers = enabled;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Handle one inbound line (terminator already stripped). A panic while
    /// handling it is caught here and reported as `Failed`.
    pub fn handle_line(&self, line: &[u8]) -> EventOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(line))) {
            Ok(Some(replies)) => EventOutcome::Dispatched(replies),
            Ok(None) => EventOutcome::Dropped,
            Err(payload) => EventOutcome::Failed(panic_message(payload.as_ref())),
        }
    }

    fn dispatch(&self, line: &[u8]) -> Option<Vec<Reply>> {
        let Some(event) = ControlEvent::parse(line) else {
            log::debug!("Dropping malformed line: {}", sanitize::clean_bytes(line));
            return None;
        };

        match event {
            ControlEvent::Filter {
                phase: FilterPhase::DataLine,
                session_id,
                token,
                payload,
            } => Some(self.data_line(&session_id, &token, payload)),
            ControlEvent::Filter {
                phase: FilterPhase::Commit,
                session_id,
                token,
                ..
            } => Some(self.commit(&session_id, &token)),
            ControlEvent::Report {
                phase, session_id, ..
            } if phase == "link-disconnect" => {
                self.sessions.delete(&session_id);
                Some(Vec::new())
            }
            ControlEvent::Filter {
                phase: FilterPhase::Other(phase),
                ..
            }
            | ControlEvent::Report { phase, .. } => {
                log::debug!("Ignoring phase: {}", sanitize::clean(&phase));
                None
            }
            ControlEvent::Other { event } => {
                log::debug!("Ignoring event: {}", sanitize::clean(&event));
                None
            }
        }
    }

    fn data_line(&self, session_id: &str, token: &str, payload: &[u8]) -> Vec<Reply> {
        self.sessions.append_data_line(session_id, payload);
        vec![Reply::data_line(session_id, token, payload)]
    }

    fn commit(&self, session_id: &str, token: &str) -> Vec<Reply> {
        let sid = sanitize::clean(session_id);
        let session = self.sessions.get_or_create(session_id);

        let replies = {
            let session = lock(&session);
            match self.verdict(&session.lines) {
                Verdict::Accept => {
                    log::info!("[{sid}] Mail accepted.");
                    let mut replies = Vec::with_capacity(session.lines.len() + 2);
                    for line in &session.lines {
                        if line.starts_with(b".") {
                            let mut stuffed = Vec::with_capacity(line.len() + 1);
                            stuffed.push(b'.');
                            stuffed.extend_from_slice(line);
                            replies.push(Reply::data_line(session_id, token, &stuffed));
                        } else {
                            replies.push(Reply::data_line(session_id, token, line));
                        }
                    }
                    replies.push(Reply::data_line(session_id, token, b"."));
                    replies.push(Reply::proceed(session_id, token));
                    replies
                }
                Verdict::Reject(reason) => {
                    log::warn!("[{sid}] REJECTING: {reason}");
                    vec![Reply::reject(session_id, token, &reason)]
                }
            }
        };

        self.sessions.delete(session_id);
        replies
    }

    fn verdict(&self, lines: &[Vec<u8>]) -> Verdict {
        if self.require_headers && !lines.iter().any(|l| l.contains(&b':')) {
            return Verdict::reject("No valid headers");
        }
        self.check.check(lines)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
