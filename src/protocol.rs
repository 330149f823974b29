//! Wire format of the OpenSMTPD filter protocol.
//!
//! Inbound lines look like
//! `<event>|<version>|<timestamp>|<subsystem>|<phase>|<session-id>|<token>|<payload>`
//! where the payload itself may contain `|`. Replies are
//! `<reply-type>|<session-id>|<token>|<body>`.

/// Sent once at startup, before any input is read.
pub const REGISTRATIONS: [&str; 4] = [
    "register|filter|smtp-in|data-line",
    "register|filter|smtp-in|commit",
    "register|report|smtp-in|link-disconnect",
    "register|ready",
];

pub const REJECT_PREFIX: &str = "550 Policy violation: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPhase {
    DataLine,
    Commit,
    Other(String),
}

impl FilterPhase {
    fn parse(phase: &str) -> Self {
        match phase {
            "data-line" => FilterPhase::DataLine,
            "commit" => FilterPhase::Commit,
            other => FilterPhase::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent<'a> {
    Report {
        phase: String,
        session_id: String,
        params: &'a [u8],
    },
    Filter {
        phase: FilterPhase,
        session_id: String,
        token: String,
        payload: &'a [u8],
    },
    /// A well-formed line of an event type this filter does not handle.
    Other { event: String },
}

fn field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl<'a> ControlEvent<'a> {
    /// Decode one line, without its line terminator. `None` for lines too
    /// short to act on.
    pub fn parse(line: &'a [u8]) -> Option<Self> {
        let fields: Vec<&'a [u8]> = line.splitn(8, |&b| b == b'|').collect();
        if fields.len() < 3 {
            return None;
        }

        match fields[0] {
            b"report" => {
                if fields.len() < 6 {
                    return None;
                }
                let params: &'a [u8] = match fields.len() {
                    7 => fields[6],
                    8 => {
                        // Everything after the sixth separator, untouched
                        let start = line.len() - fields[6].len() - fields[7].len() - 1;
                        &line[start..]
                    }
                    _ => &[],
                };
                Some(ControlEvent::Report {
                    phase: field(fields[4]),
                    session_id: field(fields[5]),
                    params,
                })
            }
            b"filter" => {
                if fields.len() < 6 {
                    return None;
                }
                let phase = FilterPhase::parse(&String::from_utf8_lossy(fields[4]));
                if phase == FilterPhase::DataLine && fields.len() < 8 {
                    return None;
                }
                Some(ControlEvent::Filter {
                    phase,
                    session_id: field(fields[5]),
                    token: fields.get(6).map(|t| field(t)).unwrap_or_default(),
                    payload: fields.get(7).copied().unwrap_or_default(),
                })
            }
            other => Some(ControlEvent::Other { event: field(other) }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    /// Carries the already sanitized reason.
    Reject(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    DataLine {
        session_id: String,
        token: String,
        line: Vec<u8>,
    },
    Result {
        session_id: String,
        token: String,
        decision: Decision,
    },
}

impl Reply {
    pub fn data_line(session_id: &str, token: &str, line: &[u8]) -> Self {
        Reply::DataLine {
            session_id: session_id.to_string(),
            token: token.to_string(),
            line: line.to_vec(),
        }
    }

    pub fn proceed(session_id: &str, token: &str) -> Self {
        Reply::Result {
            session_id: session_id.to_string(),
            token: token.to_string(),
            decision: Decision::Proceed,
        }
    }

    pub fn reject(session_id: &str, token: &str, reason: &str) -> Self {
        Reply::Result {
            session_id: session_id.to_string(),
            token: token.to_string(),
            decision: Decision::Reject(reason.to_string()),
        }
    }

    /// The reply as written to the control channel, without line terminator.
    pub fn to_line(&self) -> Vec<u8> {
        match self {
            Reply::DataLine {
                session_id,
                token,
                line,
            } => {
                let mut out = format!("filter-dataline|{}|{}|", session_id, token).into_bytes();
                out.extend_from_slice(line);
                out
            }
            Reply::Result {
                session_id,
                token,
                decision: Decision::Proceed,
            } => format!("filter-result|{}|{}|proceed", session_id, token).into_bytes(),
            Reply::Result {
                session_id,
                token,
                decision: Decision::Reject(reason),
            } => format!(
                "filter-result|{}|{}|reject|{}{}",
                session_id, token, REJECT_PREFIX, reason
            )
            .into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_line_keeps_pipes_in_payload() {
        let line = b"filter|0.7|1576146008.006099|smtp-in|data-line|7641df9771b4ed00|1ef1c203cc576e5d|a|b||c";
        match ControlEvent::parse(line).unwrap() {
            ControlEvent::Filter {
                phase,
                session_id,
                token,
                payload,
            } => {
                assert_eq!(phase, FilterPhase::DataLine);
                assert_eq!(session_id, "7641df9771b4ed00");
                assert_eq!(token, "1ef1c203cc576e5d");
                assert_eq!(payload, b"a|b||c");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_data_line_empty_payload() {
        let event = ControlEvent::parse(b"filter|0.7|1|smtp-in|data-line|sid|tok|").unwrap();
        assert!(matches!(event, ControlEvent::Filter { payload, .. } if payload.is_empty()));
        assert_eq!(ControlEvent::parse(b"filter|0.7|1|smtp-in|data-line|sid|tok"), None);
    }

    #[test]
    fn test_parse_commit_without_token() {
        match ControlEvent::parse(b"filter|0.7|1|smtp-in|commit|sid").unwrap() {
            ControlEvent::Filter {
                phase,
                session_id,
                token,
                ..
            } => {
                assert_eq!(phase, FilterPhase::Commit);
                assert_eq!(session_id, "sid");
                assert_eq!(token, "");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_report() {
        let event = ControlEvent::parse(b"report|0.7|1|smtp-in|link-disconnect|sid").unwrap();
        assert_eq!(
            event,
            ControlEvent::Report {
                phase: "link-disconnect".to_string(),
                session_id: "sid".to_string(),
                params: b"",
            }
        );

        let event =
            ControlEvent::parse(b"report|0.7|1|smtp-in|link-connect|sid|rdns|fcrdns|1.2.3.4:25")
                .unwrap();
        assert!(matches!(
            event,
            ControlEvent::Report { params, .. } if params == b"rdns|fcrdns|1.2.3.4:25"
        ));
    }

    #[test]
    fn test_parse_short_and_unknown_lines() {
        assert_eq!(ControlEvent::parse(b""), None);
        assert_eq!(ControlEvent::parse(b"filter|0.7"), None);
        assert_eq!(ControlEvent::parse(b"report|0.7|1|smtp-in"), None);
        assert_eq!(ControlEvent::parse(b"filter|0.7|1|smtp-in|commit"), None);
        assert_eq!(
            ControlEvent::parse(b"config|subsystem|smtp-in"),
            Some(ControlEvent::Other {
                event: "config".to_string()
            })
        );
    }

    #[test]
    fn test_reply_lines() {
        assert_eq!(
            Reply::data_line("sid", "tok", b"..dotted").to_line(),
            b"filter-dataline|sid|tok|..dotted"
        );
        assert_eq!(Reply::proceed("sid", "tok").to_line(), b"filter-result|sid|tok|proceed");
        assert_eq!(
            Reply::reject("sid", "", "Forbidden MIME type: application/zip").to_line(),
            b"filter-result|sid||reject|550 Policy violation: Forbidden MIME type: application/zip"
        );
    }
}
