pub mod config;
pub mod control;
pub mod decoder;
pub mod filter;
pub mod headers;
pub mod inspect;
pub mod multipart;
pub mod output;
pub mod protocol;
pub mod sanitize;
pub mod session;
pub mod sniff;

pub use config::Config;
pub use filter::{EventOutcome, FilterEngine, MessageCheck};
pub use inspect::{MalformedPartPolicy, MimeInspector, Verdict, Whitelist};
pub use output::OutputSender;
pub use session::{Session, SessionStore};
