use crate::filter::{EventOutcome, FilterEngine};
use crate::output::OutputSender;
use crate::sanitize;
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Read control lines until EOF, handling each one to completion before
/// reading the next. A line longer than `max_line_bytes` ends the loop with
/// an error.
pub async fn run<R>(
    input: R,
    engine: &FilterEngine,
    output: &OutputSender,
    max_line_bytes: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut line = Vec::new();
    // Room for the longest allowed line plus its CRLF
    let limit = max_line_bytes as u64 + 2;

    loop {
        line.clear();
        let n = (&mut reader)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await
            .context("Failed to read from control channel")?;
        if n == 0 {
            log::debug!("Control channel closed");
            break;
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        if line.len() > max_line_bytes {
            log::error!("Control line exceeds {max_line_bytes} bytes, stopping");
            bail!("control line exceeds {} bytes", max_line_bytes);
        }

        log::debug!("Event: {}", sanitize::clean_bytes(&line));

        match engine.handle_line(&line) {
            EventOutcome::Dispatched(replies) => output.send(replies),
            EventOutcome::Dropped => {}
            EventOutcome::Failed(message) => {
                log::warn!(
                    "Recovered from fault while handling event: {}",
                    sanitize::clean(&message)
                );
            }
        }
    }

    Ok(())
}
