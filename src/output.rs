use crate::protocol::Reply;
use crate::session::lock;
use anyhow::Result;
use std::io::{self, Write};
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Serializes reply bursts to the control channel.
///
/// Bursts go through a bounded queue to a single writer task, which writes
/// and flushes each line in enqueue order. When the queue is full (or the
/// writer is gone) the burst is written synchronously instead. That burst can
/// then land ahead of bursts still waiting in the queue; the alternative is
/// blocking the control loop on a slow reader, which is worse.
pub struct OutputSender {
    sender: Option<mpsc::Sender<Vec<Reply>>>,
    direct: Mutex<Box<dyn Write + Send>>,
    handle: Option<JoinHandle<()>>,
}

impl OutputSender {
    pub fn new<W>(writer: W, direct: Box<dyn Write + Send>, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        let handle = tokio::spawn(async move {
            if let Err(e) = Self::writer_worker(writer, receiver).await {
                log::error!("Output writer error: {e}");
            }
        });

        Self {
            sender: Some(sender),
            direct: Mutex::new(direct),
            handle: Some(handle),
        }
    }

    pub fn stdout(capacity: usize) -> Self {
        Self::new(tokio::io::stdout(), Box::new(io::stdout()), capacity)
    }

    /// Queue one burst without waiting. Falls back to a direct write.
    pub fn send(&self, burst: Vec<Reply>) {
        if burst.is_empty() {
            return;
        }
        let burst = match &self.sender {
            Some(sender) => match sender.try_send(burst) {
                Ok(()) => return,
                Err(TrySendError::Full(burst)) => {
                    log::debug!("Output queue full, writing {} replies directly", burst.len());
                    burst
                }
                Err(TrySendError::Closed(burst)) => {
                    log::debug!("Output writer gone, writing {} replies directly", burst.len());
                    burst
                }
            },
            None => burst,
        };

        let lines: Vec<Vec<u8>> = burst.iter().map(Reply::to_line).collect();
        if let Err(e) = self.write_direct(&lines[..]) {
            log::error!("Failed to write replies: {e}");
        }
    }

    /// Write and flush lines synchronously, bypassing the queue.
    pub fn write_direct<L: AsRef<[u8]>>(&self, lines: &[L]) -> io::Result<()> {
        let mut out = lock(&self.direct);
        for line in lines {
            out.write_all(line.as_ref())?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
        Ok(())
    }

    /// Close the queue and wait until everything queued has been written.
    pub async fn shutdown(mut self) -> Result<()> {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }

    async fn writer_worker<W: AsyncWrite + Unpin>(
        mut writer: W,
        mut receiver: mpsc::Receiver<Vec<Reply>>,
    ) -> io::Result<()> {
        while let Some(burst) = receiver.recv().await {
            for reply in &burst {
                let mut line = reply.to_line();
                line.push(b'\n');
                writer.write_all(&line).await?;
                writer.flush().await?;
            }
        }
        writer.flush().await
    }
}
