//! Output relay channels
//!
//! Each worker's stdout and stderr pipe is read by a small task that forwards
//! complete lines into a bounded channel. The supervisor drains the channel
//! without blocking, so a quiet worker costs nothing per poll.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
pub enum RelayEvent {
    /// One line of output, trailing newline removed
    Line(String),
    /// Reading the pipe failed; the worker is considered broken
    Broken(std::io::Error),
}

/// Start pumping `reader` into a channel of `capacity` lines.
///
/// The channel disconnects at end of stream. Non-UTF-8 bytes are replaced.
pub fn spawn_relay<R>(reader: R, capacity: usize) -> mpsc::Receiver<RelayEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(RelayEvent::Line(line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(RelayEvent::Broken(e)).await;
                    break;
                }
            }
        }
    });

    rx
}
