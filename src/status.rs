//! Status channel for askpass interactions.
//!
//! A socket pair created by the helper for each `ferny.askpass` command. The
//! helper keeps one end and waits on it; the other end travels with the
//! command to the agent.
//!
//! - open: the interaction is still running
//! - integer written, then closed: the helper exits with that integer
//! - closed without a write: the helper exits with [`DEFAULT_STATUS`]
//!
//! Either side closing is a valid way to end the interaction. The helper
//! never writes.

use std::io::{self, Read};
use std::os::fd::OwnedFd;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::debug;

/// Exit status when the channel closes without a written value
pub const DEFAULT_STATUS: i32 = 1;

/// The agent's end of a status channel.
#[derive(Debug)]
pub struct StatusChannel {
    stream: UnixStream,
}

impl StatusChannel {
    /// Wrap a received descriptor. Must be called inside a tokio runtime.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(std_stream)?,
        })
    }

    /// Signal `status` to the helper and close the channel.
    pub async fn finish(mut self, status: i32) -> io::Result<()> {
        debug!("Signalling status {}", status);
        self.stream
            .write_all(format!("{}\n", status).as_bytes())
            .await?;
        self.stream.shutdown().await
    }

    /// Close without a value; the helper exits with [`DEFAULT_STATUS`].
    pub fn close(self) {
        drop(self);
    }

    /// Resolves once the helper has closed its end.
    pub async fn closed(&self) {
        let mut buf = [0u8; 16];
        loop {
            if self.stream.readable().await.is_err() {
                return;
            }
            match self.stream.try_read(&mut buf) {
                Ok(0) => return,
                // The helper never writes; ignore anything it sends.
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => return,
            }
        }
    }
}

/// Helper side: block until the agent signals a status or closes.
pub fn wait_for_status(channel: OwnedFd) -> io::Result<i32> {
    let mut stream = std::os::unix::net::UnixStream::from(channel);
    let mut buf = [0u8; 16];
    let n = loop {
        match stream.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    Ok(parse_status(&buf[..n]))
}

fn parse_status(data: &[u8]) -> i32 {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(DEFAULT_STATUS)
}
