//! Message framer for the interaction stream.
//!
//! Splits the bytes read from the subprocess's stderr into:
//! - passthrough text
//! - remote-form commands: `\0ferny\0` + literal + `\0\0\n`
//! - local-form commands: a single NUL byte carrying descriptors, the first
//!   of which is a pipe holding the literal
//!
//! Bytes that might be the start of a remote-form message are held back until
//! enough has arrived to tell, then either framed as a command or released as
//! text.

use crate::error::{Error, Result};
use crate::protocol::{MARKER, TERMINATOR};
use regex::bytes::Regex;
use std::os::fd::OwnedFd;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Regex patterns (compiled once)
static FRAME_PATTERN: OnceLock<Regex> = OnceLock::new();
static PENDING_PATTERN: OnceLock<Regex> = OnceLock::new();

/// A complete remote-form message.
fn frame_pattern() -> &'static Regex {
    FRAME_PATTERN
        .get_or_init(|| Regex::new(r"(?s-u)\x00ferny\x00([^\x00\n]*)\x00\x00\n").unwrap())
}

/// What may follow a marker while the message is still incomplete.
fn pending_pattern() -> &'static Regex {
    PENDING_PATTERN.get_or_init(|| Regex::new(r"(?s-u)\A[^\x00\n]*(?:\x00\x00?)?\z").unwrap())
}

/// Where a command's literal lives.
#[derive(Debug)]
pub enum Payload {
    /// Remote form: the literal was inline in the stream.
    Inline(Vec<u8>),
    /// Local form: read this pipe to end-of-stream.
    Pipe(OwnedFd),
}

/// A framing event, in stream order.
#[derive(Debug)]
pub enum Frame {
    Text(Vec<u8>),
    Command { payload: Payload, fds: Vec<OwnedFd> },
}

/// Result of flushing the framer at end-of-stream
#[derive(Debug, Default)]
pub struct Flush {
    /// Bytes still held back, released as text
    pub text: Vec<u8>,
    /// Whether a remote-form message was cut off
    pub truncated: bool,
}

/// Incremental framer state
pub struct MessageFramer {
    /// Bytes not yet released (a possible message start and what follows it)
    buffer: Vec<u8>,
    /// Longest body accepted after a marker before giving up on it
    max_message_len: usize,
}

impl MessageFramer {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_len,
        }
    }

    /// Feed one chunk from the transport, with the descriptors received
    /// alongside it.
    ///
    /// Descriptors always arrive with the last byte of a chunk, and that byte
    /// must be the NUL of a local-form message.
    pub fn push(&mut self, data: &[u8], fds: Vec<OwnedFd>) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();

        if fds.is_empty() {
            self.buffer.extend_from_slice(data);
            self.drain_remote(&mut frames);
            return Ok(frames);
        }

        let Some((&0, before)) = data.split_last() else {
            warn!("Received {} descriptors not attached to a NUL byte", fds.len());
            return Err(Error::Protocol(
                "descriptors received without a NUL byte".to_string(),
            ));
        };

        self.buffer.extend_from_slice(before);
        self.drain_remote(&mut frames);

        // A local message ends whatever was pending: it is text now.
        if !self.buffer.is_empty() {
            frames.push(Frame::Text(std::mem::take(&mut self.buffer)));
        }

        let mut fds = fds.into_iter();
        if let Some(pipe) = fds.next() {
            let rest: Vec<OwnedFd> = fds.collect();
            debug!("Framed local command with {} extra descriptors", rest.len());
            frames.push(Frame::Command {
                payload: Payload::Pipe(pipe),
                fds: rest,
            });
        }

        Ok(frames)
    }

    /// End of stream: release everything still held back.
    pub fn finish(&mut self) -> Flush {
        let truncated = self.pending_marker().is_some();
        if truncated {
            debug!(
                "Stream ended inside a message ({} bytes pending)",
                self.buffer.len()
            );
        }
        Flush {
            text: std::mem::take(&mut self.buffer),
            truncated,
        }
    }

    /// Number of bytes currently held back
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Frame every complete remote message in the buffer and release the
    /// text that can no longer be part of one.
    fn drain_remote(&mut self, frames: &mut Vec<Frame>) {
        loop {
            let found = frame_pattern().captures(&self.buffer).and_then(|caps| {
                let whole = caps.get(0)?;
                let body = caps.get(1)?.as_bytes().to_vec();
                Some((whole.start(), whole.end(), body))
            });

            let Some((start, end, body)) = found else {
                break;
            };

            if start > 0 {
                frames.push(Frame::Text(self.buffer[..start].to_vec()));
            }
            debug!("Framed remote command ({} bytes)", body.len());
            frames.push(Frame::Command {
                payload: Payload::Inline(body),
                fds: Vec::new(),
            });
            self.buffer.drain(..end);
        }

        let hold = self.hold_from();
        if hold > 0 {
            frames.push(Frame::Text(self.buffer.drain(..hold).collect()));
        }
    }

    /// Index of the first byte that must be held back.
    fn hold_from(&self) -> usize {
        if let Some(start) = self.pending_marker() {
            return start;
        }

        // A proper prefix of the marker at the very end of the buffer.
        let len = self.buffer.len();
        (len.saturating_sub(MARKER.len() - 1)..len)
            .find(|&i| MARKER.starts_with(&self.buffer[i..]))
            .unwrap_or(len)
    }

    /// Start of a marker whose message could still complete.
    fn pending_marker(&self) -> Option<usize> {
        let buffer = &self.buffer;
        (0..buffer.len()).find(|&i| {
            if !buffer[i..].starts_with(MARKER) {
                return false;
            }
            let rest = &buffer[i + MARKER.len()..];
            if rest.len() > self.max_message_len + TERMINATOR.len() {
                warn!("Remote message exceeds {} bytes, releasing as text", self.max_message_len);
                return false;
            }
            pending_pattern().is_match(rest)
        })
    }
}
