//! Protocol types shared by the agent and the helper.
//!
//! Defines the wire constants, the `[name, [args...]]` command envelope and
//! the decoded [`Command`] handed to responders.

use crate::error::{Error, Result};
use crate::literal::{self, Literal};
use std::os::fd::OwnedFd;

/// Prefix of a remote-form message.
pub const MARKER: &[u8] = b"\0ferny\0";

/// Suffix of a remote-form message.
pub const TERMINATOR: &[u8] = b"\0\0\n";

/// Built-in command: askpass-style request for a secret or confirmation.
pub const ASKPASS_COMMAND: &str = "ferny.askpass";

/// Built-in command: the interaction is over.
pub const END_COMMAND: &str = "ferny.end";

/// Encode a command name and its arguments as one literal line.
pub fn encode_command(name: &str, args: &[Literal]) -> Result<String> {
    literal::encode(&Literal::Seq(vec![
        Literal::from(name),
        Literal::Seq(args.to_vec()),
    ]))
}

/// Decode a command envelope into its name and arguments.
pub fn decode_command(text: &str) -> Result<(String, Vec<Literal>)> {
    let envelope = literal::decode(text)?;
    match envelope {
        Literal::Seq(mut parts) if parts.len() == 2 => {
            let args = parts.pop();
            let name = parts.pop();
            match (name, args) {
                (Some(Literal::Str(name)), Some(Literal::Seq(args))) if !name.is_empty() => {
                    Ok((name, args))
                }
                _ => Err(Error::Protocol(
                    "command envelope must be [name, [args...]]".to_string(),
                )),
            }
        }
        _ => Err(Error::Protocol(
            "command envelope must be [name, [args...]]".to_string(),
        )),
    }
}

/// A decoded command, together with the descriptors that came with it and
/// the unstructured text that preceded it.
///
/// Received descriptors are owned by the command and closed when it drops.
#[derive(Debug)]
pub struct Command {
    name: String,
    args: Vec<Literal>,
    fds: Vec<OwnedFd>,
    preceding_text: String,
}

impl Command {
    pub fn new(name: String, args: Vec<Literal>, fds: Vec<OwnedFd>, preceding_text: String) -> Self {
        Self {
            name,
            args,
            fds,
            preceding_text,
        }
    }

    /// Decode a payload received from the transport.
    pub fn decode(payload: &[u8], fds: Vec<OwnedFd>, preceding_text: String) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::MalformedLiteral(format!("payload is not UTF-8: {}", e)))?;
        let (name, args) = decode_command(text)?;
        Ok(Self::new(name, args, fds, preceding_text))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Literal] {
        &self.args
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    pub fn preceding_text(&self) -> &str {
        &self.preceding_text
    }

    /// Take ownership of the arguments and descriptors.
    pub fn into_parts(self) -> (Vec<Literal>, Vec<OwnedFd>, String) {
        (self.args, self.fds, self.preceding_text)
    }
}

/// Configuration for the interaction agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bytes requested per receive from the transport
    pub read_buffer_size: usize,
    /// Largest accepted command body, in bytes
    pub max_message_len: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            max_message_len: 1 << 20,
        }
    }
}
