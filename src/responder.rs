//! The capability set an embedding application implements.

use crate::error::Error;
use crate::protocol::Command;
use crate::status::StatusChannel;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Why ssh is asking about a host key (`%I` in `KnownHostsCommand`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyReason {
    Address,
    Hostname,
}

impl HostKeyReason {
    fn parse(reason: &str) -> Option<Self> {
        match reason {
            "ADDRESS" => Some(Self::Address),
            "HOSTNAME" => Some(Self::Hostname),
            _ => None,
        }
    }
}

/// A host key lookup, for a helper run as ssh's `KnownHostsCommand`
/// with `%I %H %t %K %f`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyQuery {
    pub reason: HostKeyReason,
    pub host: String,
    pub algorithm: String,
    /// Base64 key blob
    pub key: String,
    pub fingerprint: String,
}

impl HostKeyQuery {
    /// The `known_hosts` line ssh expects back for an accepted key.
    pub fn known_hosts_line(&self) -> String {
        format!("{} {} {}", self.host, self.algorithm, self.key)
    }
}

/// A `ferny.askpass` request, with its descriptors already turned into
/// usable handles.
#[derive(Debug)]
pub struct AskRequest {
    /// The helper's full argv, including argv[0]
    pub argv: Vec<String>,
    /// The helper's environment
    pub env: BTreeMap<String, String>,
    /// Unstructured text received since the previous command
    pub preceding_text: String,
    /// Where the helper waits for its exit status
    pub status: StatusChannel,
    /// The helper's stdout: the answer goes here
    pub output: tokio::fs::File,
}

impl AskRequest {
    /// The prompt, for a plain askpass invocation (`argv == [program, prompt]`).
    pub fn prompt(&self) -> Option<&str> {
        match self.argv.as_slice() {
            [_, prompt] => Some(prompt),
            _ => None,
        }
    }

    /// ssh's `SSH_ASKPASS_PROMPT` hint: `"confirm"`, `"none"`, or empty.
    pub fn hint(&self) -> &str {
        self.env
            .get("SSH_ASKPASS_PROMPT")
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The host key lookup, for a six-element argv
    /// `[program, reason, host, algorithm, key, fingerprint]`. Lookups for
    /// other reasons are `None`; ssh expects status 0 and no output for them.
    pub fn host_key(&self) -> Option<HostKeyQuery> {
        let [_, reason, host, algorithm, key, fingerprint] = self.argv.as_slice() else {
            return None;
        };
        Some(HostKeyQuery {
            reason: HostKeyReason::parse(reason)?,
            host: host.clone(),
            algorithm: algorithm.clone(),
            key: key.clone(),
            fingerprint: fingerprint.clone(),
        })
    }

    /// Reply to a `KnownHostsCommand` lookup. An accepted key is written to
    /// the output as a `known_hosts` line; the status is 0 either way, since
    /// a declined key is simply unknown to ssh.
    pub async fn answer_host_key(mut self, accepted: Option<&HostKeyQuery>) -> std::io::Result<()> {
        if let Some(query) = accepted {
            debug!("Accepting {} key for {}", query.algorithm, query.host);
            self.output
                .write_all(format!("{}\n", query.known_hosts_line()).as_bytes())
                .await?;
            self.output.flush().await?;
        }
        drop(self.output);
        self.status.finish(0).await
    }

    /// Write `answer` followed by a newline to the output and signal status 0.
    pub async fn answer(mut self, answer: &str) -> std::io::Result<()> {
        self.output.write_all(answer.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await?;
        drop(self.output);
        self.status.finish(0).await
    }
}

/// Handlers dispatched to by the interaction agent.
///
/// Only [`ask`](Responder::ask) is required. Dropping the request without
/// answering closes both descriptors, and the helper exits with status 1.
#[async_trait]
pub trait Responder: Send {
    /// `ferny.askpass`: ask the user for a secret or a confirmation, or
    /// (see [`AskRequest::host_key`]) whether to trust a host key.
    ///
    /// The future is dropped if the helper goes away before it completes.
    async fn ask(&mut self, request: AskRequest) -> anyhow::Result<()>;

    /// `ferny.end`: the interaction is over. No further events follow.
    async fn end(&mut self, _preceding_text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Any other command. The default ignores it.
    async fn command(&mut self, command: Command) -> anyhow::Result<()> {
        debug!("Ignoring unhandled command {}", command.name());
        Ok(())
    }

    /// Unstructured text, as soon as it is known not to be part of a command.
    fn text(&mut self, _text: &[u8]) {}

    /// A built-in command arrived with arguments of the wrong shape. The
    /// session continues.
    fn rejected(&mut self, name: &str, error: &Error) {
        warn!("Rejected {} command: {}", name, error);
    }
}
