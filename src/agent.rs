//! Interaction agent: owns the transport, frames the stream and dispatches
//! commands to a [`Responder`].
//!
//! A single task drives the read loop. Commands are handled strictly in
//! arrival order: while a handler runs nothing else is read, so the text
//! preceding the next command can't be misattributed.

use crate::error::{Error, Result};
use crate::framer::{Frame, MessageFramer, Payload};
use crate::protocol::{AgentConfig, Command, ASKPASS_COMMAND, END_COMMAND};
use crate::responder::{AskRequest, Responder};
use crate::status::StatusChannel;
use crate::transport::{self, Transport};
use std::io;
use std::os::fd::OwnedFd;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Whether `ferny.end` was received (as opposed to end-of-stream)
    pub ended: bool,
    /// Unstructured text received after the last command
    pub text: String,
}

impl Completion {
    /// Treat a session that never saw `ferny.end` as a failure, carrying the
    /// trailing text (typically ssh's error message).
    pub fn into_result(self) -> Result<String> {
        if self.ended {
            Ok(self.text)
        } else {
            Err(Error::Unfinished(self.text.trim().to_string()))
        }
    }
}

/// The controlling process's side of the interaction protocol.
pub struct InteractionAgent<R> {
    transport: Transport,
    framer: MessageFramer,
    responder: R,
    /// Text received since the last command
    text: Vec<u8>,
    config: AgentConfig,
}

impl<R: Responder> InteractionAgent<R> {
    /// Take ownership of `fd`, the agent's end of the transport. Must be
    /// called inside a tokio runtime.
    pub fn new(fd: OwnedFd, responder: R) -> io::Result<Self> {
        Self::with_config(fd, responder, AgentConfig::default())
    }

    pub fn with_config(fd: OwnedFd, responder: R, config: AgentConfig) -> io::Result<Self> {
        Ok(Self {
            transport: Transport::from_owned_fd(fd)?,
            framer: MessageFramer::new(config.max_message_len),
            responder,
            text: Vec::new(),
            config,
        })
    }

    /// Create the socket pair as well. The returned descriptor is meant to
    /// become the subprocess's stderr.
    pub fn with_socketpair(responder: R) -> io::Result<(Self, OwnedFd)> {
        let (ours, theirs) = transport::socketpair()?;
        Ok((Self::new(ours, responder)?, theirs))
    }

    pub fn responder(&self) -> &R {
        &self.responder
    }

    pub fn responder_mut(&mut self) -> &mut R {
        &mut self.responder
    }

    pub fn into_responder(self) -> R {
        self.responder
    }

    /// Drive the session until `ferny.end`, end-of-stream or an error. The
    /// transport is shut down on every exit path.
    ///
    /// No timeout is applied; wrap this in `tokio::time::timeout` for
    /// bounded latency. Dropping the future cancels the session.
    pub async fn run(&mut self) -> Result<Completion> {
        let result = self.drive().await;
        self.transport.shutdown();
        if let Err(ref e) = result {
            warn!("Interaction failed: {}", e);
        }
        result
    }

    async fn drive(&mut self) -> Result<Completion> {
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        loop {
            let (n, fds) = self.transport.recv(&mut buf).await?;

            if n == 0 {
                let flush = self.framer.finish();
                self.push_text(flush.text);
                if flush.truncated {
                    return Err(Error::TruncatedMessage);
                }
                debug!("Transport reached end of stream");
                return Ok(Completion {
                    ended: false,
                    text: self.take_text(),
                });
            }

            debug!("Received {} bytes, {} descriptors", n, fds.len());

            for frame in self.framer.push(&buf[..n], fds)? {
                match frame {
                    Frame::Text(bytes) => self.push_text(bytes),
                    Frame::Command { payload, fds } => {
                        let body = self.read_payload(payload).await?;
                        let command = Command::decode(&body, fds, self.take_text())?;

                        if command.name() == END_COMMAND {
                            let (_, _, text) = command.into_parts();
                            info!("Interaction ended");
                            self.responder
                                .end(&text)
                                .await
                                .map_err(Error::Responder)?;
                            return Ok(Completion { ended: true, text });
                        }

                        self.dispatch(command).await?;
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<()> {
        debug!(
            "Dispatching {} ({} args, {} descriptors)",
            command.name(),
            command.args().len(),
            command.fds().len()
        );

        if command.name() != ASKPASS_COMMAND {
            return self
                .responder
                .command(command)
                .await
                .map_err(Error::Responder);
        }

        let (request, watch) = match ask_request(command) {
            Ok(parts) => parts,
            Err(e) => {
                self.responder.rejected(ASKPASS_COMMAND, &e);
                return Ok(());
            }
        };

        tokio::select! {
            result = self.responder.ask(request) => result.map_err(Error::Responder),
            _ = watch.closed() => {
                info!("Askpass helper went away, abandoning the request");
                Ok(())
            }
        }
    }

    async fn read_payload(&self, payload: Payload) -> Result<Vec<u8>> {
        let pipe = match payload {
            Payload::Inline(body) => return Ok(body),
            Payload::Pipe(pipe) => pipe,
        };

        let limit = self.config.max_message_len as u64;
        let file = tokio::fs::File::from_std(std::fs::File::from(pipe));
        let mut body = Vec::new();
        file.take(limit + 1).read_to_end(&mut body).await?;

        if body.is_empty() {
            warn!("Payload pipe closed before any data");
            return Err(Error::TruncatedMessage);
        }
        if body.len() as u64 > limit {
            return Err(Error::Protocol(format!(
                "command payload exceeds {} bytes",
                limit
            )));
        }
        Ok(body)
    }

    fn push_text(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.responder.text(&bytes);
        self.text.extend(bytes);
    }

    fn take_text(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.text)).into_owned()
    }
}

/// Check a `ferny.askpass` command's shape: `(argv, env)` plus exactly two
/// descriptors, the status channel and the output.
///
/// Also returns a second handle on the status channel, used to notice the
/// helper going away while the request is being served.
fn ask_request(command: Command) -> Result<(AskRequest, StatusChannel)> {
    let (args, fds, preceding_text) = command.into_parts();

    let [argv, env] = args.as_slice() else {
        return Err(Error::Protocol(format!(
            "expected (argv, env), got {} arguments",
            args.len()
        )));
    };
    let argv = argv
        .to_strings()
        .ok_or_else(|| Error::Protocol("argv must be a sequence of strings".to_string()))?;
    let env = env
        .to_string_map()
        .ok_or_else(|| Error::Protocol("env must map strings to strings".to_string()))?;

    let count = fds.len();
    let Ok([status_fd, output_fd]) = <[OwnedFd; 2]>::try_from(fds) else {
        return Err(Error::Protocol(format!(
            "expected 2 descriptors, got {}",
            count
        )));
    };

    let watch = StatusChannel::from_owned_fd(status_fd.try_clone()?)?;
    let status = StatusChannel::from_owned_fd(status_fd)?;
    let output = tokio::fs::File::from_std(std::fs::File::from(output_fd));

    Ok((
        AskRequest {
            argv,
            env,
            preceding_text,
            status,
            output,
        },
        watch,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::Literal;
    use crate::protocol::MARKER;
    use crate::sender::{askpass, encode_remote, send_command};
    use crate::transport::send_with_fds;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::io::{Read, Write};
    use std::os::fd::{AsFd, AsRawFd};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Recorder {
        answer: Option<String>,
        stall: bool,
        fail_commands: bool,
        trust_host_keys: bool,
        asks: Vec<(String, String, String)>,
        commands: Vec<(String, Vec<Literal>, String)>,
        text: Vec<u8>,
        ended: Option<String>,
        rejected: Vec<String>,
    }

    #[async_trait]
    impl Responder for Recorder {
        async fn ask(&mut self, request: AskRequest) -> anyhow::Result<()> {
            self.asks.push((
                request.prompt().unwrap_or_default().to_string(),
                request.hint().to_string(),
                request.preceding_text.clone(),
            ));
            if self.stall {
                std::future::pending::<()>().await;
            }
            if let Some(query) = request.host_key() {
                let accepted = self.trust_host_keys.then_some(&query);
                request.answer_host_key(accepted).await?;
                return Ok(());
            }
            if let Some(answer) = self.answer.clone() {
                request.answer(&answer).await?;
            }
            Ok(())
        }

        async fn end(&mut self, preceding_text: &str) -> anyhow::Result<()> {
            self.ended = Some(preceding_text.to_string());
            Ok(())
        }

        async fn command(&mut self, command: Command) -> anyhow::Result<()> {
            if self.fail_commands {
                anyhow::bail!("cannot handle {}", command.name());
            }
            self.commands.push((
                command.name().to_string(),
                command.args().to_vec(),
                command.preceding_text().to_string(),
            ));
            Ok(())
        }

        fn text(&mut self, text: &[u8]) {
            self.text.extend_from_slice(text);
        }

        fn rejected(&mut self, name: &str, error: &Error) {
            self.rejected.push(format!("{}: {}", name, error));
        }
    }

    /// Implements only what is required.
    struct Minimal;

    #[async_trait]
    impl Responder for Minimal {
        async fn ask(&mut self, _request: AskRequest) -> anyhow::Result<()> {
            Ok(())
        }
    }

    const LIMIT: Duration = Duration::from_secs(5);

    fn remote(name: &str, args: &[Literal]) -> Vec<u8> {
        encode_remote(name, args).unwrap()
    }

    async fn run_with<R, F>(responder: R, helper: F) -> (Result<Completion>, R)
    where
        R: Responder,
        F: FnOnce(UnixStream) + Send + 'static,
    {
        let (mut agent, theirs) = InteractionAgent::with_socketpair(responder).unwrap();
        let helper = tokio::task::spawn_blocking(move || helper(UnixStream::from(theirs)));
        let result = timeout(LIMIT, agent.run()).await.expect("agent timed out");
        helper.await.unwrap();
        (result, agent.into_responder())
    }

    #[tokio::test]
    async fn test_askpass_round_trip() {
        let recorder = Recorder {
            answer: Some("hunter2".to_string()),
            ..Default::default()
        };

        let (code_tx, code_rx) = std::sync::mpsc::channel();
        let (result, recorder) = run_with(recorder, move |mut stream| {
            stream.write_all(b"warning: it works\n").unwrap();

            let (out_read, out_write) = nix::unistd::pipe().unwrap();
            let argv = vec!["ferny-askpass".to_string(), "can has pw?".to_string()];
            let code = askpass(&stream, &out_write, &argv, &BTreeMap::new()).unwrap();
            drop(out_write);

            let mut answer = String::new();
            std::fs::File::from(out_read).read_to_string(&mut answer).unwrap();
            code_tx.send((code, answer)).unwrap();

            send_command(&stream, END_COMMAND, &[], &[]).unwrap();
        })
        .await;

        let completion = result.unwrap();
        assert!(completion.ended);
        assert_eq!(completion.text, "");
        assert_eq!(code_rx.recv().unwrap(), (0, "hunter2\n".to_string()));
        assert_eq!(
            recorder.asks,
            vec![(
                "can has pw?".to_string(),
                String::new(),
                "warning: it works\n".to_string()
            )]
        );
        assert_eq!(recorder.ended.as_deref(), Some(""));
        assert_eq!(recorder.text, b"warning: it works\n".to_vec());
    }

    #[tokio::test]
    async fn test_unanswered_ask_exits_with_default_status() {
        let (code_tx, code_rx) = std::sync::mpsc::channel();
        let (result, recorder) = run_with(Recorder::default(), move |stream| {
            let (_out_read, out_write) = nix::unistd::pipe().unwrap();
            let mut env = BTreeMap::new();
            env.insert("SSH_ASKPASS_PROMPT".to_string(), "confirm".to_string());
            let argv = vec!["askpass".to_string(), "Allow use of key?".to_string()];
            code_tx
                .send(askpass(&stream, &out_write, &argv, &env).unwrap())
                .unwrap();
        })
        .await;

        assert!(!result.unwrap().ended);
        assert_eq!(code_rx.recv().unwrap(), 1);
        assert_eq!(recorder.asks[0].1, "confirm");
    }

    #[tokio::test]
    async fn test_end_stops_before_following_bytes() {
        let (result, recorder) = run_with(Recorder::default(), |mut stream| {
            let mut bytes = b"first\n".to_vec();
            bytes.extend(remote(END_COMMAND, &[]));
            bytes.extend(b"second\n");
            bytes.extend(remote("vendor.after", &[]));
            // The agent may already have shut the socket down.
            let _ = stream.write_all(&bytes);
        })
        .await;

        let completion = result.unwrap();
        assert!(completion.ended);
        assert_eq!(completion.text, "first\n");
        assert!(recorder.commands.is_empty());
        assert_eq!(recorder.text, b"first\n".to_vec());
    }

    #[tokio::test]
    async fn test_unknown_command_without_handler_continues() {
        let (result, _) = run_with(Minimal, |mut stream| {
            stream.write_all(b"x").unwrap();
            stream
                .write_all(&remote("vendor.ping", &[Literal::Int(1)]))
                .unwrap();
            stream.write_all(b"y").unwrap();
            send_command(&stream, "vendor.pong", &[], &[]).unwrap();
            stream.write_all(b"z").unwrap();
            stream.write_all(&remote(END_COMMAND, &[])).unwrap();
        })
        .await;

        let completion = result.unwrap();
        assert!(completion.ended);
        assert_eq!(completion.text, "z");
    }

    #[tokio::test]
    async fn test_local_and_remote_forms_decode_the_same() {
        let args = vec![
            Literal::from("a\nb"),
            Literal::from(vec![Literal::Int(-1), Literal::None, Literal::Bool(true)]),
        ];
        let sent = args.clone();

        let (result, recorder) = run_with(Recorder::default(), move |mut stream| {
            let (extra, _keep) = nix::unistd::pipe().unwrap();
            send_command(&stream, "vendor.both", &sent, &[extra.as_fd()]).unwrap();
            stream.write_all(b"between").unwrap();
            stream.write_all(&remote("vendor.both", &sent)).unwrap();
        })
        .await;

        assert!(!result.unwrap().ended);
        assert_eq!(
            recorder.commands,
            vec![
                ("vendor.both".to_string(), args.clone(), String::new()),
                ("vendor.both".to_string(), args, "between".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_literal_terminates_session() {
        let (result, recorder) = run_with(Recorder::default(), |mut stream| {
            let mut bytes = MARKER.to_vec();
            bytes.extend(b"('ferny.end', ())\0\0\n");
            bytes.extend(remote("vendor.after", &[]));
            let _ = stream.write_all(&bytes);
        })
        .await;

        assert!(matches!(result, Err(Error::MalformedLiteral(_))));
        assert!(recorder.commands.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_remote_message() {
        let (result, recorder) = run_with(Recorder::default(), |mut stream| {
            stream.write_all(b"oops\0ferny\0[\"ferny").unwrap();
        })
        .await;

        assert!(matches!(result, Err(Error::TruncatedMessage)));
        assert_eq!(recorder.text, b"oops\0ferny\0[\"ferny".to_vec());
    }

    #[tokio::test]
    async fn test_empty_payload_pipe_is_truncation() {
        let (result, _) = run_with(Recorder::default(), |stream| {
            let (read_end, write_end) = nix::unistd::pipe().unwrap();
            drop(write_end);
            send_with_fds(&stream, b"\0", &[read_end.as_raw_fd()]).unwrap();
        })
        .await;

        assert!(matches!(result, Err(Error::TruncatedMessage)));
    }

    #[tokio::test]
    async fn test_end_of_stream_without_end_command() {
        let (result, _) = run_with(Recorder::default(), |mut stream| {
            stream
                .write_all(b"user@host: Permission denied (publickey).\n")
                .unwrap();
        })
        .await;

        let completion = result.unwrap();
        assert!(!completion.ended);
        match completion.into_result() {
            Err(Error::Unfinished(text)) => {
                assert_eq!(text, "user@host: Permission denied (publickey).")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_ask_is_rejected_and_session_continues() {
        let (result, recorder) = run_with(Recorder::default(), |mut stream| {
            // Remote form cannot carry the two descriptors.
            let argv = Literal::from(vec!["askpass", "pw?"]);
            let env = Literal::Map(BTreeMap::new());
            stream
                .write_all(&remote(ASKPASS_COMMAND, &[argv, env]))
                .unwrap();
            stream
                .write_all(&remote(ASKPASS_COMMAND, &[Literal::Int(1)]))
                .unwrap();
            stream.write_all(&remote(END_COMMAND, &[])).unwrap();
        })
        .await;

        assert!(result.unwrap().ended);
        assert!(recorder.asks.is_empty());
        assert_eq!(recorder.rejected.len(), 2);
        assert!(recorder.rejected[0].contains("expected 2 descriptors"));
        assert!(recorder.rejected[1].contains("expected (argv, env)"));
    }

    #[tokio::test]
    async fn test_helper_going_away_cancels_ask() {
        let recorder = Recorder {
            stall: true,
            ..Default::default()
        };

        let (result, recorder) = run_with(recorder, |stream| {
            let (ours, theirs) = transport::socketpair().unwrap();
            let (_out_read, out_write) = nix::unistd::pipe().unwrap();
            let args = [
                Literal::from(vec!["askpass", "pw?"]),
                Literal::Map(BTreeMap::new()),
            ];
            send_command(
                &stream,
                ASKPASS_COMMAND,
                &args,
                &[theirs.as_fd(), out_write.as_fd()],
            )
            .unwrap();
            drop(theirs);

            // Give the agent time to start the prompt, then vanish.
            std::thread::sleep(Duration::from_millis(100));
            drop(ours);
            send_command(&stream, END_COMMAND, &[], &[]).unwrap();
        })
        .await;

        assert!(result.unwrap().ended);
        assert_eq!(recorder.asks.len(), 1);
    }

    #[tokio::test]
    async fn test_responder_failure_ends_session() {
        let recorder = Recorder {
            fail_commands: true,
            ..Default::default()
        };
        let (result, _) = run_with(recorder, |mut stream| {
            let _ = stream.write_all(&remote("vendor.boom", &[]));
        })
        .await;

        assert!(matches!(result, Err(Error::Responder(_))));
    }

    fn host_key_argv(reason: &str) -> Vec<String> {
        [
            "ferny-askpass",
            reason,
            "example.com",
            "ssh-ed25519",
            "AAAAC3NzaC1lZDI1NTE5AAAAIExample",
            "SHA256:abcdef",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }

    /// Run `argv` through the helper call; returns (status, output).
    fn ask_over(stream: &UnixStream, argv: &[String]) -> (i32, String) {
        let (out_read, out_write) = nix::unistd::pipe().unwrap();
        let code = askpass(stream, &out_write, argv, &BTreeMap::new()).unwrap();
        drop(out_write);

        let mut output = String::new();
        std::fs::File::from(out_read).read_to_string(&mut output).unwrap();
        (code, output)
    }

    #[tokio::test]
    async fn test_known_hosts_lookup() {
        let recorder = Recorder {
            trust_host_keys: true,
            ..Default::default()
        };

        let (replies_tx, replies_rx) = std::sync::mpsc::channel();
        let (result, recorder) = run_with(recorder, move |stream| {
            for reason in ["HOSTNAME", "ADDRESS", "CERTIFICATE"] {
                replies_tx
                    .send(ask_over(&stream, &host_key_argv(reason)))
                    .unwrap();
            }
            send_command(&stream, END_COMMAND, &[], &[]).unwrap();
        })
        .await;

        assert!(result.unwrap().ended);
        let line = "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample\n".to_string();
        assert_eq!(replies_rx.recv().unwrap(), (0, line.clone()));
        assert_eq!(replies_rx.recv().unwrap(), (0, line));
        // Unknown reason: not a lookup, so nothing answers and the default applies.
        assert_eq!(replies_rx.recv().unwrap(), (1, String::new()));
        assert_eq!(recorder.asks.len(), 3);
    }

    #[tokio::test]
    async fn test_declined_host_key_still_exits_zero() {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        let (result, _) = run_with(Recorder::default(), move |stream| {
            reply_tx
                .send(ask_over(&stream, &host_key_argv("HOSTNAME")))
                .unwrap();
        })
        .await;

        assert!(!result.unwrap().ended);
        assert_eq!(reply_rx.recv().unwrap(), (0, String::new()));
    }

    #[tokio::test]
    async fn test_oversized_local_payload() {
        let (ours, theirs) = transport::socketpair().unwrap();
        let config = AgentConfig {
            max_message_len: 8,
            ..Default::default()
        };
        let mut agent = InteractionAgent::with_config(ours, Recorder::default(), config).unwrap();

        let helper = tokio::task::spawn_blocking(move || {
            let stream = UnixStream::from(theirs);
            // `["vendor.long",["0123456789"]]` is well past 8 bytes.
            let _ = send_command(&stream, "vendor.long", &[Literal::from("0123456789")], &[]);
        });

        let result = timeout(LIMIT, agent.run()).await.expect("agent timed out");
        helper.await.unwrap();

        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(agent.responder().commands.is_empty());
    }
}
