//! Helper-side command sender.
//!
//! Picks the wire form from what the destination actually is:
//! - a local stream socket: the local form (NUL byte + payload pipe + fds)
//! - anything else: the remote form, inline text, and no descriptors

use crate::error::{Error, Result};
use crate::literal::Literal;
use crate::protocol::{encode_command, ASKPASS_COMMAND, MARKER, TERMINATOR};
use crate::status;
use crate::transport::{self, send_with_fds};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use tracing::debug;

/// Which encoding a command went out in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireForm {
    /// NUL byte with the payload pipe and descriptors attached
    Local,
    /// Marker, inline literal, terminator
    Remote,
}

/// Remote-form bytes for a command.
pub fn encode_remote(name: &str, args: &[Literal]) -> Result<Vec<u8>> {
    let payload = encode_command(name, args)?;
    let mut bytes = Vec::with_capacity(MARKER.len() + payload.len() + TERMINATOR.len());
    bytes.extend_from_slice(MARKER);
    bytes.extend_from_slice(payload.as_bytes());
    bytes.extend_from_slice(TERMINATOR);
    Ok(bytes)
}

/// Send a command to `dest`, passing `fds` along.
///
/// Fails with [`Error::TransportIncapable`] if descriptors were requested
/// and `dest` is not a local stream socket.
pub fn send_command<D: AsFd>(
    dest: D,
    name: &str,
    args: &[Literal],
    fds: &[BorrowedFd<'_>],
) -> Result<WireForm> {
    let dest = dest.as_fd();

    if transport::is_unix_stream(dest) {
        send_local(dest, name, args, fds)?;
        return Ok(WireForm::Local);
    }

    if !fds.is_empty() {
        return Err(Error::TransportIncapable);
    }

    debug!("Sending {} in remote form", name);
    let mut out = File::from(dest.try_clone_to_owned()?);
    out.write_all(&encode_remote(name, args)?)?;
    out.flush()?;
    Ok(WireForm::Remote)
}

fn send_local(dest: BorrowedFd<'_>, name: &str, args: &[Literal], fds: &[BorrowedFd<'_>]) -> Result<()> {
    debug!("Sending {} in local form with {} descriptors", name, fds.len());

    let body = encode_command(name, args)?;

    let (payload_read, payload_write) = nix::unistd::pipe()?;

    let mut passed: Vec<RawFd> = Vec::with_capacity(fds.len() + 1);
    passed.push(payload_read.as_raw_fd());
    passed.extend(fds.iter().map(|fd| fd.as_raw_fd()));

    send_with_fds(dest, b"\0", &passed)?;
    drop(payload_read);

    // Written after sending: the reader may need to drain the pipe before a
    // large payload fits.
    let mut payload = File::from(payload_write);
    payload.write_all(body.as_bytes())?;
    Ok(())
}

/// Run one askpass interaction: send `ferny.askpass` with `argv` and `env`,
/// handing over a fresh status channel and `output` (where the answer goes),
/// then wait for the agent's verdict.
pub fn askpass<D: AsFd, O: AsFd>(
    dest: D,
    output: O,
    argv: &[String],
    env: &BTreeMap<String, String>,
) -> Result<i32> {
    let (ours, theirs) = transport::socketpair()?;

    let args = [
        Literal::from(argv.to_vec()),
        Literal::from(env.clone()),
    ];
    send_command(dest, ASKPASS_COMMAND, &args, &[theirs.as_fd(), output.as_fd()])?;
    drop(theirs);

    let code = status::wait_for_status(ours)?;
    debug!("Askpass finished with status {}", code);
    Ok(code)
}
