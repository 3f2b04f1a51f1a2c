//! Unix domain socket transport with descriptor passing.
//!
//! The agent keeps one end of a `SOCK_STREAM` socket pair; the other end
//! becomes the subprocess's stderr. Descriptors travel as `SCM_RIGHTS`
//! ancillary data and are turned into [`OwnedFd`]s the moment they are
//! received.

use nix::sys::socket::{
    self, getsockname, getsockopt, recvmsg, sendmsg, sockopt, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, Shutdown, SockFlag, SockType, UnixAddr,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::debug;

/// Most descriptors accepted with a single receive
pub const MAX_FDS: usize = 16;

/// Create a connected pair of local stream sockets (close-on-exec).
pub fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(io::Error::from)
}

/// Whether `fd` is a stream socket in the local (Unix) domain.
///
/// Checked, not assumed: anything else (a pipe, a tty, a file, an inet
/// socket) cannot carry descriptors.
pub fn is_unix_stream(fd: BorrowedFd<'_>) -> bool {
    match getsockopt(&fd, sockopt::SockType) {
        Ok(SockType::Stream) => {}
        Ok(other) => {
            debug!("fd {} is a {:?} socket", fd.as_raw_fd(), other);
            return false;
        }
        Err(e) => {
            debug!("fd {} is not a socket: {}", fd.as_raw_fd(), e);
            return false;
        }
    }

    // Decoding as UnixAddr fails unless the address family is AF_UNIX.
    match getsockname::<UnixAddr>(fd.as_raw_fd()) {
        Ok(_) => true,
        Err(e) => {
            debug!("fd {} is not a local socket: {}", fd.as_raw_fd(), e);
            false
        }
    }
}

/// Send `data` with `fds` attached as `SCM_RIGHTS`.
pub fn send_with_fds<Fd: AsFd>(socket: Fd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(
        socket.as_fd().as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)
}

/// One `recvmsg` call: bytes read plus any descriptors that came with them.
fn recv_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);

    let msg = recvmsg::<()>(
        socket,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel just installed these descriptors in our
            // table and nothing else refers to them.
            fds.extend(
                received
                    .into_iter()
                    .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }),
            );
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated: too many descriptors",
        ));
    }

    Ok((msg.bytes, fds))
}

/// The agent's end of the interaction socket.
pub struct Transport {
    stream: UnixStream,
}

impl Transport {
    /// Wrap a socket descriptor. Must be called inside a tokio runtime.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(std_stream)?,
        })
    }

    /// Receive the next chunk. `Ok((0, _))` is end-of-stream.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let raw = self.stream.as_raw_fd();
        loop {
            self.stream.readable().await?;
            match self
                .stream
                .try_io(Interest::READABLE, || recv_with_fds(raw, buf))
            {
                Ok(received) => return Ok(received),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Shut both directions down; the peer sees end-of-stream or EPIPE.
    pub fn shutdown(&self) {
        if let Err(e) = socket::shutdown(self.stream.as_raw_fd(), Shutdown::Both) {
            // ENOTCONN once the peer is already gone.
            debug!("Transport shutdown: {}", e);
        }
    }
}
