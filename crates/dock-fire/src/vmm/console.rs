//! Console plumbing for TTY-mode containers: a fresh pseudoterminal whose
//! master side is shipped to the supervisor over its console socket, while
//! the slave side becomes the VMM's stdio.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

use crate::error::{Result, RuntimeError};

/// Allocate a pseudoterminal pair.
pub fn open_pty() -> Result<(OwnedFd, OwnedFd)> {
    let pty = nix::pty::openpty(None, None)
        .map_err(|e| RuntimeError::Internal(format!("openpty: {e}")))?;
    Ok((pty.master, pty.slave))
}

/// Ship the PTY master to the supervisor via SCM_RIGHTS over its console
/// socket. The kernel dups the descriptor into the receiver; the caller
/// closes its own copy afterwards.
pub fn send_console_fd(console_socket: &Path, master: BorrowedFd<'_>) -> Result<()> {
    let stream = UnixStream::connect(console_socket).map_err(|e| {
        RuntimeError::Internal(format!("dial console socket {}: {e}", console_socket.display()))
    })?;

    let fds = [master.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    // A one-byte payload; some receivers refuse a pure-ancillary message.
    let iov = [IoSlice::new(b"\0")];
    sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::empty(),
        None,
    )
    .map_err(|e| RuntimeError::Internal(format!("send console fd: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::IoSliceMut;
    use std::os::fd::{AsFd, RawFd};
    use std::os::unix::net::UnixListener;

    use nix::sys::socket::{recvmsg, ControlMessageOwned};

    #[test]
    fn open_pty_returns_a_usable_pair() {
        let (master, slave) = open_pty().unwrap();
        assert_ne!(master.as_raw_fd(), slave.as_raw_fd());

        // Bytes written to the master arrive on the slave.
        nix::unistd::write(&master, b"ok\n").unwrap();
        let mut buf = [0u8; 16];
        let n = nix::unistd::read(slave.as_raw_fd(), &mut buf).unwrap();
        assert!(n > 0);
    }

    #[test]
    fn console_fd_crosses_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("console.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let receiver = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut data = [0u8; 8];
            let mut iov = [IoSliceMut::new(&mut data)];
            let mut space = nix::cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut space),
                MsgFlags::empty(),
            )
            .unwrap();
            for cmsg in msg.cmsgs().unwrap() {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    return fds.first().copied();
                }
            }
            None
        });

        let (master, _slave) = open_pty().unwrap();
        send_console_fd(&sock_path, master.as_fd()).unwrap();

        let received = receiver.join().unwrap();
        let fd = received.expect("no fd received");
        // The received descriptor is a live dup of the master.
        assert!(fd >= 0);
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd was just received over SCM_RIGHTS and is owned by this
        // test; stat is a valid out-pointer.
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        assert_eq!(rc, 0);
        // SAFETY: fd is not used after this point.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn send_console_fd_reports_a_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (master, _slave) = open_pty().unwrap();
        let err = send_console_fd(&dir.path().join("absent.sock"), master.as_fd()).unwrap_err();
        assert!(err.to_string().contains("console socket"), "got: {err}");
    }
}
