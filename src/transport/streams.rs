//! SysV back-end: STREAMS `I_SENDFD`/`I_RECVFD` ioctls over a full-duplex
//! pipe.
//!
//! STREAMS pipes move whole descriptors as discrete events, so there is no
//! payload byte and no ancillary framing to align.

use std::io::{self, ErrorKind};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::fd;

use super::{RecvOutcome, SendOutcome};

// From <stropts.h>.
const STR_CMD: libc::c_int = (b'S' as libc::c_int) << 8;
const I_RECVFD: libc::c_int = STR_CMD | 0x0e;
const I_SENDFD: libc::c_int = STR_CMD | 0x11;

/// Layout of the `I_RECVFD` result, from `<stropts.h>`.
#[repr(C)]
struct StrRecvFd {
    fd: libc::c_int,
    uid: libc::uid_t,
    gid: libc::gid_t,
    fill: [libc::c_char; 8],
}

pub(super) fn send_one(endpoint: RawFd, fd: RawFd) -> io::Result<SendOutcome> {
    loop {
        let ret = unsafe { libc::ioctl(endpoint, I_SENDFD as _, fd) };
        if ret >= 0 {
            return Ok(SendOutcome::Sent);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(SendOutcome::WouldBlock),
            Some(libc::ENXIO) | Some(libc::EPIPE) => return Ok(SendOutcome::Closed),
            _ => return Err(err),
        }
    }
}

pub(super) fn recv_one(endpoint: RawFd) -> io::Result<RecvOutcome> {
    let mut recvfd = StrRecvFd {
        fd: -1,
        uid: 0,
        gid: 0,
        fill: [0; 8],
    };

    loop {
        let ret = unsafe { libc::ioctl(endpoint, I_RECVFD as _, &mut recvfd) };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(RecvOutcome::WouldBlock),
            Some(libc::ENXIO) => return Ok(RecvOutcome::Closed),
            _ => {
                if fd::is_table_full(&err) {
                    return Ok(RecvOutcome::TableFull);
                }
                return Err(err);
            }
        }
    }

    if recvfd.fd < 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "I_RECVFD returned no descriptor",
        ));
    }

    let owned = unsafe { OwnedFd::from_raw_fd(recvfd.fd) };
    fd::set_cloexec(recvfd.fd)?;
    Ok(RecvOutcome::Received(owned))
}

/// STREAMS pipes are full-duplex; a single `pipe` call yields a connected
/// endpoint pair.
pub(super) fn endpoint_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let fd0 = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let fd1 = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    {
        use std::os::fd::AsRawFd;
        fd::set_cloexec(fd0.as_raw_fd())?;
        fd::set_cloexec(fd1.as_raw_fd())?;
    }

    Ok((fd0, fd1))
}
