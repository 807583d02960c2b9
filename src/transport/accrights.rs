//! 4.3BSD back-end: `msg_accrights` descriptor passing over a stream
//! socketpair (solarish).
//!
//! Identical wire shape to the `SCM_RIGHTS` back-end except the descriptor
//! rides in the access-rights fields of the message header instead of a
//! control message.

use std::io::{self, ErrorKind};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use super::{RecvOutcome, SendOutcome};
use crate::fd;

const TRANSFER_BYTE: u8 = 0;

pub(super) fn send_one(endpoint: RawFd, fd: RawFd) -> io::Result<SendOutcome> {
    let payload = [TRANSFER_BYTE];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut rights: libc::c_int = fd;
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_accrights = (&mut rights as *mut libc::c_int).cast();
    msghdr.msg_accrightslen = std::mem::size_of::<libc::c_int>() as _;

    loop {
        let n = unsafe { libc::sendmsg(endpoint, &msghdr, 0) };
        if n > 0 {
            return Ok(SendOutcome::Sent);
        }
        if n == 0 {
            return Ok(SendOutcome::Closed);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::Interrupted => continue,
            ErrorKind::WouldBlock => return Ok(SendOutcome::WouldBlock),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
                return Ok(SendOutcome::Closed);
            }
            _ => return Err(err),
        }
    }
}

pub(super) fn recv_one(endpoint: RawFd) -> io::Result<RecvOutcome> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    let mut rights: libc::c_int = -1;
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_accrights = (&mut rights as *mut libc::c_int).cast();
    msghdr.msg_accrightslen = std::mem::size_of::<libc::c_int>() as _;

    let n = loop {
        let n = unsafe { libc::recvmsg(endpoint, &mut msghdr, 0) };
        if n >= 0 {
            break n;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::Interrupted => continue,
            ErrorKind::WouldBlock => return Ok(RecvOutcome::WouldBlock),
            ErrorKind::ConnectionReset => return Ok(RecvOutcome::Closed),
            _ => {
                if fd::is_table_full(&err) {
                    return Ok(RecvOutcome::TableFull);
                }
                return Err(err);
            }
        }
    };

    if n == 0 {
        return Ok(RecvOutcome::Closed);
    }

    // A byte without access rights means the kernel delivered the message
    // but could not allot a descriptor slot.
    if (msghdr.msg_accrightslen as usize) < std::mem::size_of::<libc::c_int>() || rights < 0 {
        return Ok(RecvOutcome::TableFull);
    }

    let owned = unsafe { OwnedFd::from_raw_fd(rights) };
    fd::set_cloexec(rights)?;
    Ok(RecvOutcome::Received(owned))
}

pub(super) fn endpoint_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
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
