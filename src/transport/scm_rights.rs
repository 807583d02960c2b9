//! 4.4BSD back-end: `SCM_RIGHTS` ancillary data over a stream socketpair.
//!
//! Each message carries one opaque payload byte and exactly one descriptor
//! in the control header. Single-byte reads keep recvmsg aligned to the
//! ancillary boundaries the sender created, so each receive yields at most
//! one descriptor.

use std::io::{self, ErrorKind};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use super::{RecvOutcome, SendOutcome};
use crate::fd;

/// Opaque byte accompanying every descriptor; discarded by the peer.
const TRANSFER_BYTE: u8 = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

pub(super) fn send_one(endpoint: RawFd, fd: RawFd) -> io::Result<SendOutcome> {
    let payload = [TRANSFER_BYTE];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let fds = [fd];
    let data_len = std::mem::size_of_val(&fds);
    let cmsg_space = unsafe { libc::CMSG_SPACE(data_len as u32) as usize };
    let mut control = vec![0u8; cmsg_space];

    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = control.len() as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
    if cmsg.is_null() {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "failed to build cmsg header",
        ));
    }

    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
        std::ptr::copy_nonoverlapping(fds.as_ptr(), data_ptr, 1);
    }

    loop {
        let n = unsafe { libc::sendmsg(endpoint, &msghdr, SEND_FLAGS) };
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

    let data_len = std::mem::size_of::<RawFd>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(data_len as u32) as usize };
    let mut control = vec![0u8; cmsg_space];

    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = control.len() as _;

    let n = loop {
        let n = unsafe { libc::recvmsg(endpoint, &mut msghdr, RECV_FLAGS) };
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

    let mut received_fd: Option<RawFd> = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                if cmsg_len >= base_len + std::mem::size_of::<RawFd>() {
                    let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    received_fd = Some(*data_ptr);
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msghdr, cmsg);
        }
    }

    let truncated = msghdr.msg_flags & libc::MSG_CTRUNC != 0;
    match received_fd {
        Some(raw) => {
            let owned = unsafe { OwnedFd::from_raw_fd(raw) };
            if truncated {
                // More than one descriptor in the message violates the wire
                // contract; the kernel already closed the excess.
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "message carried more than one descriptor",
                ));
            }
            Ok(RecvOutcome::Received(owned))
        }
        None if truncated => Ok(RecvOutcome::TableFull),
        None => Err(io::Error::new(
            ErrorKind::InvalidData,
            "message carried no descriptor",
        )),
    }
}

pub(super) fn endpoint_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let sock_type = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let sock_type = libc::SOCK_STREAM;

    let ret = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let fd0 = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let fd1 = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        use std::os::fd::AsRawFd;
        fd::set_cloexec(fd0.as_raw_fd())?;
        fd::set_cloexec(fd1.as_raw_fd())?;
    }

    Ok((fd0, fd1))
}
