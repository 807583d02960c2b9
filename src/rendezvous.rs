//! Filesystem rendezvous between unrelated processes.
//!
//! These helpers establish the endpoint a [`crate::Passer`] is built over
//! when the two processes are not in a fork relationship: a listening
//! object bound to a filesystem path on one side, `connect` on the other.
//! They block, so call them before entering the event loop (or under
//! `spawn_blocking`). Path permissions and unlinking on shutdown are the
//! caller's responsibility.
//!
//! On the BSD back-ends the path names a UNIX-domain listening socket; on
//! the SysV back-end it names a mounted STREAMS pipe with the `connld`
//! module pushed.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::transport;

/// Default listen backlog when the caller does not specify one.
const DEFAULT_BACKLOG: u32 = 16;

/// A listening rendezvous object bound to a filesystem path.
#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
}

impl Listener {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Create a connected endpoint pair in one process, suitable for paired
/// passer construction before a fork.
pub fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    transport::endpoint_pair()
}

/// Bind a listening rendezvous object to `path`.
pub fn server(path: &Path, backlog: Option<u32>) -> io::Result<Listener> {
    let fd = imp::server(path, backlog.unwrap_or(DEFAULT_BACKLOG))?;
    Ok(Listener { fd })
}

/// Accept one peer connection, yielding an endpoint for single-endpoint
/// passer construction. Blocks until a peer connects.
pub fn accept(listener: &Listener) -> io::Result<OwnedFd> {
    imp::accept(listener.fd.as_raw_fd())
}

/// Connect to a rendezvous object at `path`, yielding an endpoint for
/// single-endpoint passer construction.
pub fn connect(path: &Path) -> io::Result<OwnedFd> {
    imp::connect(path)
}

#[cfg(not(feature = "sysv-streams"))]
mod imp {
    use std::io::{self, ErrorKind};
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::path::Path;

    use crate::fd;

    fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
        use std::os::unix::ffi::OsStrExt;

        let bytes = path.as_os_str().as_bytes();
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        if bytes.len() >= addr.sun_path.len() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "rendezvous path too long for sockaddr_un",
            ));
        }
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok((addr, std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t))
    }

    fn stream_socket() -> io::Result<OwnedFd> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let sock_type = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let sock_type = libc::SOCK_STREAM;

        let ret = unsafe { libc::socket(libc::AF_UNIX, sock_type, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { OwnedFd::from_raw_fd(ret) };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            use std::os::fd::AsRawFd;
            fd::set_cloexec(sock.as_raw_fd())?;
        }

        Ok(sock)
    }

    pub(super) fn server(path: &Path, backlog: u32) -> io::Result<OwnedFd> {
        use std::os::fd::AsRawFd;

        let sock = stream_socket()?;
        let (addr, len) = sockaddr_un(path)?;

        let ret = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast(),
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let ret = unsafe { libc::listen(sock.as_raw_fd(), backlog as libc::c_int) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(sock)
    }

    pub(super) fn accept(listener: libc::c_int) -> io::Result<OwnedFd> {
        loop {
            let ret = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if ret >= 0 {
                let endpoint = unsafe { OwnedFd::from_raw_fd(ret) };
                fd::set_cloexec(ret)?;
                return Ok(endpoint);
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub(super) fn connect(path: &Path) -> io::Result<OwnedFd> {
        use std::os::fd::AsRawFd;

        let sock = stream_socket()?;
        let (addr, len) = sockaddr_un(path)?;

        loop {
            let ret = unsafe {
                libc::connect(
                    sock.as_raw_fd(),
                    (&addr as *const libc::sockaddr_un).cast(),
                    len,
                )
            };
            if ret >= 0 {
                return Ok(sock);
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

#[cfg(all(
    feature = "sysv-streams",
    any(target_os = "solaris", target_os = "illumos")
))]
mod imp {
    use std::ffi::CString;
    use std::io::{self, ErrorKind};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use crate::fd;

    // From <stropts.h>.
    const STR_CMD: libc::c_int = (b'S' as libc::c_int) << 8;
    const I_PUSH: libc::c_int = STR_CMD | 0x02;
    const I_RECVFD: libc::c_int = STR_CMD | 0x0e;

    #[repr(C)]
    struct StrRecvFd {
        fd: libc::c_int,
        uid: libc::uid_t,
        gid: libc::gid_t,
        fill: [libc::c_char; 8],
    }

    unsafe extern "C" {
        fn fattach(fildes: libc::c_int, path: *const libc::c_char) -> libc::c_int;
    }

    fn c_path(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "rendezvous path contains NUL"))
    }

    /// Mount a `connld` pipe end at `path`; connections arrive as new
    /// descriptors on the retained end. The backlog is kernel-managed for
    /// STREAMS pipes.
    pub(super) fn server(path: &Path, _backlog: u32) -> io::Result<OwnedFd> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let listen_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let mount_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        fd::set_cloexec(listen_end.as_raw_fd())?;

        let connld = c_path(Path::new("connld"))?;
        if unsafe { libc::ioctl(mount_end.as_raw_fd(), I_PUSH as _, connld.as_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let path = c_path(path)?;
        if unsafe { fattach(mount_end.as_raw_fd(), path.as_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        // The mounted end stays referenced by the mount itself.
        std::mem::forget(mount_end);
        Ok(listen_end)
    }

    pub(super) fn accept(listener: libc::c_int) -> io::Result<OwnedFd> {
        let mut recvfd = StrRecvFd {
            fd: -1,
            uid: 0,
            gid: 0,
            fill: [0; 8],
        };
        loop {
            let ret = unsafe { libc::ioctl(listener, I_RECVFD as _, &mut recvfd) };
            if ret >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
        if recvfd.fd < 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "connld delivered no descriptor",
            ));
        }
        let endpoint = unsafe { OwnedFd::from_raw_fd(recvfd.fd) };
        fd::set_cloexec(recvfd.fd)?;
        Ok(endpoint)
    }

    pub(super) fn connect(path: &Path) -> io::Result<OwnedFd> {
        let path = c_path(path)?;
        loop {
            let ret = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
            if ret >= 0 {
                let endpoint = unsafe { OwnedFd::from_raw_fd(ret) };
                fd::set_cloexec(ret)?;
                return Ok(endpoint);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socketpair_is_connected() {
        let (a, b) = socketpair().unwrap();
        let payload = [0x7fu8];
        let n = unsafe { libc::write(a.as_raw_fd(), payload.as_ptr().cast(), payload.len()) };
        assert_eq!(n, 1);
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(b.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 1);
        assert_eq!(buf[0], 0x7f);
    }

    #[test]
    fn server_rejects_overlong_path() {
        let long = "x".repeat(4096);
        let path = std::env::temp_dir().join(long);
        assert!(server(&path, None).is_err());
    }
}
