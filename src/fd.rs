//! Descriptor-level plumbing shared by the transport, the sentinel, and the
//! rendezvous helpers.

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

fn read_flags(fd: RawFd, get_cmd: libc::c_int) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, get_cmd) };
    if flags < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(flags)
    }
}

/// Rewrite one of a descriptor's flag words through a get/set fcntl pair,
/// skipping the set when nothing would change.
fn update_flags(
    fd: RawFd,
    get_cmd: libc::c_int,
    set_cmd: libc::c_int,
    apply: impl FnOnce(libc::c_int) -> libc::c_int,
) -> io::Result<()> {
    let current = read_flags(fd, get_cmd)?;
    let wanted = apply(current);
    if wanted == current {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, set_cmd, wanted) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Switch a descriptor to non-blocking I/O.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    update_flags(fd, libc::F_GETFL, libc::F_SETFL, |flags| {
        flags | libc::O_NONBLOCK
    })
}

/// Whether `O_NONBLOCK` is currently set on a descriptor.
pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    Ok(read_flags(fd, libc::F_GETFL)? & libc::O_NONBLOCK != 0)
}

/// Mark a descriptor close-on-exec.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    update_flags(fd, libc::F_GETFD, libc::F_SETFD, |flags| {
        flags | libc::FD_CLOEXEC
    })
}

/// Let a descriptor survive exec, for handoff to a spawned child (see
/// [`EndpointHandle`]).
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    update_flags(fd, libc::F_GETFD, libc::F_SETFD, |flags| {
        flags & !libc::FD_CLOEXEC
    })
}

/// Check that `fd` names an open descriptor.
pub fn validate_fd(fd: RawFd) -> io::Result<()> {
    read_flags(fd, libc::F_GETFD).map(|_| ())
}

/// Duplicate `donor` into a fresh descriptor-table slot.
///
/// The duplicate carries close-on-exec; which descriptor is donated is
/// immaterial, only the slot matters.
pub fn duplicate_slot(donor: RawFd) -> io::Result<OwnedFd> {
    let ret = unsafe { libc::fcntl(donor, libc::F_DUPFD_CLOEXEC, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret) })
}

/// Whether an error reports descriptor-table exhaustion (per-process or
/// system-wide).
pub(crate) fn is_table_full(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// A channel endpoint staged for handoff to a spawned child.
///
/// Forked children inherit endpoints implicitly; spawned children only see
/// descriptors that survive exec, and have to be told which number to use.
/// Staging clears close-on-exec and pins the endpoint open until the spawn
/// has happened: put [`EndpointHandle::arg`] on the child's command line
/// under a flag of the caller's choosing, keep the handle alive until the
/// child is running, then drop it. The child reclaims the descriptor with
/// [`adopt_endpoint`].
pub struct EndpointHandle {
    endpoint: OwnedFd,
}

impl EndpointHandle {
    /// Stage `endpoint` for inheritance by clearing its close-on-exec flag.
    pub fn stage(endpoint: OwnedFd) -> io::Result<Self> {
        clear_cloexec(endpoint.as_raw_fd())?;
        Ok(Self { endpoint })
    }

    /// The descriptor number to put on the child's command line.
    pub fn arg(&self) -> String {
        self.endpoint.as_raw_fd().to_string()
    }

    /// Abandon the handoff and take the endpoint back, restoring
    /// close-on-exec.
    pub fn into_endpoint(self) -> io::Result<OwnedFd> {
        set_cloexec(self.endpoint.as_raw_fd())?;
        Ok(self.endpoint)
    }
}

/// Take ownership of an inherited endpoint named on the command line.
///
/// The descriptor is verified to be open before it is adopted, and marked
/// close-on-exec again so it stops leaking into further children. The
/// result is ready for single-endpoint passer construction.
///
/// # Safety
/// `arg` must name a descriptor this process inherited for this handoff;
/// nothing else may own or close it.
pub unsafe fn adopt_endpoint(arg: &str) -> io::Result<OwnedFd> {
    let raw: RawFd = arg.parse().map_err(|_| {
        io::Error::new(
            ErrorKind::InvalidInput,
            "endpoint argument is not a descriptor number",
        )
    })?;
    if raw < 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "endpoint argument names a negative descriptor",
        ));
    }
    validate_fd(raw)?;
    let endpoint = unsafe { OwnedFd::from_raw_fd(raw) };
    set_cloexec(raw)?;
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devnull() -> OwnedFd {
        let file = std::fs::File::open("/dev/null").unwrap();
        OwnedFd::from(file)
    }

    fn has_cloexec(fd: RawFd) -> bool {
        read_flags(fd, libc::F_GETFD).unwrap() & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn nonblocking_toggles() {
        let fd = devnull();
        assert!(!is_nonblocking(fd.as_raw_fd()).unwrap());
        set_nonblocking(fd.as_raw_fd()).unwrap();
        assert!(is_nonblocking(fd.as_raw_fd()).unwrap());
    }

    #[test]
    fn cloexec_toggles() {
        let fd = devnull();
        set_cloexec(fd.as_raw_fd()).unwrap();
        assert!(has_cloexec(fd.as_raw_fd()));
        clear_cloexec(fd.as_raw_fd()).unwrap();
        assert!(!has_cloexec(fd.as_raw_fd()));
    }

    #[test]
    fn duplicate_lands_in_new_slot() {
        let fd = devnull();
        let dup = duplicate_slot(fd.as_raw_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), fd.as_raw_fd());
        validate_fd(dup.as_raw_fd()).unwrap();
    }

    #[test]
    fn validate_rejects_closed_fd() {
        let fd = devnull();
        let raw = fd.as_raw_fd();
        drop(fd);
        assert!(validate_fd(raw).is_err());
    }

    #[test]
    fn staging_toggles_inheritance() {
        let fd = devnull();
        set_cloexec(fd.as_raw_fd()).unwrap();

        let handle = EndpointHandle::stage(fd).unwrap();
        let raw: RawFd = handle.arg().parse().unwrap();
        assert!(!has_cloexec(raw));

        let endpoint = handle.into_endpoint().unwrap();
        assert!(has_cloexec(endpoint.as_raw_fd()));
    }

    #[test]
    fn adoption_takes_ownership_and_revalidates() {
        let handle = EndpointHandle::stage(devnull()).unwrap();
        let arg = handle.arg();
        // The exec'd child starts with no owner for the inherited slot;
        // leaking the parent's ownership stands in for that here.
        std::mem::forget(handle);

        let endpoint = unsafe { adopt_endpoint(&arg).unwrap() };
        validate_fd(endpoint.as_raw_fd()).unwrap();
        assert!(has_cloexec(endpoint.as_raw_fd()));
    }

    #[test]
    fn adoption_rejects_malformed_arguments() {
        assert!(unsafe { adopt_endpoint("not-a-number") }.is_err());
        assert!(unsafe { adopt_endpoint("-3") }.is_err());
        assert!(unsafe { adopt_endpoint("") }.is_err());
    }

    #[test]
    fn adoption_rejects_closed_descriptors() {
        let fd = devnull();
        let arg = fd.as_raw_fd().to_string();
        drop(fd);
        assert!(unsafe { adopt_endpoint(&arg) }.is_err());
    }
}
