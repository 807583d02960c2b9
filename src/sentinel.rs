//! A reserved descriptor-table slot for incoming transfers.
//!
//! The sentinel is one deliberately wasted descriptor. Releasing it
//! immediately before a receive guarantees the kernel has a slot to install
//! the incoming descriptor into, which is what makes table exhaustion on the
//! receive side recoverable instead of lossy.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::fd;

/// Result of a reacquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reacquire {
    /// A slot is reserved again.
    Held,
    /// The table is exhausted; the sentinel stays vacated and the owner must
    /// retry later.
    TableFull,
}

/// One reserved slot in the process descriptor table, or the vacated state.
///
/// The slot is backed by a pipe end that never carries data; only its entry
/// in the table matters.
#[derive(Debug)]
pub struct Sentinel {
    slot: Option<OwnedFd>,
}

impl Sentinel {
    /// Reserve a slot. If the table is already exhausted the sentinel starts
    /// out vacated rather than failing construction.
    pub fn new() -> io::Result<Self> {
        match allocate_pipe_end() {
            Ok(slot) => Ok(Self { slot: Some(slot) }),
            Err(err) if fd::is_table_full(&err) => Ok(Self { slot: None }),
            Err(err) => Err(err),
        }
    }

    /// A sentinel with no slot reserved.
    pub fn vacated() -> Self {
        Self { slot: None }
    }

    pub fn is_held(&self) -> bool {
        self.slot.is_some()
    }

    /// Free the reserved slot. No-op when already vacated.
    pub fn release(&mut self) {
        self.slot = None;
    }

    /// Re-reserve a slot by duplicating `donor` (any descriptor the caller
    /// keeps open). No-op when already held.
    pub fn reacquire(&mut self, donor: RawFd) -> io::Result<Reacquire> {
        if self.slot.is_some() {
            return Ok(Reacquire::Held);
        }
        match fd::duplicate_slot(donor) {
            Ok(slot) => {
                self.slot = Some(slot);
                Ok(Reacquire::Held)
            }
            Err(err) if fd::is_table_full(&err) => Ok(Reacquire::TableFull),
            Err(err) => Err(err),
        }
    }
}

/// Allocate a pipe and keep only the read end; the write end is closed
/// immediately. Which end survives is immaterial.
fn allocate_pipe_end() -> io::Result<OwnedFd> {
    let mut fds = [0i32; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    drop(write);

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        use std::os::fd::AsRawFd;
        fd::set_cloexec(read.as_raw_fd())?;
    }

    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn starts_held() {
        let sentinel = Sentinel::new().unwrap();
        assert!(sentinel.is_held());
    }

    #[test]
    fn release_then_reacquire() {
        let donor = std::fs::File::open("/dev/null").unwrap();
        let mut sentinel = Sentinel::new().unwrap();

        sentinel.release();
        assert!(!sentinel.is_held());

        let outcome = sentinel.reacquire(donor.as_raw_fd()).unwrap();
        assert_eq!(outcome, Reacquire::Held);
        assert!(sentinel.is_held());
    }

    #[test]
    fn reacquire_while_held_is_noop() {
        let donor = std::fs::File::open("/dev/null").unwrap();
        let mut sentinel = Sentinel::new().unwrap();
        assert_eq!(
            sentinel.reacquire(donor.as_raw_fd()).unwrap(),
            Reacquire::Held
        );
    }

    #[test]
    fn vacated_holds_nothing() {
        let sentinel = Sentinel::vacated();
        assert!(!sentinel.is_held());
    }

    #[test]
    fn reacquire_with_bad_donor_is_an_error() {
        let mut sentinel = Sentinel::vacated();
        assert!(sentinel.reacquire(-1).is_err());
    }
}
