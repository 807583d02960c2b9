//! Kernel mechanisms for moving exactly one descriptor per message over a
//! pre-established endpoint.
//!
//! Three back-ends share this interface: `SCM_RIGHTS` ancillary data on
//! stream sockets (the default), `msg_accrights` ancillary data (solarish),
//! and STREAMS `I_SENDFD`/`I_RECVFD` on pipes (`sysv-streams` feature). The
//! back-end is fixed at build time.
//!
//! The one-descriptor-per-call restriction is an invariant, not a
//! limitation: the receive path reserves exactly one descriptor-table slot
//! ahead of each transfer, so a batched message could not be admitted
//! atomically.
//!
//! The transport is stateless and performs no buffering; `WouldBlock` and
//! `TableFull` are reported as outcomes, everything else is an `io::Error`.

use std::io;
use std::os::fd::{OwnedFd, RawFd};

#[cfg(all(
    not(feature = "sysv-streams"),
    not(any(target_os = "solaris", target_os = "illumos"))
))]
mod scm_rights;
#[cfg(all(
    not(feature = "sysv-streams"),
    not(any(target_os = "solaris", target_os = "illumos"))
))]
use scm_rights as imp;

#[cfg(all(
    not(feature = "sysv-streams"),
    any(target_os = "solaris", target_os = "illumos")
))]
mod accrights;
#[cfg(all(
    not(feature = "sysv-streams"),
    any(target_os = "solaris", target_os = "illumos")
))]
use accrights as imp;

#[cfg(all(
    feature = "sysv-streams",
    any(target_os = "solaris", target_os = "illumos")
))]
mod streams;
#[cfg(all(
    feature = "sysv-streams",
    any(target_os = "solaris", target_os = "illumos")
))]
use streams as imp;

#[cfg(all(
    feature = "sysv-streams",
    not(any(target_os = "solaris", target_os = "illumos"))
))]
compile_error!("the sysv-streams back-end requires STREAMS pipes (solarish)");

/// Result of one send attempt.
#[derive(Debug)]
pub enum SendOutcome {
    /// The descriptor is in flight; the source may now be closed.
    Sent,
    /// The endpoint's buffer is full; retry on the next write-readiness.
    WouldBlock,
    /// The peer has closed its endpoint.
    Closed,
}

/// Result of one receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A descriptor was admitted into this process's table.
    Received(OwnedFd),
    /// Nothing pending; retry on the next read-readiness.
    WouldBlock,
    /// The kernel could not allocate a descriptor-table slot. Callers that
    /// reserved a slot beforehand must treat this as descriptor loss.
    TableFull,
    /// The peer has closed its endpoint.
    Closed,
}

/// Send exactly one descriptor over the endpoint.
pub fn send_one(endpoint: RawFd, fd: RawFd) -> io::Result<SendOutcome> {
    imp::send_one(endpoint, fd)
}

/// Receive exactly one descriptor from the endpoint.
pub fn recv_one(endpoint: RawFd) -> io::Result<RecvOutcome> {
    imp::recv_one(endpoint)
}

/// Create a connected endpoint pair suitable for passer construction: a
/// stream socketpair on the BSD back-ends, a full-duplex STREAMS pipe on
/// SysV.
pub fn endpoint_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    imp::endpoint_pair()
}
