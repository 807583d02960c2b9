#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};

use fdpasser::{Endpoints, Passer, PasserConfig, rendezvous};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A passer over one end of a socketpair, role already settled.
pub fn single(endpoint: OwnedFd) -> Passer {
    Passer::new(PasserConfig {
        fh: Endpoints::Single(endpoint),
        ..PasserConfig::default()
    })
    .unwrap()
}

/// Two connected passers in this process.
pub fn passer_pair() -> (Passer, Passer) {
    let (a, b) = rendezvous::socketpair().unwrap();
    (single(a), single(b))
}

/// A pipe read end with one marker byte already buffered, plus the write
/// end keeping the pipe alive.
pub fn pipe_with_byte(byte: u8) -> (OwnedFd, File) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let mut write = File::from(unsafe { OwnedFd::from_raw_fd(fds[1]) });
    write.write_all(&[byte]).unwrap();
    (read, write)
}

/// Read the marker byte buffered behind a received descriptor.
pub fn read_marker(fd: OwnedFd) -> u8 {
    let mut buf = [0u8; 1];
    File::from(fd).read_exact(&mut buf).unwrap();
    buf[0]
}
