//! Paired construction across a real fork: role selection, per-side
//! runtimes, and bidirectional FIFO.
//!
//! Forks, so it lives alone in its own binary. The child reports results
//! through its exit status.

mod support;

use std::panic::AssertUnwindSafe;

use fdpasser::{Passer, PasserConfig};

use support::{pipe_with_byte, read_marker};

const PARENT_MARKERS: [u8; 2] = [10, 11];
const CHILD_MARKERS: [u8; 2] = [20, 21];

#[test]
fn paired_roles_across_fork() {
    // Constructing the passer installs no watchers, so it is fork-safe; the
    // runtimes are built per side afterwards.
    let passer = Passer::new(PasserConfig::default()).unwrap();

    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            let code = std::panic::catch_unwind(AssertUnwindSafe(move || child(passer)))
                .unwrap_or(101);
            std::process::exit(code);
        }
        pid => {
            parent(passer);

            let mut status = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
            assert_eq!(ret, pid);
            assert!(libc::WIFEXITED(status), "child did not exit cleanly");
            assert_eq!(libc::WEXITSTATUS(status), 0, "child failed");
        }
    }
}

fn parent(mut passer: Passer) {
    passer.i_am_parent().unwrap();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async move {
        let handle = passer.handle().unwrap();
        tokio::spawn(passer.drive());

        for marker in PARENT_MARKERS {
            let (read, _write) = pipe_with_byte(marker);
            handle.send_fh(read).await.unwrap();
        }
        for expected in CHILD_MARKERS {
            let fd = handle.recv_fh().await.unwrap();
            assert_eq!(read_marker(fd), expected);
        }
    });
}

fn child(mut passer: Passer) -> i32 {
    if passer.i_am_child().is_err() {
        return 2;
    }
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(_) => return 3,
    };
    rt.block_on(async move {
        let handle = match passer.handle() {
            Ok(handle) => handle,
            Err(_) => return 4,
        };
        tokio::spawn(passer.drive());

        for expected in PARENT_MARKERS {
            let fd = match handle.recv_fh().await {
                Ok(fd) => fd,
                Err(_) => return 5,
            };
            if read_marker(fd) != expected {
                return 6;
            }
        }
        for marker in CHILD_MARKERS {
            let (read, _write) = pipe_with_byte(marker);
            if handle.send_fh(read).await.is_err() {
                return 7;
            }
        }
        0
    })
}
