//! Buffered, non-blocking file descriptor passing between cooperating
//! processes on the same host.
//!
//! A [`Passer`] wraps one pre-established endpoint (a UNIX-domain stream
//! socket, or a STREAMS pipe on the SysV back-end) and exposes two buffered
//! queues over it: descriptors pushed with [`Passer::push_send_fh`] are
//! flushed to the peer one per kernel message, and callbacks pushed with
//! [`Passer::push_recv_fh`] are satisfied with incoming descriptors in
//! strict arrival order. The peer receives an equivalent descriptor for the
//! same open file, socket, or pipe; blocking status travels with it.
//!
//! Transfers are never lost. Before every receive the passer vacates a
//! reserved descriptor-table slot (the sentinel), so the kernel always has
//! room to admit the incoming descriptor; when the slot cannot be
//! re-reserved the passer defers further receives to a periodic retry until
//! the table drains. Table exhaustion therefore delays deliveries instead
//! of dropping them.
//!
//! # Usage
//!
//! ## Fork
//!
//! ```ignore
//! use fdpasser::{Passer, PasserConfig};
//!
//! // Construction installs no watchers, so this is safe before fork.
//! let mut passer = Passer::new(PasserConfig::default())?;
//! match fork() {
//!     Parent => {
//!         passer.i_am_parent()?;
//!         let handle = passer.handle()?;
//!         tokio::spawn(passer.drive());
//!         handle.send_fh(fd).await?;
//!     }
//!     Child => {
//!         passer.i_am_child()?;
//!         let handle = passer.handle()?;
//!         tokio::spawn(passer.drive());
//!         let fd = handle.recv_fh().await?;
//!     }
//! }
//! ```
//!
//! ## Filesystem rendezvous
//!
//! ```ignore
//! use fdpasser::{Endpoints, Passer, PasserConfig, rendezvous};
//!
//! // One side:
//! let listener = rendezvous::server(path, None)?;
//! let endpoint = rendezvous::accept(&listener)?;
//! // Other side:
//! let endpoint = rendezvous::connect(path)?;
//!
//! let passer = Passer::new(PasserConfig {
//!     fh: Endpoints::Single(endpoint),
//!     ..PasserConfig::default()
//! })?;
//! ```
//!
//! # Caller contracts
//!
//! - A descriptor handed to `push_send_fh` belongs to the passer; it is
//!   closed locally once the kernel send completes. No userspace buffer or
//!   watcher may remain attached to it at that point.
//! - One `drive()` future serializes all descriptor movement; the passer is
//!   single-threaded cooperative and provides no internal locking.
//! - Between a sentinel release and the matching receive, nothing else in
//!   the process may consume descriptor-table slots asynchronously
//!   (e.g. a signal handler opening files).
//!
//! User data does not share the channel: run a separate control connection
//! for anything besides descriptors.

pub mod error;
pub mod fd;
pub mod queue;
pub mod rendezvous;
pub mod sentinel;
pub mod transport;

mod passer;

pub use error::PasserError;
pub use fd::{EndpointHandle, adopt_endpoint};
pub use passer::{
    DEFAULT_RETRY_INTERVAL, Endpoints, ErrorCallback, Passer, PasserConfig, PasserHandle,
};
pub use queue::{RecvDelivery, SendCompletion};
