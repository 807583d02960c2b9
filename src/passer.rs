//! The passer: buffered, bidirectional descriptor transfer over one
//! endpoint.
//!
//! A [`Passer`] is constructed inert: no readiness watchers are installed
//! and nothing is spawned, so a paired passer can be created before `fork`
//! and each side can settle its role afterwards. All descriptor movement
//! happens inside [`Passer::drive`], a future that must be spawned or
//! awaited on the host runtime; a [`PasserHandle`] feeds it further work
//! over a command channel.
//!
//! The receive path upholds the sentinel protocol: one descriptor-table
//! slot is vacated immediately before every receive attempt, so the kernel
//! always has room to install an incoming descriptor. When the slot cannot
//! be re-reserved afterwards the passer defers further receives to a
//! periodic retry instead of letting the kernel drop transfers.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::error::PasserError;
use crate::fd;
use crate::queue::{FailReason, RecvDelivery, RecvQueue, SendCompletion, SendQueue};
use crate::sentinel::{Reacquire, Sentinel};
use crate::transport::{self, RecvOutcome, SendOutcome};

/// Shutdown notification: `None` for an orderly shutdown (local request or
/// clean peer close), `Some` for the transport failure that ended the
/// passer. Invoked at most once per passer lifetime.
pub type ErrorCallback = Box<dyn FnOnce(Option<&PasserError>) + Send + 'static>;

/// Interval between sentinel reacquisition attempts while the descriptor
/// table is exhausted.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Endpoint arrangement a passer is constructed with.
#[derive(Debug, Default)]
pub enum Endpoints {
    /// Create an internal endpoint pair; the caller forks and each side
    /// settles its role with `i_am_parent` / `i_am_child`.
    #[default]
    None,
    /// A single endpoint established externally (see [`crate::rendezvous`]);
    /// no role selection is needed.
    Single(OwnedFd),
    /// A caller-provided pair; the caller forks and settles roles.
    Pair(OwnedFd, OwnedFd),
}

/// Construction options for [`Passer::new`].
pub struct PasserConfig {
    /// Endpoint arrangement.
    pub fh: Endpoints,
    /// Skip the non-blocking transition on the endpoint. The caller then
    /// asserts the endpoint is already non-blocking; spurious readiness from
    /// some event sources can otherwise turn into a blocking syscall.
    pub dont_set_nonblocking: bool,
    /// Shutdown notification.
    pub on_error: Option<ErrorCallback>,
    /// Sentinel reacquisition cadence under descriptor-table pressure.
    pub retry_interval: Duration,
}

impl Default for PasserConfig {
    fn default() -> Self {
        Self {
            fh: Endpoints::None,
            dont_set_nonblocking: false,
            on_error: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Parent,
    Child,
    Single,
}

enum RoleState {
    /// Two endpoints awaiting `i_am_parent` / `i_am_child`.
    Paired {
        parent_end: OwnedFd,
        child_end: OwnedFd,
    },
    /// One retained endpoint; the passer is operational.
    Settled { endpoint: OwnedFd, role: Role },
    /// Terminal.
    Terminated,
}

enum Command {
    Send {
        fd: OwnedFd,
        done: Option<SendCompletion>,
    },
    Recv {
        deliver: RecvDelivery,
    },
    Shutdown,
}

/// Buffered descriptor-passing channel over one endpoint.
pub struct Passer {
    role: RoleState,
    send_q: SendQueue,
    recv_q: RecvQueue,
    on_error: Option<ErrorCallback>,
    dont_set_nonblocking: bool,
    retry_interval: Duration,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Passer {
    /// Build a passer from the configured endpoints. With
    /// [`Endpoints::None`] an internal pair is created via the active
    /// transport back-end.
    pub fn new(config: PasserConfig) -> Result<Self, PasserError> {
        let PasserConfig {
            fh,
            dont_set_nonblocking,
            on_error,
            retry_interval,
        } = config;

        let role = match fh {
            Endpoints::None => {
                let (parent_end, child_end) = transport::endpoint_pair()?;
                RoleState::Paired {
                    parent_end,
                    child_end,
                }
            }
            Endpoints::Single(endpoint) => RoleState::Settled {
                endpoint,
                role: Role::Single,
            },
            Endpoints::Pair(parent_end, child_end) => RoleState::Paired {
                parent_end,
                child_end,
            },
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Self {
            role,
            send_q: SendQueue::new(),
            recv_q: RecvQueue::new(),
            on_error,
            dont_set_nonblocking,
            retry_interval,
            cmd_tx,
            cmd_rx,
        })
    }

    /// After `fork`: keep the parent endpoint, close the child one.
    pub fn i_am_parent(&mut self) -> Result<(), PasserError> {
        self.settle(Role::Parent)
    }

    /// After `fork`: keep the child endpoint, close the parent one.
    pub fn i_am_child(&mut self) -> Result<(), PasserError> {
        self.settle(Role::Child)
    }

    fn settle(&mut self, role: Role) -> Result<(), PasserError> {
        match mem::replace(&mut self.role, RoleState::Terminated) {
            RoleState::Paired {
                parent_end,
                child_end,
            } => {
                let endpoint = match role {
                    Role::Child => {
                        drop(parent_end);
                        child_end
                    }
                    _ => {
                        drop(child_end);
                        parent_end
                    }
                };
                self.role = RoleState::Settled { endpoint, role };
                Ok(())
            }
            other => {
                self.role = other;
                Err(PasserError::Programmer(
                    "role selection requires a paired passer that has not settled yet",
                ))
            }
        }
    }

    /// Enqueue a descriptor for transfer to the peer.
    ///
    /// Ownership of `fd` moves to the passer unconditionally; after a
    /// successful kernel send the passer closes it and invokes `done`. The
    /// call never blocks and never performs I/O itself.
    pub fn push_send_fh(
        &mut self,
        fd: OwnedFd,
        done: Option<SendCompletion>,
    ) -> Result<(), PasserError> {
        match &self.role {
            RoleState::Settled { .. } => {
                self.send_q.push(fd, done);
                Ok(())
            }
            RoleState::Paired { .. } => Err(PasserError::Programmer(
                "push_send_fh before i_am_parent/i_am_child on a paired passer",
            )),
            RoleState::Terminated => Err(PasserError::ShutDown),
        }
    }

    /// Enqueue a delivery callback for the next incoming descriptor.
    ///
    /// Waiters are satisfied strictly in arrival order. The call never
    /// blocks; if the passer is deferring receives under descriptor-table
    /// pressure the waiter is satisfied once the retry succeeds.
    pub fn push_recv_fh(&mut self, deliver: RecvDelivery) -> Result<(), PasserError> {
        match &self.role {
            RoleState::Settled { .. } => {
                self.recv_q.push(deliver);
                Ok(())
            }
            RoleState::Paired { .. } => Err(PasserError::Programmer(
                "push_recv_fh before i_am_parent/i_am_child on a paired passer",
            )),
            RoleState::Terminated => Err(PasserError::ShutDown),
        }
    }

    /// A cloneable handle for feeding the passer while [`Passer::drive`]
    /// runs. Requires a settled role.
    pub fn handle(&self) -> Result<PasserHandle, PasserError> {
        match &self.role {
            RoleState::Settled { .. } => Ok(PasserHandle {
                cmd_tx: self.cmd_tx.clone(),
            }),
            RoleState::Paired { .. } => Err(PasserError::Programmer(
                "handle() before i_am_parent/i_am_child on a paired passer",
            )),
            RoleState::Terminated => Err(PasserError::ShutDown),
        }
    }

    /// Tear the passer down: close queued send descriptors, fail pending
    /// recv waiters, close the endpoint, and fire the shutdown notification
    /// with a null reason. Idempotent.
    pub fn shutdown(&mut self) {
        self.role = RoleState::Terminated;
        self.cmd_rx.close();
        self.send_q.fail_all(FailReason::ShutDown);
        self.recv_q.fail_all(FailReason::ShutDown);
        if let Some(on_error) = self.on_error.take() {
            on_error(None);
        }
    }

    /// Run the passer until shutdown.
    ///
    /// This is where readiness watchers are registered, so it must be
    /// awaited or spawned on the host runtime — after `fork`, on the runtime
    /// of the surviving side. Returns `Ok(())` on orderly shutdown (local
    /// request, clean peer close, or all handles dropped with the queues
    /// drained) and the failure otherwise; the `on_error` callback observes
    /// the same outcome.
    pub async fn drive(self) -> Result<(), PasserError> {
        let Passer {
            role,
            send_q,
            recv_q,
            on_error,
            dont_set_nonblocking,
            retry_interval,
            cmd_tx,
            cmd_rx,
        } = self;
        // Once dropped, a closed command stream means no handle remains.
        drop(cmd_tx);

        let (endpoint, role_kind) = match role {
            RoleState::Settled { endpoint, role } => (endpoint, role),
            RoleState::Paired { .. } => {
                return Err(PasserError::Programmer(
                    "drive() before i_am_parent/i_am_child on a paired passer",
                ));
            }
            RoleState::Terminated => return Err(PasserError::ShutDown),
        };

        let mut driver = Driver {
            send_q,
            recv_q,
            sentinel: Sentinel::vacated(),
            retry: false,
            retry_interval,
            cmd_rx,
            cmd_closed: false,
            on_error,
            finished: false,
        };

        tracing::debug!(role = ?role_kind, fd = endpoint.as_raw_fd(), "passer driving");

        if !dont_set_nonblocking {
            if let Err(e) = fd::set_nonblocking(endpoint.as_raw_fd()) {
                return Err(driver.fatal(e.into()));
            }
        }

        let endpoint = match AsyncFd::new(endpoint) {
            Ok(endpoint) => endpoint,
            Err(e) => return Err(driver.fatal(e.into())),
        };

        match Sentinel::new() {
            Ok(sentinel) => {
                driver.retry = !sentinel.is_held();
                driver.sentinel = sentinel;
            }
            Err(e) => return Err(driver.fatal(e.into())),
        }

        driver.run(endpoint).await
    }
}

/// Cloneable handle issuing work to a driven [`Passer`].
#[derive(Clone, Debug)]
pub struct PasserHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl PasserHandle {
    /// Enqueue a descriptor for transfer; see [`Passer::push_send_fh`].
    ///
    /// Fails with [`PasserError::ShutDown`] (closing `fd`) once the driver
    /// has finished.
    pub fn push_send_fh(
        &self,
        fd: OwnedFd,
        done: Option<SendCompletion>,
    ) -> Result<(), PasserError> {
        self.cmd_tx
            .send(Command::Send { fd, done })
            .map_err(|_| PasserError::ShutDown)
    }

    /// Enqueue a delivery callback; see [`Passer::push_recv_fh`].
    pub fn push_recv_fh(&self, deliver: RecvDelivery) -> Result<(), PasserError> {
        self.cmd_tx
            .send(Command::Recv { deliver })
            .map_err(|_| PasserError::ShutDown)
    }

    /// Request an orderly shutdown of the driver.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Transfer one descriptor and wait for the kernel send to complete.
    pub async fn send_fh(&self, fd: OwnedFd) -> Result<(), PasserError> {
        let (tx, rx) = oneshot::channel();
        self.push_send_fh(
            fd,
            Some(Box::new(move |res| {
                let _ = tx.send(res);
            })),
        )?;
        rx.await.map_err(|_| PasserError::ShutDown)?
    }

    /// Wait for the next incoming descriptor.
    pub async fn recv_fh(&self) -> Result<OwnedFd, PasserError> {
        let (tx, rx) = oneshot::channel();
        self.push_recv_fh(Box::new(move |res| {
            let _ = tx.send(res);
        }))?;
        rx.await.map_err(|_| PasserError::ShutDown)?
    }
}

enum Flow {
    Continue,
    PeerClosed,
}

enum FinishCause<'a> {
    Orderly,
    PeerClosed,
    Fatal(&'a PasserError),
}

struct Driver {
    send_q: SendQueue,
    recv_q: RecvQueue,
    sentinel: Sentinel,
    retry: bool,
    retry_interval: Duration,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_closed: bool,
    on_error: Option<ErrorCallback>,
    finished: bool,
}

impl Driver {
    async fn run(mut self, endpoint: AsyncFd<OwnedFd>) -> Result<(), PasserError> {
        let raw = endpoint.get_ref().as_raw_fd();

        loop {
            if self.cmd_closed && self.send_q.is_empty() && self.recv_q.is_empty() {
                // No handle remains and all buffered work is done.
                self.finish(FinishCause::Orderly);
                return Ok(());
            }

            let want_write = !self.send_q.is_empty();
            let want_read = !self.recv_q.is_empty() && !self.retry;

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv(), if !self.cmd_closed => match cmd {
                    Some(Command::Send { fd, done }) => self.send_q.push(fd, done),
                    Some(Command::Recv { deliver }) => self.recv_q.push(deliver),
                    Some(Command::Shutdown) => {
                        self.finish(FinishCause::Orderly);
                        return Ok(());
                    }
                    None => self.cmd_closed = true,
                },

                ready = endpoint.writable(), if want_write => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => return Err(self.fatal(e.into())),
                    };
                    match self.drain_send(raw, &mut guard) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::PeerClosed) => {
                            self.finish(FinishCause::PeerClosed);
                            return Ok(());
                        }
                        Err(e) => return Err(self.fatal(e)),
                    }
                }

                ready = endpoint.readable(), if want_read => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => return Err(self.fatal(e.into())),
                    };
                    match self.drain_recv(raw, &mut guard) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::PeerClosed) => {
                            self.finish(FinishCause::PeerClosed);
                            return Ok(());
                        }
                        Err(e) => return Err(self.fatal(e)),
                    }
                }

                _ = time::sleep(self.retry_interval), if self.retry => {
                    match self.sentinel.reacquire(raw) {
                        Ok(Reacquire::Held) => {
                            tracing::debug!("sentinel reacquired, resuming receives");
                            self.retry = false;
                        }
                        Ok(Reacquire::TableFull) => {}
                        Err(e) => return Err(self.fatal(e.into())),
                    }
                }
            }
        }
    }

    /// Flush the send queue head-first while the endpoint stays writable.
    fn drain_send(
        &mut self,
        raw: RawFd,
        guard: &mut AsyncFdReadyGuard<'_, OwnedFd>,
    ) -> Result<Flow, PasserError> {
        while let Some(head) = self.send_q.head_fd() {
            match transport::send_one(raw, head)? {
                SendOutcome::Sent => self.send_q.complete_head(),
                SendOutcome::WouldBlock => {
                    guard.clear_ready();
                    break;
                }
                SendOutcome::Closed => {
                    self.send_q.fail_head(FailReason::Closed);
                    return Ok(Flow::PeerClosed);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Satisfy recv waiters while the endpoint stays readable, upholding the
    /// sentinel protocol: vacate one table slot before each receive, then
    /// re-reserve it whatever the outcome.
    fn drain_recv(
        &mut self,
        raw: RawFd,
        guard: &mut AsyncFdReadyGuard<'_, OwnedFd>,
    ) -> Result<Flow, PasserError> {
        while !self.recv_q.is_empty() {
            self.sentinel.release();
            let outcome = transport::recv_one(raw);
            let reacquired = self.sentinel.reacquire(raw);

            match outcome {
                Ok(RecvOutcome::Received(fd)) => {
                    if let Some(deliver) = self.recv_q.pop() {
                        deliver(Ok(fd));
                    }
                    match reacquired {
                        Ok(Reacquire::Held) => {}
                        Ok(Reacquire::TableFull) => {
                            tracing::debug!("descriptor table exhausted, deferring receives");
                            self.retry = true;
                            return Ok(Flow::Continue);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(RecvOutcome::WouldBlock) => {
                    guard.clear_ready();
                    match reacquired {
                        Ok(Reacquire::Held) => {}
                        Ok(Reacquire::TableFull) => {
                            tracing::debug!("descriptor table exhausted, deferring receives");
                            self.retry = true;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    return Ok(Flow::Continue);
                }
                Ok(RecvOutcome::TableFull) => {
                    // The slot vacated by the sentinel should have admitted
                    // the transfer; the kernel dropped an in-flight
                    // descriptor.
                    return Err(PasserError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "incoming descriptor dropped despite a reserved slot",
                    )));
                }
                Ok(RecvOutcome::Closed) => return Ok(Flow::PeerClosed),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Flow::Continue)
    }

    fn fatal(&mut self, err: PasserError) -> PasserError {
        tracing::warn!(error = %err, "passer failed");
        self.finish(FinishCause::Fatal(&err));
        err
    }

    fn finish(&mut self, cause: FinishCause<'_>) {
        if self.finished {
            return;
        }
        self.finished = true;

        tracing::debug!(
            queued_sends = self.send_q.len(),
            pending_recvs = self.recv_q.len(),
            "passer finished"
        );

        let reason = match cause {
            FinishCause::PeerClosed => FailReason::Closed,
            _ => FailReason::ShutDown,
        };
        self.send_q.fail_all(reason);
        self.recv_q.fail_all(reason);
        self.sentinel.release();
        self.retry = false;
        self.cmd_rx.close();

        if let Some(on_error) = self.on_error.take() {
            match cause {
                FinishCause::Fatal(err) => on_error(Some(err)),
                _ => on_error(None),
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Covers a drive() future dropped mid-flight: pending work is
        // failed and the shutdown notification still fires.
        self.finish(FinishCause::Orderly);
    }
}
