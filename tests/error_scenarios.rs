//! Shutdown and failure paths: clean peer close, unusable endpoints, and
//! the exactly-once error notification.

mod support;

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use fdpasser::{Endpoints, Passer, PasserConfig, PasserError};

use support::{passer_pair, pipe_with_byte};

fn with_error_probe(endpoint: OwnedFd) -> (Passer, mpsc::Receiver<Option<String>>) {
    let (tx, rx) = mpsc::channel();
    let passer = Passer::new(PasserConfig {
        fh: Endpoints::Single(endpoint),
        on_error: Some(Box::new(move |reason| {
            let _ = tx.send(reason.map(|e| e.to_string()));
        })),
        ..PasserConfig::default()
    })
    .unwrap();
    (passer, rx)
}

#[tokio::test]
async fn peer_close_fails_waiters_with_null_reason() {
    support::init_tracing();
    let (a, b) = fdpasser::rendezvous::socketpair().unwrap();
    let (receiver, errors) = with_error_probe(a);
    let receiver_handle = receiver.handle().unwrap();
    let driver = tokio::spawn(receiver.drive());

    // The peer never drives; dropping its endpoint is a clean close.
    drop(b);

    let err = receiver_handle.recv_fh().await.unwrap_err();
    assert!(matches!(err, PasserError::Closed));

    driver.await.unwrap().unwrap();
    assert_eq!(errors.recv().unwrap(), None);
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn unusable_endpoint_is_fatal() {
    // A regular file cannot back readiness watching; the passer must fail
    // over to shutdown with the cause, abandoning queued work.
    let devnull = OwnedFd::from(std::fs::File::open("/dev/null").unwrap());
    let (mut passer, errors) = with_error_probe(devnull);

    let completions = Arc::new(AtomicUsize::new(0));
    let completions2 = completions.clone();
    let (read, _write) = pipe_with_byte(0);
    passer
        .push_send_fh(
            read,
            Some(Box::new(move |res| {
                assert!(matches!(res, Err(PasserError::ShutDown)));
                completions2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let result = passer.drive().await;
    assert!(matches!(result, Err(PasserError::Io(_))));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(errors.recv().unwrap().is_some());
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn local_shutdown_abandons_queued_sends() {
    let (a, _b) = fdpasser::rendezvous::socketpair().unwrap();
    let (mut sender, errors) = with_error_probe(a);

    let completions = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let completions = completions.clone();
        let (read, _write) = pipe_with_byte(0);
        sender
            .push_send_fh(
                read,
                Some(Box::new(move |res| {
                    assert!(matches!(res, Err(PasserError::ShutDown)));
                    completions.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    sender.shutdown();
    assert_eq!(completions.load(Ordering::SeqCst), 2);
    assert_eq!(errors.recv().unwrap(), None);

    // Terminal: the notification never fires again.
    sender.shutdown();
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn handle_reports_shutdown_after_drive_ends() {
    let (sender, _receiver) = passer_pair();
    let handle = sender.handle().unwrap();
    let driver = tokio::spawn(sender.drive());

    handle.shutdown();
    driver.await.unwrap().unwrap();

    assert!(matches!(
        handle.recv_fh().await.unwrap_err(),
        PasserError::ShutDown
    ));
    let (read, _write) = pipe_with_byte(0);
    assert!(matches!(
        handle.push_send_fh(read, None).unwrap_err(),
        PasserError::ShutDown
    ));
}

#[tokio::test]
async fn dropped_drive_future_fails_pending_waiters() {
    let (receiver, _peer) = passer_pair();
    let handle = receiver.handle().unwrap();
    let driver = tokio::spawn(receiver.drive());

    let pending = tokio::spawn({
        let handle = handle.clone();
        async move { handle.recv_fh().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    driver.abort();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, PasserError::ShutDown));
}
