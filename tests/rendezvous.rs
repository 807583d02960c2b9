//! Filesystem rendezvous: server/accept/connect yielding passer-capable
//! endpoints.

mod support;

use fdpasser::rendezvous;

use support::{pipe_with_byte, read_marker, single};

#[tokio::test]
async fn rendezvous_endpoints_back_a_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("passer.sock");

    let listener = rendezvous::server(&path, None).unwrap();
    let accepted = std::thread::spawn(move || rendezvous::accept(&listener).unwrap());
    let client_end = rendezvous::connect(&path).unwrap();
    let server_end = accepted.join().unwrap();

    let server = single(server_end);
    let client = single(client_end);
    let server_handle = server.handle().unwrap();
    let client_handle = client.handle().unwrap();
    tokio::spawn(server.drive());
    tokio::spawn(client.drive());

    let (read, _write) = pipe_with_byte(0x33);
    server_handle.push_send_fh(read, None).unwrap();
    let fd = client_handle.recv_fh().await.unwrap();
    assert_eq!(read_marker(fd), 0x33);

    // Cleanup of the path is the caller's job; the tempdir handles it here.
}

#[test]
fn server_requires_a_fresh_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("passer.sock");

    let _first = rendezvous::server(&path, None).unwrap();
    assert!(rendezvous::server(&path, None).is_err());
}

#[test]
fn connect_to_nothing_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.sock");
    assert!(rendezvous::connect(&path).is_err());
}

#[tokio::test]
async fn accept_supports_multiple_clients() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("passer.sock");

    let listener = rendezvous::server(&path, Some(4)).unwrap();
    let accepted = std::thread::spawn(move || {
        let first = rendezvous::accept(&listener).unwrap();
        let second = rendezvous::accept(&listener).unwrap();
        (first, second)
    });

    let client_a = rendezvous::connect(&path).unwrap();
    let client_b = rendezvous::connect(&path).unwrap();
    let (server_a, server_b) = accepted.join().unwrap();

    for (server_end, client_end, marker) in [(server_a, client_a, 1u8), (server_b, client_b, 2u8)]
    {
        let server = single(server_end);
        let client = single(client_end);
        let server_handle = server.handle().unwrap();
        let client_handle = client.handle().unwrap();
        tokio::spawn(server.drive());
        tokio::spawn(client.drive());

        let (read, _write) = pipe_with_byte(marker);
        server_handle.push_send_fh(read, None).unwrap();
        assert_eq!(read_marker(client_handle.recv_fh().await.unwrap()), marker);
    }
}
