//! End-to-end echo over a real RDMA device.
//!
//! These tests need an RDMA-capable device reachable at 127.0.0.1, e.g.
//! a SoftRoCE (rxe) device on the loopback interface, and are therefore
//! ignored by default. Run them with `cargo test -- --ignored`.

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use rcmecho::{EchoClient, EchoServer};

const PORT: u16 = 23456;

fn spawn_server(port: u16) -> (rcmecho::StopToken, thread::JoinHandle<(EchoServer, anyhow::Result<()>)>) {
    let mut server = EchoServer::new();
    let token = server.stop_token();
    let handle = thread::spawn(move || {
        let result = server.listen(Ipv4Addr::LOCALHOST, port);
        (server, result)
    });
    // Give the listener time to bind before clients connect.
    thread::sleep(Duration::from_millis(300));
    (token, handle)
}

#[test]
#[ignore = "requires an RDMA-capable device (e.g. rxe) on loopback"]
fn echo_round_trip() {
    let (token, server) = spawn_server(PORT);

    let mut client = EchoClient::connect("127.0.0.1", PORT).unwrap();
    client.post_send("hello").unwrap();
    assert_eq!(client.post_recv().unwrap(), "olleh");
    client.close().unwrap();

    token.stop();
    let (server, result) = server.join().unwrap();
    result.unwrap();
    assert_eq!(server.worker_count(), 0);
}

#[test]
#[ignore = "requires an RDMA-capable device (e.g. rxe) on loopback"]
fn concurrent_clients_do_not_cross_talk() {
    let (token, server) = spawn_server(PORT + 1);

    let clients: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let message = format!("message-{i}");
                let expected: String = message.chars().rev().collect();
                let mut client = EchoClient::connect("127.0.0.1", PORT + 1).unwrap();
                client.post_send(&message).unwrap();
                assert_eq!(client.post_recv().unwrap(), expected);
                client.close().unwrap();
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    token.stop();
    let (server, result) = server.join().unwrap();
    result.unwrap();
    assert_eq!(server.worker_count(), 0);
}

#[test]
#[ignore = "requires an RDMA-capable device (e.g. rxe) on loopback"]
fn boundary_payload_round_trips() {
    let (token, server) = spawn_server(PORT + 2);

    let message = "x".repeat(rcmecho::msg::BUF_SIZE - 1);
    let mut client = EchoClient::connect("127.0.0.1", PORT + 2).unwrap();
    client.post_send(&message).unwrap();
    assert_eq!(client.post_recv().unwrap().len(), message.len());

    // A payload at capacity is rejected, not truncated.
    let too_long = "x".repeat(rcmecho::msg::BUF_SIZE);
    assert!(client.post_send(&too_long).is_err());

    client.close().unwrap();
    token.stop();
    let (server, result) = server.join().unwrap();
    result.unwrap();
    assert_eq!(server.worker_count(), 0);
}
