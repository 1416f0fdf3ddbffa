//! Tunnel relay tests: TLS client ⇄ session ⇄ plaintext backend.

use std::io::Write;
use std::thread;
use std::time::Duration;

mod common;

use common::{
    read_exact, reads_clean_eof, recv_transcript, send_close_notify, start_echo_backend,
    start_greeting_backend, start_stalled_backend, wait_until, Harness,
};

#[test]
fn relays_both_directions_in_order() {
    let mut harness = Harness::new();
    let (backend, mut transcripts) = start_echo_backend(&harness.runtime);
    let addr = harness.listen(16, |b| b.tunnel_to(backend));

    let mut client = harness.connect_client(addr);
    let mut sent = Vec::new();
    for i in 0..50u32 {
        let line = format!("line {i:03}\n");
        client.write_all(line.as_bytes()).unwrap();
        assert_eq!(read_exact(&mut client, line.len()), line.as_bytes());
        sent.extend_from_slice(line.as_bytes());
    }

    send_close_notify(&mut client);
    assert!(reads_clean_eof(&mut client));
    assert_eq!(recv_transcript(&harness.runtime, &mut transcripts), Some(sent));
    assert!(harness.wait_idle());
}

#[test]
fn large_transfers_survive_the_relay() {
    let mut harness = Harness::new();
    let (backend, mut transcripts) = start_echo_backend(&harness.runtime);
    let addr = harness.listen(16, |b| b.tunnel_to(backend));

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut client = harness.connect_client(addr);
    let mut echoed = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(10_000) {
        client.write_all(chunk).unwrap();
        echoed.extend_from_slice(&read_exact(&mut client, chunk.len()));
    }
    assert_eq!(echoed, payload);

    send_close_notify(&mut client);
    assert_eq!(recv_transcript(&harness.runtime, &mut transcripts), Some(payload));
}

#[test]
fn data_followed_at_once_by_close_notify_reaches_the_remote() {
    let mut harness = Harness::new();
    let (backend, mut transcripts) = start_echo_backend(&harness.runtime);
    let addr = harness.listen(16, |b| b.tunnel_to(backend));

    let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 241) as u8).collect();
    for _ in 0..10 {
        let mut client = harness.connect_client(addr);
        client.write_all(&payload).unwrap();
        send_close_notify(&mut client);
        assert_eq!(recv_transcript(&harness.runtime, &mut transcripts), Some(payload.clone()));
    }
    assert!(harness.wait_idle());
    assert_eq!(harness.metrics.snapshot().failures, 0);
}

#[test]
fn stalled_remote_pauses_unwrapping_without_losing_bytes() {
    let mut harness = Harness::new();
    let (backend, release, mut transcripts) = start_stalled_backend(&harness.runtime);
    let addr = harness.listen(16, |b| b.tunnel_to(backend));

    let payload: Vec<u8> = (0..16_000_000u32).map(|i| (i % 253) as u8).collect();
    let mut client = harness.connect_client(addr);
    let writer = {
        let payload = payload.clone();
        thread::spawn(move || {
            client.write_all(&payload).unwrap();
            send_close_notify(&mut client);
            client
        })
    };

    thread::sleep(Duration::from_millis(500));
    let paused_at = harness.metrics.snapshot().bytes_unwrapped;
    thread::sleep(Duration::from_millis(200));
    assert_eq!(harness.metrics.snapshot().bytes_unwrapped, paused_at);
    assert!((paused_at as usize) < payload.len());

    release.send(()).unwrap();
    let _client = writer.join().unwrap();
    assert_eq!(recv_transcript(&harness.runtime, &mut transcripts), Some(payload));
    assert!(harness.wait_idle());
}

#[test]
fn remote_close_closes_the_session_after_flushing() {
    let mut harness = Harness::new();
    let backend = start_greeting_backend(&harness.runtime, b"220 ready\r\n");
    let addr = harness.listen(16, |b| b.tunnel_to(backend));

    let mut client = harness.connect_client(addr);
    client.flush().unwrap();
    assert_eq!(read_exact(&mut client, 11), b"220 ready\r\n");
    assert!(reads_clean_eof(&mut client));
    assert!(harness.wait_idle());

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.bytes_wrapped, 11);
    assert_eq!(snapshot.failures, 0);
}

#[test]
fn unreachable_remote_fails_the_session() {
    let mut harness = Harness::new();
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let backend = unused.local_addr().unwrap();
    drop(unused);
    let addr = harness.listen(16, |b| b.tunnel_to(backend));

    let mut client = harness.connect_client(addr);
    client.write_all(b"anyone there?").unwrap();
    let mut buf = [0u8; 16];
    assert!(!matches!(std::io::Read::read(&mut client, &mut buf), Ok(n) if n > 0));

    assert!(harness.wait_idle());
    assert!(wait_until(Duration::from_secs(5), || harness.metrics.snapshot().failures == 1));
}
