// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "test code")]

mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{WAIT, with_watchdog};
use sio::{Context, ContextConfig, Interest, Stream, StreamFlags, WaitStatus};

#[test]
fn datagrams_keep_their_boundaries() {
    let any = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let mut server = Stream::udp_bind(any, StreamFlags::empty()).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Stream::udp_bind(any, StreamFlags::empty()).unwrap();

    client.send_to(b"first", server_addr).unwrap();
    client.send_to(b"second datagram", server_addr).unwrap();

    let mut buf = [0_u8; 64];
    let (transfer, from) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..transfer.len()], b"first");
    assert_eq!(from, client.local_addr().unwrap());

    let (transfer, _from) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..transfer.len()], b"second datagram");
}

#[test]
fn connected_datagram_uses_plain_transfers() {
    let mut server = Stream::udp_bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), StreamFlags::empty()).unwrap();
    let mut client = Stream::udp_connect(server.local_addr().unwrap(), StreamFlags::empty()).unwrap();

    let sent = client.write(b"ping").unwrap();
    assert_eq!(sent.len(), 4);

    let mut buf = [0_u8; 16];
    let (received, from) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..received.len()], b"ping");

    server.send_to(b"pong", from).unwrap();
    let received = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..received.len()], b"pong");
}

#[test]
fn readiness_counts_each_datagram() {
    with_watchdog(|| {
        let mut server = Stream::udp_bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), StreamFlags::NONBLOCK).unwrap();
        let mut client = Stream::udp_connect(server.local_addr().unwrap(), StreamFlags::empty()).unwrap();
        let mut context = Context::new(ContextConfig::default()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        context
            .register(&server, Interest::READABLE, 7, move |event| {
                assert_eq!(event.user_data(), 7);
                counter.fetch_add(1, Ordering::Relaxed);
                ControlFlow::Continue(())
            })
            .unwrap();

        client.write(b"one").unwrap();
        assert_eq!(context.wait(WAIT, 0).unwrap(), WaitStatus::Completed(1));

        let mut buf = [0_u8; 8];
        server.read(&mut buf).unwrap();
        assert!(server.read(&mut buf).unwrap_err().is_would_block());
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        context.unregister(&server).unwrap();
        assert!(!context.is_registered(server.id()));
    });
}
