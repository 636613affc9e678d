// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "test code")]

//! The same socket workload on every backend the platform offers.

mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::mpsc;

use common::{WAIT, log_to_test_output, repeating_bytes, with_watchdog};
use sio::buf::ByteBuffer;
use sio::{Backend, CompletedOp, Context, ContextConfig, Interest, OpKind, OpStatus, OptionId, Stream, StreamFlags, WaitStatus};

const CANDIDATES: [Backend; 6] = [
    Backend::IoUring,
    Backend::Epoll,
    Backend::Kqueue,
    Backend::Iocp,
    Backend::Poll,
    Backend::Select,
];

fn available() -> impl Iterator<Item = Backend> {
    CANDIDATES.into_iter().filter(|backend| backend.is_available())
}

fn listener() -> (Stream, SocketAddr) {
    let mut listener = Stream::tcp_listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), StreamFlags::NONBLOCK).unwrap();
    let port = listener.get_option(OptionId::LOCAL_PORT).unwrap().as_int().unwrap();
    (listener, SocketAddr::from((Ipv4Addr::LOCALHOST, u16::try_from(port).unwrap())))
}

fn run_until_done(context: &mut Context) {
    while context.pending_ops() > 0 {
        assert_ne!(context.wait(WAIT, 0).unwrap(), WaitStatus::TimedOut);
    }
}

#[test]
fn auto_picks_a_concrete_backend() {
    let context = Context::new(ContextConfig::new()).unwrap();

    assert_ne!(context.backend(), Backend::Auto);
    assert!(context.backend().is_available());
    assert!(available().any(|backend| backend == context.backend()));
}

#[test]
fn unavailable_backend_is_refused() {
    for backend in CANDIDATES.into_iter().filter(|backend| !backend.is_available()) {
        let error = Context::new(ContextConfig::new().backend(backend)).unwrap_err();

        assert_eq!(error.code(), sio::ErrorCode::Unsupported, "{backend}");
    }
}

#[test]
fn accept_then_transfer_on_every_backend() {
    let _logging = log_to_test_output();

    with_watchdog(|| {
        for backend in available() {
            let (mut listener, address) = listener();
            let mut context = Context::new(ContextConfig::new().backend(backend)).unwrap();
            let (sender, accepted) = mpsc::channel();

            context
                .register(&listener, Interest::ACCEPT, 1, move |event| {
                    sender.send(event.events()).unwrap();
                    ControlFlow::Break(())
                })
                .unwrap();

            let mut client = Stream::tcp_connect(address, StreamFlags::empty()).unwrap();
            assert_eq!(context.wait(WAIT, 0).unwrap(), WaitStatus::Completed(1), "{backend}");
            assert!(accepted.try_recv().unwrap().contains(Interest::ACCEPT), "{backend}");

            let (server, _peer) = listener.accept().unwrap();
            let payload = repeating_bytes(64 * 1024);
            let (sender, completed) = mpsc::channel::<CompletedOp>();

            let write_sender = sender.clone();
            context
                .write(&client, ByteBuffer::from_slice(&payload).unwrap())
                .with_user_data(2)
                .submit(move |op| write_sender.send(op).unwrap())
                .unwrap();
            context.flush_submissions().unwrap();
            run_until_done(&mut context);

            let write = completed.try_recv().unwrap();
            assert_eq!(write.kind(), OpKind::Write);
            assert_eq!(write.status(), OpStatus::Complete, "{backend}");
            assert!(write.bytes() > 0);

            let mut received = Vec::new();
            while received.len() < write.bytes() {
                let read_sender = sender.clone();
                context
                    .read(&server, ByteBuffer::new(16 * 1024).unwrap(), 16 * 1024)
                    .submit(move |op| read_sender.send(op).unwrap())
                    .unwrap();
                run_until_done(&mut context);

                let read = completed.try_recv().unwrap();
                assert_eq!(read.status(), OpStatus::Complete, "{backend}");
                assert!(read.bytes() > 0, "{backend}");
                received.extend_from_slice(read.buffer().as_slice());
            }

            assert_eq!(received, payload[..write.bytes()]);
            client.close().unwrap();
        }
    });
}

#[test]
fn hangup_is_delivered_on_every_backend() {
    with_watchdog(|| {
        for backend in available() {
            let (mut listener, address) = listener();
            let client = Stream::tcp_connect(address, StreamFlags::empty()).unwrap();
            let (server, _peer) = loop {
                match listener.accept() {
                    Ok(accepted) => break accepted,
                    Err(error) if error.is_would_block() => std::thread::yield_now(),
                    Err(error) => panic!("accept failed: {error}"),
                }
            };
            let mut context = Context::new(ContextConfig::new().backend(backend)).unwrap();
            let (sender, received) = mpsc::channel();

            context
                .register(&server, Interest::READABLE | Interest::CLOSE, 0, move |event| {
                    sender.send(event.events()).unwrap();
                    ControlFlow::Break(())
                })
                .unwrap();
            drop(client);

            assert_eq!(context.wait(WAIT, 0).unwrap(), WaitStatus::Completed(1), "{backend}");
            assert!(received.try_recv().unwrap().contains(Interest::READABLE), "{backend}");
        }
    });
}
