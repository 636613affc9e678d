// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "test code")]

//! End-to-end walks through the main stream kinds and the event context.

mod common;

use std::io::SeekFrom;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::{WAIT, log_to_test_output, repeating_bytes, with_watchdog};
use sio::buf::ByteBuffer;
use sio::{Context, ContextConfig, Interest, IoFlags, OpStatus, OptionId, Stream, StreamFlags, TimerSpec, WaitStatus};

const MIB: usize = 1024 * 1024;

#[test]
fn file_truncate_and_reopen() {
    let _logging = log_to_test_output();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncate.bin");

    let mut file = Stream::open_file(&path, StreamFlags::RDWR | StreamFlags::CREATE | StreamFlags::TRUNC).unwrap();
    let written = file.write_all(&[0xA5; 1024]).unwrap();
    assert_eq!(written.len(), 1024);
    assert_eq!(file.size().unwrap(), 1024);
    file.flush().unwrap();
    file.close().unwrap();

    // Truncation needs write access.
    let mut file = Stream::open_file(&path, StreamFlags::RDWR).unwrap();
    let mut contents = vec![0_u8; 1024];
    let transfer = file.read_all(&mut contents).unwrap();
    assert_eq!(transfer.len(), 1024);
    assert!(contents.iter().all(|byte| *byte == 0xA5));

    file.truncate(256).unwrap();
    assert_eq!(file.size().unwrap(), 256);

    file.seek(SeekFrom::Start(512)).unwrap();
    let mut buf = [0_u8; 64];
    let transfer = file.read(&mut buf).unwrap();

    assert_eq!(transfer.len(), 0);
    assert!(transfer.is_end_of_stream());
    assert!(file.is_eof());

    file.seek(SeekFrom::Start(0)).unwrap();
    let transfer = file.read_all(&mut buf).unwrap();
    assert_eq!(transfer.len(), 64);
    assert!(buf.iter().all(|byte| *byte == 0xA5));
}

#[test]
fn tcp_loopback_echo() {
    let _logging = log_to_test_output();

    with_watchdog(|| {
        let listener = Stream::tcp_listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), StreamFlags::empty()).unwrap();
        let mut listener = listener;
        let port = listener.get_option(OptionId::LOCAL_PORT).unwrap().as_int().unwrap();
        let port = u16::try_from(port).unwrap();
        assert_ne!(port, 0);

        let server = thread::spawn(move || {
            let (mut connection, _peer) = listener.accept().unwrap();
            let mut received = vec![0_u8; MIB];

            let transfer = connection.read_with(&mut received, IoFlags::DOALL).unwrap();
            assert_eq!(transfer.len(), MIB);
            connection.write_with(&received, IoFlags::DOALL).unwrap();
        });

        let payload = repeating_bytes(MIB);
        let mut client = Stream::tcp_connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), StreamFlags::empty()).unwrap();

        let sent = client.write_with(&payload, IoFlags::DOALL).unwrap();
        assert_eq!(sent.len(), MIB);

        let mut echoed = vec![0_u8; MIB];
        let received = client.read_with(&mut echoed, IoFlags::DOALL).unwrap();
        assert_eq!(received.len(), MIB);
        assert_eq!(echoed, payload);

        server.join().unwrap();
    });
}

#[test]
fn timer_fires_through_context() {
    let _logging = log_to_test_output();

    with_watchdog(|| {
        let start = Instant::now();
        let mut timer = Stream::timer(TimerSpec::once(Duration::from_millis(50)), StreamFlags::empty()).unwrap();
        let mut context = Context::new(ContextConfig::default()).unwrap();
        let (sender, received) = mpsc::channel();

        context
            .register(&timer, Interest::READABLE, 0, move |event| {
                sender.send((event.events(), start.elapsed())).unwrap();
                ControlFlow::Break(())
            })
            .unwrap();

        let status = context.wait(Some(Duration::from_millis(1000)), 0).unwrap();
        assert_eq!(status, WaitStatus::Completed(1));

        let (events, elapsed) = received.try_recv().unwrap();
        assert!(events.contains(Interest::READABLE));
        assert!(elapsed >= Duration::from_millis(45), "fired after {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(200), "fired after {elapsed:?}");

        let mut expirations = [0_u8; 8];
        timer.read(&mut expirations).unwrap();
        assert_eq!(u64::from_ne_bytes(expirations), 1);
    });
}

#[test]
fn cancel_before_any_wait() {
    let _logging = log_to_test_output();

    with_watchdog(|| {
        let (reader, _writer) = Stream::pipe(StreamFlags::empty()).unwrap();
        let mut context = Context::new(ContextConfig::default()).unwrap();
        let (sender, received) = mpsc::channel();

        let op = context
            .read(&reader, ByteBuffer::new(4096).unwrap(), 4096)
            .submit(move |completed| sender.send((completed.status(), completed.bytes())).unwrap())
            .unwrap();
        context.cancel(op).unwrap();

        while context.pending_ops() > 0 {
            context.wait(WAIT, 0).unwrap();
        }

        assert_eq!(received.try_recv().unwrap(), (OpStatus::Cancelled, 0));
        assert!(received.try_recv().is_err());
        assert_eq!(context.cancel(op).unwrap_err().code(), sio::ErrorCode::NotFound);
    });
}

#[test]
fn cancel_pending_pipe_read() {
    let _logging = log_to_test_output();

    with_watchdog(|| {
        let (reader, _writer) = Stream::pipe(StreamFlags::empty()).unwrap();
        let mut context = Context::new(ContextConfig::default()).unwrap();
        let (sender, received) = mpsc::channel();

        let op = context
            .read(&reader, ByteBuffer::new(64).unwrap(), 64)
            .submit(move |completed| sender.send((completed.status(), completed.bytes())).unwrap())
            .unwrap();
        assert_eq!(context.wait(Some(Duration::from_millis(20)), 0).unwrap(), WaitStatus::TimedOut);

        context.cancel(op).unwrap();
        while context.pending_ops() > 0 {
            context.wait(WAIT, 0).unwrap();
        }

        assert_eq!(received.try_recv().unwrap(), (OpStatus::Cancelled, 0));
        assert!(received.try_recv().is_err());
    });
}
