// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Uniform stream I/O over files, sockets, pipes, timers, signals, message queues, shared memory,
//! terminals, byte buffers and memory regions.
//!
//! Every endpoint is a [`Stream`]. Streams share one surface: single-attempt and looping
//! transfers, vectored transfers, positioning, flushing and typed [options][OptionId]. A kind
//! answers operations it cannot perform with [`ErrorCode::Unsupported`]. Endpoints the library
//! does not know can be presented as streams through a caller-supplied [`StreamOps`] table.
//!
//! A [`Context`] multiplexes many streams: it delivers readiness [events][Event] to registered
//! callbacks and drives reads and writes that own their [`ByteBuffer`][buf::ByteBuffer] until
//! they finish. It runs on the best [backend][Backend] the platform offers (`io_uring` with the
//! `io-uring` feature, `epoll`, `kqueue`, I/O completion ports, `poll` or `select`).
//!
//! ```
//! use sio::{IoFlags, Stream, StreamFlags};
//!
//! let (mut reader, mut writer) = Stream::pipe(StreamFlags::empty())?;
//! writer.write_with(b"hello", IoFlags::DOALL)?;
//!
//! let mut buf = [0_u8; 5];
//! let transfer = reader.read_all(&mut buf)?;
//! assert_eq!(transfer.len(), 5);
//! assert_eq!(&buf, b"hello");
//! # Ok::<(), sio::Error>(())
//! ```
//!
//! Failures are reported as [`Error`], which carries a stable numeric [`ErrorCode`]. Diagnostics
//! are emitted as `tracing` events.

mod context;
mod drivers;
mod error;
mod flags;
mod init;
mod ops;
mod options;
pub mod pal;
mod stdio;
mod stream;

pub use context::{
    Backend, CompletedOp, Context, ContextConfig, DEFAULT_MAX_EVENTS, DEFAULT_URING_ENTRIES, Event, Interest, Notifier, OpBuilder, OpId,
    OpKind, OpStatus, SharedContext, WaitStatus,
};
pub use drivers::{LockKind, LockWait, MsgQueueAttrs, SIGNAL_INFO_LEN, SignalInfo, SignalTarget, TIMER_READ_LEN, TIMER_RECORD_LEN, TimerSpec};
pub use error::{Error, ErrorCode, Result};
pub use flags::{IoFlags, StreamFlags, StreamKind};
pub use init::{InitFlags, InitGuard, cleanup, init, initialize};
pub use ops::StreamOps;
pub use options::{OptionId, OptionValue};
pub use sio_buf as buf;
pub use stdio::{stderr, stdin, stdout};
pub use stream::{DEFAULT_BUFFER_SIZE, Stream, StreamId};
