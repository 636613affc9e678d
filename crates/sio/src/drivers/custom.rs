// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tracing::{Level, event};

use crate::drivers::Native;
use crate::stream::with_default_access;
use crate::{Stream, StreamFlags, StreamKind, StreamOps};

impl Stream {
    /// Adopts a caller-supplied operation table.
    ///
    /// The boxed value is the stream's private state and is dropped when the stream closes. The
    /// stream answers the generic options itself and forwards everything else to `ops`.
    ///
    /// # Example
    ///
    /// ```
    /// use sio::{IoFlags, Stream, StreamFlags, StreamOps};
    ///
    /// struct Zeroes;
    ///
    /// impl StreamOps for Zeroes {
    ///     fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> sio::Result<usize> {
    ///         buf.fill(0);
    ///         Ok(buf.len())
    ///     }
    /// }
    ///
    /// let mut stream = Stream::custom(Box::new(Zeroes), StreamFlags::READ);
    /// let mut buf = [1_u8; 4];
    /// stream.read(&mut buf)?;
    /// assert_eq!(buf, [0; 4]);
    /// # Ok::<(), sio::Error>(())
    /// ```
    #[must_use]
    pub fn custom(ops: Box<dyn StreamOps>, flags: StreamFlags) -> Self {
        let stream = Self::from_native(StreamKind::Custom, with_default_access(flags, StreamFlags::RDWR), Native::Custom(ops));
        event!(Level::TRACE, message = "adopted custom operations", id = %stream.id());
        stream
    }
}
