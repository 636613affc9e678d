// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The built-in stream kinds.
//!
//! Each kind lives in its own module, implements [`StreamOps`] for its native state and adds its
//! kind-specific constructors and operations to [`Stream`][crate::Stream]. [`Native`] is the
//! closed set of kinds a stream can hold.

use std::io::{IoSlice, IoSliceMut, SeekFrom};

use crate::pal::RawSource;
use crate::{IoFlags, OptionId, OptionValue, Result, StreamOps};

mod adopt;
mod buffer;
mod custom;
mod file;
mod memory;
mod msgqueue;
mod pipe;
mod shmem;
mod signal;
mod socket;
mod terminal;
mod timer;

pub(crate) use buffer::BufferDriver;
pub use file::{LockKind, LockWait};
pub(crate) use file::FileDriver;
pub(crate) use memory::MemoryDriver;
pub use msgqueue::MsgQueueAttrs;
pub(crate) use msgqueue::MsgQueueDriver;
pub(crate) use pipe::PipeDriver;
pub(crate) use shmem::ShmemDriver;
pub use signal::{SIGNAL_INFO_LEN, SignalInfo, SignalTarget};
pub(crate) use signal::SignalDriver;
pub(crate) use socket::SocketDriver;
pub(crate) use terminal::TerminalDriver;
pub use timer::{TIMER_READ_LEN, TIMER_RECORD_LEN, TimerSpec};
pub(crate) use timer::TimerDriver;

/// The native state of a stream, one variant per kind.
pub(crate) enum Native {
    File(FileDriver),
    Socket(SocketDriver),
    Pipe(PipeDriver),
    Timer(TimerDriver),
    Signal(SignalDriver),
    MsgQueue(MsgQueueDriver),
    Shmem(ShmemDriver),
    Terminal(TerminalDriver),
    Buffer(BufferDriver),
    Memory(MemoryDriver),
    Custom(Box<dyn StreamOps>),
}

macro_rules! dispatch {
    ($native:expr, $driver:ident => $body:expr) => {
        match $native {
            Native::File($driver) => $body,
            Native::Socket($driver) => $body,
            Native::Pipe($driver) => $body,
            Native::Timer($driver) => $body,
            Native::Signal($driver) => $body,
            Native::MsgQueue($driver) => $body,
            Native::Shmem($driver) => $body,
            Native::Terminal($driver) => $body,
            Native::Buffer($driver) => $body,
            Native::Memory($driver) => $body,
            Native::Custom($driver) => $body,
        }
    };
}

impl Native {
    /// The memory a kind exposes directly, if it has any.
    pub(crate) fn mapped(&self) -> Option<&[u8]> {
        match self {
            Self::File(file) => file.mapped(),
            Self::Shmem(shmem) => shmem.as_slice(),
            Self::Memory(memory) => memory.as_slice(),
            _ => None,
        }
    }

    pub(crate) fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::File(file) => file.mapped_mut(),
            Self::Shmem(shmem) => shmem.as_mut_slice(),
            Self::Memory(memory) => memory.as_mut_slice(),
            _ => None,
        }
    }
}

#[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
impl StreamOps for Native {
    fn read(&mut self, buf: &mut [u8], flags: IoFlags) -> Result<usize> {
        dispatch!(self, driver => driver.read(buf, flags))
    }

    fn write(&mut self, buf: &[u8], flags: IoFlags) -> Result<usize> {
        dispatch!(self, driver => driver.write(buf, flags))
    }

    fn has_vectored(&self) -> bool {
        dispatch!(self, driver => driver.has_vectored())
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>], flags: IoFlags) -> Result<usize> {
        dispatch!(self, driver => driver.read_vectored(bufs, flags))
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>], flags: IoFlags) -> Result<usize> {
        dispatch!(self, driver => driver.write_vectored(bufs, flags))
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        dispatch!(self, driver => driver.seek(pos))
    }

    fn tell(&mut self) -> Result<u64> {
        dispatch!(self, driver => driver.tell())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        dispatch!(self, driver => driver.truncate(len))
    }

    fn size(&mut self) -> Result<u64> {
        dispatch!(self, driver => driver.size())
    }

    fn flush(&mut self) -> Result<()> {
        dispatch!(self, driver => driver.flush())
    }

    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        dispatch!(self, driver => driver.get_option(id))
    }

    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        dispatch!(self, driver => driver.set_option(id, value))
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(self, driver => driver.close())
    }

    fn raw_source(&self) -> Option<RawSource> {
        dispatch!(self, driver => driver.raw_source())
    }

    fn forget_handle(&mut self) {
        dispatch!(self, driver => driver.forget_handle());
    }
}

/// Runs `call` until it fails with something other than an interruption.
pub(crate) fn retry<T>(call: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    #[cfg(unix)]
    {
        crate::pal::unix::retry(call)
    }
    #[cfg(windows)]
    {
        let mut call = call;
        call()
    }
}

/// Reads or writes at most `len` bytes of `region` starting at `position`, returning the count.
pub(crate) fn region_len(region_len: usize, position: usize, requested: usize) -> usize {
    region_len.saturating_sub(position).min(requested)
}

/// Resolves a seek against a region of `len` bytes with the cursor at `position`.
pub(crate) fn resolve_seek(pos: SeekFrom, position: u64, len: u64) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => position.checked_add_signed(delta),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
    };

    match target {
        Some(target) if target <= len => Ok(target),
        _ => Err(crate::Error::invalid_argument()),
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn region_len_clamps() {
        assert_eq!(region_len(10, 0, 4), 4);
        assert_eq!(region_len(10, 8, 4), 2);
        assert_eq!(region_len(10, 12, 4), 0);
    }

    #[test]
    fn seek_resolution() {
        assert_eq!(resolve_seek(SeekFrom::Start(3), 0, 10).unwrap(), 3);
        assert_eq!(resolve_seek(SeekFrom::Current(-2), 5, 10).unwrap(), 3);
        assert_eq!(resolve_seek(SeekFrom::End(0), 5, 10).unwrap(), 10);
        assert_eq!(resolve_seek(SeekFrom::End(1), 5, 10).unwrap_err().code(), ErrorCode::InvalidArgument);
        assert_eq!(resolve_seek(SeekFrom::Current(-6), 5, 10).unwrap_err().code(), ErrorCode::InvalidArgument);
    }
}
