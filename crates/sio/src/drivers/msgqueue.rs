// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::drivers::Native;
use crate::pal::RawSource;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, OptionId, OptionValue, Result, Stream, StreamFlags, StreamKind, StreamOps};

/// Capacity of a message queue created by [`Stream::msgqueue()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgQueueAttrs {
    /// Maximum number of messages held at once.
    pub max_messages: usize,
    /// Maximum size of one message, in bytes.
    pub message_size: usize,
}

impl Default for MsgQueueAttrs {
    fn default() -> Self {
        Self {
            max_messages: 10,
            message_size: 8192,
        }
    }
}

pub(crate) struct MsgQueueDriver {
    queue: Option<sys::Queue>,
    priority: u32,
}

impl MsgQueueDriver {
    fn queue(&mut self) -> Result<&mut sys::Queue> {
        self.queue.as_mut().ok_or(Error::Code(ErrorCode::BadHandle))
    }
}

impl StreamOps for MsgQueueDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        self.queue()?.receive(buf)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        let priority = self.priority;
        self.queue()?.send(buf, priority)
    }

    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        let to_int = |value: usize| OptionValue::Int(i64::try_from(value).unwrap_or(i64::MAX));

        match id {
            OptionId::MSGQ_PRIORITY => Ok(OptionValue::Int(i64::from(self.priority))),
            OptionId::MSGQ_MAX_MESSAGES => Ok(to_int(self.queue()?.status()?.max_messages)),
            OptionId::MSGQ_MESSAGE_SIZE => Ok(to_int(self.queue()?.status()?.message_size)),
            OptionId::MSGQ_CURRENT_MESSAGES => Ok(to_int(self.queue()?.status()?.current_messages)),
            _ => Err(Error::unsupported()),
        }
    }

    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        match id {
            OptionId::MSGQ_PRIORITY => {
                self.priority = u32::try_from(value.as_int()?).map_err(|_out_of_range| Error::invalid_argument())?;
                Ok(())
            }
            OptionId::BLOCKING => self.queue()?.set_nonblocking(!value.as_bool()?),
            _ => Err(Error::unsupported()),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.queue.take() {
            Some(queue) => queue.close(),
            None => Ok(()),
        }
    }

    fn raw_source(&self) -> Option<RawSource> {
        self.queue.as_ref().and_then(sys::Queue::source)
    }

    fn forget_handle(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.forget();
        }
    }
}

/// A snapshot of a queue's attributes and fill level.
struct QueueStatus {
    max_messages: usize,
    message_size: usize,
    current_messages: usize,
}

impl Stream {
    /// Opens or creates the named message queue.
    ///
    /// Each read receives one whole message, highest priority first; a buffer smaller than the
    /// queue's message size fails with [`ErrorCode::BufferTooSmall`]. Each write sends one
    /// message with the priority set through [`OptionId::MSGQ_PRIORITY`].
    ///
    /// On Linux this is a POSIX message queue; `attrs` applies when [`StreamFlags::CREATE`]
    /// creates it. On Windows this is a mailslot: a stream opened for reading creates the slot and
    /// a write-only stream connects to an existing one.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if the queue does not exist and `CREATE` is not set,
    /// [`ErrorCode::AlreadyExists`] for `CREATE | EXCL` on an existing queue,
    /// [`ErrorCode::Unsupported`] on platforms without message queues.
    pub fn msgqueue(name: &str, flags: StreamFlags, attrs: MsgQueueAttrs) -> Result<Self> {
        let flags = with_default_access(flags, StreamFlags::RDWR);
        let driver = MsgQueueDriver {
            queue: Some(sys::Queue::open(name, flags, attrs)?),
            priority: 0,
        };

        Ok(Self::from_native(StreamKind::MsgQueue, flags, Native::MsgQueue(driver)))
    }

    /// Removes the named message queue. Open streams keep working until they close.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if no such queue exists.
    pub fn unlink_msgqueue(name: &str) -> Result<()> {
        sys::unlink(name)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::CString;

    use super::{MsgQueueAttrs, QueueStatus};
    use crate::pal::RawSource;
    use crate::pal::unix::{check, check_len, retry};
    use crate::{Error, ErrorCode, Result, StreamFlags};

    pub(super) struct Queue {
        mqd: libc::mqd_t,
    }

    impl Queue {
        pub(super) fn open(name: &str, flags: StreamFlags, attrs: MsgQueueAttrs) -> Result<Self> {
            let name = queue_name(name)?;

            let mut oflag = libc::O_CLOEXEC;
            oflag |= match (flags.readable(), flags.writable()) {
                (true, true) => libc::O_RDWR,
                (false, true) => libc::O_WRONLY,
                _ => libc::O_RDONLY,
            };
            if flags.nonblocking() {
                oflag |= libc::O_NONBLOCK;
            }
            if flags.contains(StreamFlags::CREATE) {
                oflag |= libc::O_CREAT;
            }
            if flags.contains(StreamFlags::EXCL) {
                oflag |= libc::O_EXCL;
            }

            // SAFETY: `mq_attr` is a plain C structure for which all-zero bytes are valid.
            let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
            attr.mq_maxmsg = attrs.max_messages.try_into().map_err(|_too_large| Error::invalid_argument())?;
            attr.mq_msgsize = attrs.message_size.try_into().map_err(|_too_large| Error::invalid_argument())?;
            let mode: libc::mode_t = 0o600;

            // SAFETY: `name` is NUL-terminated and `attr` outlives the call; the mode and attribute
            // arguments are only read when `O_CREAT` is set.
            let mqd = check(unsafe { libc::mq_open(name.as_ptr(), oflag, mode, &raw mut attr) })?;
            Ok(Self { mqd })
        }

        pub(super) fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
            if buf.len() < self.status()?.message_size {
                return Err(ErrorCode::BufferTooSmall.into());
            }

            let received = retry(|| {
                // SAFETY: `buf` is valid for writes of its length; the priority is not requested.
                check_len(unsafe {
                    libc::mq_receive(self.mqd, buf.as_mut_ptr().cast(), buf.len(), std::ptr::null_mut())
                })
            })?;
            Ok(received)
        }

        pub(super) fn send(&mut self, buf: &[u8], priority: u32) -> Result<usize> {
            retry(|| {
                // SAFETY: `buf` is valid for reads of its length.
                check(unsafe { libc::mq_send(self.mqd, buf.as_ptr().cast(), buf.len(), priority) })
            })?;
            Ok(buf.len())
        }

        fn attr(&self) -> Result<libc::mq_attr> {
            // SAFETY: `mq_attr` is a plain C structure for which all-zero bytes are valid.
            let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
            // SAFETY: `attr` is valid for writes.
            check(unsafe { libc::mq_getattr(self.mqd, &raw mut attr) })?;
            Ok(attr)
        }

        pub(super) fn status(&self) -> Result<QueueStatus> {
            let attr = self.attr()?;
            let to_usize = |value: libc::c_long| usize::try_from(value).unwrap_or_default();

            Ok(QueueStatus {
                max_messages: to_usize(attr.mq_maxmsg),
                message_size: to_usize(attr.mq_msgsize),
                current_messages: to_usize(attr.mq_curmsgs),
            })
        }

        pub(super) fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
            let mut attr = self.attr()?;
            attr.mq_flags = if nonblocking { libc::c_long::from(libc::O_NONBLOCK) } else { 0 };

            // SAFETY: `attr` is valid for reads; the previous attributes are not requested.
            check(unsafe { libc::mq_setattr(self.mqd, &raw const attr, std::ptr::null_mut()) })?;
            Ok(())
        }

        pub(super) fn close(self) -> Result<()> {
            let mqd = self.into_raw();
            // SAFETY: The descriptor was released from its owner and is closed exactly once.
            check(unsafe { libc::mq_close(mqd) })?;
            Ok(())
        }

        pub(super) fn source(&self) -> Option<RawSource> {
            Some(RawSource::Fd(self.mqd))
        }

        pub(super) fn forget(self) {
            let _mqd = self.into_raw();
        }

        fn into_raw(self) -> libc::mqd_t {
            let mqd = self.mqd;
            std::mem::forget(self);
            mqd
        }
    }

    impl Drop for Queue {
        fn drop(&mut self) {
            // Reached only when the stream was dropped without closing; errors have no audience.
            // SAFETY: The descriptor is owned by this queue.
            unsafe { libc::mq_close(self.mqd) };
        }
    }

    fn queue_name(name: &str) -> Result<CString> {
        let name = if name.starts_with('/') { name.to_owned() } else { format!("/{name}") };
        CString::new(name).map_err(|_interior_nul| Error::invalid_argument())
    }

    pub(super) fn unlink(name: &str) -> Result<()> {
        let name = queue_name(name)?;
        // SAFETY: `name` is NUL-terminated.
        check(unsafe { libc::mq_unlink(name.as_ptr()) })?;
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, IntoRawHandle, OwnedHandle};

    use windows_sys::Win32::Foundation::{
        ERROR_INSUFFICIENT_BUFFER, ERROR_SEM_TIMEOUT, GENERIC_WRITE, INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Storage::FileSystem::{CreateFileW, FILE_SHARE_READ, OPEN_EXISTING};
    use windows_sys::Win32::System::Mailslots::{
        CreateMailslotW, GetMailslotInfo, MAILSLOT_WAIT_FOREVER, SetMailslotInfo,
    };

    use super::{MsgQueueAttrs, QueueStatus};
    use crate::pal::RawSource;
    use crate::pal::windows::check_bool;
    use crate::{Error, ErrorCode, Result, StreamFlags};

    pub(super) struct Queue {
        slot: File,
        server: bool,
        max_messages: usize,
    }

    impl Queue {
        pub(super) fn open(name: &str, flags: StreamFlags, attrs: MsgQueueAttrs) -> Result<Self> {
            let path: Vec<u16> = std::ffi::OsStr::new(&format!(r"\\.\mailslot\{name}"))
                .encode_wide()
                .chain(Some(0))
                .collect();
            let server = flags.readable();

            let handle = if server {
                let max_size = u32::try_from(attrs.message_size).map_err(|_too_large| Error::invalid_argument())?;
                let timeout = if flags.nonblocking() { 0 } else { MAILSLOT_WAIT_FOREVER };
                // SAFETY: `path` is NUL-terminated; default security.
                unsafe { CreateMailslotW(path.as_ptr(), max_size, timeout, std::ptr::null()) }
            } else {
                // SAFETY: `path` is NUL-terminated; default security, no template.
                unsafe {
                    CreateFileW(
                        path.as_ptr(),
                        GENERIC_WRITE,
                        FILE_SHARE_READ,
                        std::ptr::null(),
                        OPEN_EXISTING,
                        0,
                        std::ptr::null_mut(),
                    )
                }
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(Error::last_os_error());
            }

            // SAFETY: The call above returned a fresh handle that nothing else owns.
            let handle = unsafe { OwnedHandle::from_raw_handle(handle) };
            Ok(Self {
                slot: File::from(handle),
                server,
                max_messages: attrs.max_messages,
            })
        }

        pub(super) fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.slot.read(buf) {
                Err(error) if error.raw_os_error() == Some(ERROR_INSUFFICIENT_BUFFER.cast_signed()) => {
                    Err(ErrorCode::BufferTooSmall.into())
                }
                Err(error) if error.raw_os_error() == Some(ERROR_SEM_TIMEOUT.cast_signed()) => {
                    Err(ErrorCode::WouldBlock.into())
                }
                other => Ok(other?),
            }
        }

        pub(super) fn send(&mut self, buf: &[u8], _priority: u32) -> Result<usize> {
            Ok(self.slot.write(buf)?)
        }

        pub(super) fn status(&self) -> Result<QueueStatus> {
            if !self.server {
                return Err(Error::unsupported());
            }

            let mut max_size = 0;
            let mut count = 0;
            // SAFETY: The out-pointers are valid for writes; unneeded outputs are null.
            check_bool(unsafe {
                GetMailslotInfo(
                    self.slot.as_raw_handle(),
                    &raw mut max_size,
                    std::ptr::null_mut(),
                    &raw mut count,
                    std::ptr::null_mut(),
                )
            })?;

            Ok(QueueStatus {
                max_messages: self.max_messages,
                message_size: usize::try_from(max_size).unwrap_or(usize::MAX),
                current_messages: usize::try_from(count).unwrap_or(usize::MAX),
            })
        }

        pub(super) fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
            if !self.server {
                return Err(Error::unsupported());
            }

            let timeout = if nonblocking { 0 } else { MAILSLOT_WAIT_FOREVER };
            // SAFETY: The handle is owned by this queue.
            check_bool(unsafe { SetMailslotInfo(self.slot.as_raw_handle(), timeout) })?;
            Ok(())
        }

        pub(super) fn close(self) -> Result<()> {
            drop(self.slot);
            Ok(())
        }

        pub(super) fn source(&self) -> Option<RawSource> {
            Some(RawSource::Handle(self.slot.as_raw_handle() as isize))
        }

        pub(super) fn forget(self) {
            let _handle = self.slot.into_raw_handle();
        }
    }

    /// Mailslots disappear with their last handle.
    pub(super) fn unlink(_name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod sys {
    use super::{MsgQueueAttrs, QueueStatus};
    use crate::pal::RawSource;
    use crate::{Error, Result, StreamFlags};

    pub(super) enum Queue {}

    impl Queue {
        pub(super) fn open(_name: &str, _flags: StreamFlags, _attrs: MsgQueueAttrs) -> Result<Self> {
            Err(Error::unsupported())
        }

        pub(super) fn receive(&mut self, _buf: &mut [u8]) -> Result<usize> {
            match *self {}
        }

        pub(super) fn send(&mut self, _buf: &[u8], _priority: u32) -> Result<usize> {
            match *self {}
        }

        pub(super) fn status(&self) -> Result<QueueStatus> {
            match *self {}
        }

        pub(super) fn set_nonblocking(&mut self, _nonblocking: bool) -> Result<()> {
            match *self {}
        }

        pub(super) fn close(self) -> Result<()> {
            match self {}
        }

        pub(super) fn source(&self) -> Option<RawSource> {
            match *self {}
        }

        pub(super) fn forget(self) {
            match self {}
        }
    }

    pub(super) fn unlink(_name: &str) -> Result<()> {
        Err(Error::unsupported())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!("sio-test-{tag}-{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(target_os = "linux")]
    fn small_queue(name: &str, flags: StreamFlags) -> Stream {
        let attrs = MsgQueueAttrs {
            max_messages: 4,
            message_size: 64,
        };
        Stream::msgqueue(name, flags | StreamFlags::CREATE, attrs).unwrap()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn messages_keep_boundaries_and_priority() {
        let name = unique_name("priority");
        let mut queue = small_queue(&name, StreamFlags::RDWR);

        queue.write(b"low").unwrap();
        queue.set_option(OptionId::MSGQ_PRIORITY, 7_i64).unwrap();
        queue.write(b"urgent").unwrap();
        assert_eq!(queue.get_option(OptionId::MSGQ_CURRENT_MESSAGES).unwrap(), OptionValue::Int(2));

        let mut buf = [0_u8; 64];
        let first = queue.read(&mut buf).unwrap();
        assert_eq!(&buf[..first.len()], b"urgent");
        let second = queue.read(&mut buf).unwrap();
        assert_eq!(&buf[..second.len()], b"low");

        Stream::unlink_msgqueue(&name).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn attributes_are_reported() {
        let name = unique_name("attrs");
        let mut queue = small_queue(&name, StreamFlags::RDWR);

        assert_eq!(queue.get_option(OptionId::MSGQ_MAX_MESSAGES).unwrap(), OptionValue::Int(4));
        assert_eq!(queue.get_option(OptionId::MSGQ_MESSAGE_SIZE).unwrap(), OptionValue::Int(64));
        assert_eq!(queue.read(&mut [0; 16]).unwrap_err().code(), ErrorCode::BufferTooSmall);

        Stream::unlink_msgqueue(&name).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn empty_nonblocking_queue_would_block() {
        let name = unique_name("empty");
        let mut queue = small_queue(&name, StreamFlags::RDWR | StreamFlags::NONBLOCK);

        assert_eq!(queue.read(&mut [0; 64]).unwrap_err().code(), ErrorCode::WouldBlock);

        queue.set_option(OptionId::BLOCKING, true).unwrap();
        assert_eq!(queue.get_option(OptionId::BLOCKING).unwrap(), OptionValue::Bool(true));

        Stream::unlink_msgqueue(&name).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_queue_and_exclusive_create() {
        let name = unique_name("missing");

        let error = Stream::msgqueue(&name, StreamFlags::RDWR, MsgQueueAttrs::default()).unwrap_err();
        assert_eq!(error.code(), ErrorCode::NotFound);

        let _queue = small_queue(&name, StreamFlags::RDWR);
        let error = Stream::msgqueue(&name, StreamFlags::RDWR | StreamFlags::CREATE | StreamFlags::EXCL, MsgQueueAttrs::default())
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::AlreadyExists);

        Stream::unlink_msgqueue(&name).unwrap();
        assert_eq!(Stream::unlink_msgqueue(&name).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn priority_must_fit() {
        let mut driver = MsgQueueDriver { queue: None, priority: 0 };

        let error = driver.set_option(OptionId::MSGQ_PRIORITY, &OptionValue::Int(-1)).unwrap_err();

        assert_eq!(error.code(), ErrorCode::InvalidArgument);
        assert_eq!(driver.read(&mut [0; 4], IoFlags::empty()).unwrap_err().code(), ErrorCode::BadHandle);
    }
}
