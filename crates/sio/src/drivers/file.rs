// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut};
use tracing::{Level, event};

use crate::drivers::{Native, region_len, retry};
use crate::pal::RawSource;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, OptionId, OptionValue, Result, Stream, StreamFlags, StreamKind, StreamOps};

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

const TEMP_ATTEMPTS: u32 = 64;

/// The kind of advisory lock taken by [`Stream::lock()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    /// Many holders may share the range; writers are excluded.
    Shared,
    /// A single holder owns the range.
    Exclusive,
}

/// Whether [`Stream::lock()`] waits for a conflicting lock to be released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockWait {
    /// Block until the lock is granted.
    #[default]
    Block,
    /// Fail with [`ErrorCode::Locked`] if the range is held by someone else.
    Immediate,
}

enum FileMap {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

pub(crate) struct FileDriver {
    file: Option<File>,
    path: Option<PathBuf>,
    writable: bool,
    append: bool,
    sync: bool,
    mmap: bool,
    map: Option<FileMap>,
}

impl FileDriver {
    fn open(path: &Path, flags: StreamFlags) -> Result<Self> {
        let file = if flags.contains(StreamFlags::TEMP) {
            create_temp(path, flags)?
        } else {
            open_options(flags).open(path)?
        };

        if flags.contains(StreamFlags::APPEND) && flags.contains(StreamFlags::TRUNC) {
            file.set_len(0)?;
        }

        let mut driver = Self {
            file: Some(file),
            path: (!flags.contains(StreamFlags::TEMP)).then(|| path.to_path_buf()),
            writable: flags.writable(),
            append: flags.contains(StreamFlags::APPEND),
            sync: flags.contains(StreamFlags::SYNC),
            mmap: flags.contains(StreamFlags::MMAP),
            map: None,
        };
        driver.remap()?;

        Ok(driver)
    }

    pub(crate) fn from_file(file: File, flags: StreamFlags) -> Self {
        Self {
            file: Some(file),
            path: None,
            writable: flags.writable(),
            append: flags.contains(StreamFlags::APPEND),
            sync: flags.contains(StreamFlags::SYNC),
            mmap: false,
            map: None,
        }
    }

    /// A driver without a file, for standard handles the process does not have.
    #[cfg(windows)]
    pub(crate) fn detached(flags: StreamFlags) -> Self {
        Self {
            file: None,
            path: None,
            writable: flags.writable(),
            append: false,
            sync: false,
            mmap: false,
            map: None,
        }
    }

    /// Gives up the file, leaving the driver closed.
    pub(crate) fn take_file(&mut self) -> Option<File> {
        self.map = None;
        self.file.take()
    }

    pub(crate) fn mapped(&self) -> Option<&[u8]> {
        match self.map.as_ref()? {
            FileMap::ReadOnly(map) => Some(&map[..]),
            FileMap::Writable(map) => Some(&map[..]),
        }
    }

    pub(crate) fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        match self.map.as_mut()? {
            FileMap::ReadOnly(_) => None,
            FileMap::Writable(map) => Some(&mut map[..]),
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    fn file_ref(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    /// Rebuilds the mapping after the file changed size. Empty files are not mapped.
    fn remap(&mut self) -> Result<()> {
        if !self.mmap {
            return Ok(());
        }

        self.map = None;
        let writable = self.writable;
        let file = self.file_ref()?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }

        let map = if writable {
            // SAFETY: The mapping is shared with the file this driver owns. Changes made to the
            // file by other processes while mapped are visible through the mapping, which is the
            // documented behavior of mapped streams.
            FileMap::Writable(unsafe { MmapMut::map_mut(file)? })
        } else {
            // SAFETY: As above.
            FileMap::ReadOnly(unsafe { Mmap::map(file)? })
        };

        self.map = Some(map);
        Ok(())
    }

    fn read_mapped(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(mapped) = self.mapped() else {
            return Ok(None);
        };
        let mapped_len = mapped.len();

        let position = self.file()?.stream_position()?;
        let start = usize::try_from(position).unwrap_or(usize::MAX);
        let count = region_len(mapped_len, start, buf.len());
        if count > 0 {
            if let Some(mapped) = self.mapped() {
                buf[..count].copy_from_slice(&mapped[start..start + count]);
            }
            self.file()?.seek(SeekFrom::Current(i64::try_from(count).unwrap_or(i64::MAX)))?;
        }

        Ok(Some(count))
    }

    fn resize(&mut self, len: u64) -> Result<()> {
        let file = self.file()?;
        file.set_len(len)?;
        if file.stream_position()? > len {
            file.seek(SeekFrom::Start(len))?;
        }
        Ok(())
    }

    fn remap_if_grown(&mut self) -> Result<()> {
        if !self.mmap {
            return Ok(());
        }

        let mapped = u64::try_from(self.mapped().map_or(0, <[u8]>::len)).unwrap_or(u64::MAX);
        if self.file_ref()?.metadata()?.len() > mapped {
            self.remap()?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn lock_range(&self, offset: u64, len: u64, kind: Option<LockKind>, wait: LockWait) -> Result<()> {
        use std::os::fd::AsRawFd;

        use crate::pal::unix::check;

        let lock_type = match kind {
            Some(LockKind::Shared) => libc::F_RDLCK,
            Some(LockKind::Exclusive) => libc::F_WRLCK,
            None => libc::F_UNLCK,
        };
        // SAFETY: `flock` is a plain C structure for which all-zero bytes are a valid value.
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = narrow(lock_type)?;
        lock.l_whence = narrow(libc::SEEK_SET)?;
        lock.l_start = narrow(offset)?;
        lock.l_len = narrow(len)?;

        let command = match wait {
            LockWait::Block => libc::F_SETLKW,
            LockWait::Immediate => libc::F_SETLK,
        };
        let fd = self.file_ref()?.as_raw_fd();

        // SAFETY: `lock` outlives the call and `fd` is owned by this driver.
        let result = retry(|| check(unsafe { libc::fcntl(fd, command, &raw const lock) }));
        match result {
            Ok(_) => Ok(()),
            Err(error) if matches!(error.raw_os_error(), Some(libc::EAGAIN | libc::EACCES)) => {
                Err(ErrorCode::Locked.into())
            }
            Err(error) => Err(error.into()),
        }
    }

    #[cfg(windows)]
    fn lock_range(&self, offset: u64, len: u64, kind: Option<LockKind>, wait: LockWait) -> Result<()> {
        use std::os::windows::io::AsRawHandle;

        use windows_sys::Win32::Storage::FileSystem::{
            LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx, UnlockFileEx,
        };
        use windows_sys::Win32::System::IO::OVERLAPPED;

        use crate::pal::windows::check_bool;

        let len = if len == 0 { u64::MAX } else { len };
        #[expect(clippy::cast_possible_truncation, reason = "splitting into 32-bit halves")]
        let (len_low, len_high) = (len as u32, (len >> 32) as u32);

        // SAFETY: `OVERLAPPED` is a plain C structure for which all-zero bytes are a valid value.
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        #[expect(clippy::cast_possible_truncation, reason = "splitting into 32-bit halves")]
        {
            overlapped.Anonymous.Anonymous.Offset = offset as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        }

        let handle = self.file_ref()?.as_raw_handle();
        let ret = match kind {
            None => {
                // SAFETY: `overlapped` outlives the call and the handle is owned by this driver.
                unsafe { UnlockFileEx(handle, 0, len_low, len_high, &raw mut overlapped) }
            }
            Some(kind) => {
                let mut flags = 0;
                if kind == LockKind::Exclusive {
                    flags |= LOCKFILE_EXCLUSIVE_LOCK;
                }
                if wait == LockWait::Immediate {
                    flags |= LOCKFILE_FAIL_IMMEDIATELY;
                }
                // SAFETY: As above.
                unsafe { LockFileEx(handle, flags, 0, len_low, len_high, &raw mut overlapped) }
            }
        };

        Ok(check_bool(ret)?)
    }
}

impl StreamOps for FileDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        if let Some(count) = self.read_mapped(buf)? {
            return Ok(count);
        }

        let file = self.file()?;
        Ok(retry(|| file.read(buf))?)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        let file = self.file()?;
        let count = retry(|| file.write(buf))?;
        self.remap_if_grown()?;
        Ok(count)
    }

    fn has_vectored(&self) -> bool {
        cfg!(unix) && !self.mmap
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>], _flags: IoFlags) -> Result<usize> {
        let file = self.file()?;
        Ok(retry(|| file.read_vectored(bufs))?)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>], _flags: IoFlags) -> Result<usize> {
        let file = self.file()?;
        Ok(retry(|| file.write_vectored(bufs))?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file()?.seek(pos)?)
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        // Some platforms refuse to resize a file with live mappings.
        self.map = None;

        let resized = self.resize(len);
        let remapped = self.remap();
        resized.and(remapped)
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file_ref()?.metadata()?.len())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(FileMap::Writable(map)) = &self.map {
            map.flush()?;
        }

        let sync = self.sync;
        let file = self.file()?;
        file.flush()?;
        if sync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        match id {
            OptionId::FILE_APPEND => Ok(OptionValue::Bool(self.append)),
            OptionId::FILE_SYNC => Ok(OptionValue::Bool(self.sync)),
            OptionId::FILE_PATH => self
                .path
                .clone()
                .map(OptionValue::Path)
                .ok_or(Error::Code(ErrorCode::NotFound)),
            _ => Err(Error::unsupported()),
        }
    }

    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        match id {
            OptionId::FILE_SYNC => {
                self.sync = value.as_bool()?;
                Ok(())
            }
            _ => Err(Error::unsupported()),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.map = None;
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use std::os::fd::IntoRawFd;

            let fd = file.into_raw_fd();
            // SAFETY: The descriptor was just released from its owner and is closed exactly once.
            crate::pal::unix::check(unsafe { libc::close(fd) })?;
        }
        #[cfg(windows)]
        drop(file);

        Ok(())
    }

    fn raw_source(&self) -> Option<RawSource> {
        let file = self.file.as_ref()?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            Some(RawSource::Fd(file.as_raw_fd()))
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawHandle;
            Some(RawSource::Handle(file.as_raw_handle() as isize))
        }
    }

    fn forget_handle(&mut self) {
        self.map = None;
        if let Some(file) = self.file.take() {
            #[cfg(unix)]
            {
                use std::os::fd::IntoRawFd;
                let _fd = file.into_raw_fd();
            }
            #[cfg(windows)]
            {
                use std::os::windows::io::IntoRawHandle;
                let _handle = file.into_raw_handle();
            }
        }
    }
}

/// Converts between integer types whose widths differ across platforms.
#[cfg(unix)]
fn narrow<T: TryFrom<U>, U>(value: U) -> Result<T> {
    T::try_from(value).ok().ok_or_else(Error::invalid_argument)
}

fn open_options(flags: StreamFlags) -> OpenOptions {
    let append = flags.contains(StreamFlags::APPEND);
    let mut options = OpenOptions::new();
    options
        .read(flags.readable())
        .write(flags.writable())
        .append(append)
        .truncate(flags.contains(StreamFlags::TRUNC) && !append);

    if flags.contains(StreamFlags::CREATE) {
        if flags.contains(StreamFlags::EXCL) {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }

    apply_platform_flags(&mut options, flags);
    options
}

#[cfg(unix)]
fn apply_platform_flags(options: &mut OpenOptions, flags: StreamFlags) {
    use std::os::unix::fs::OpenOptionsExt;

    let mut custom = 0;
    if flags.contains(StreamFlags::NONBLOCK) {
        custom |= libc::O_NONBLOCK;
    }
    if flags.contains(StreamFlags::SYNC) {
        custom |= libc::O_SYNC;
    }
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    if flags.contains(StreamFlags::DIRECT) {
        custom |= libc::O_DIRECT;
    }

    options.custom_flags(custom).mode(0o644);
}

#[cfg(windows)]
fn apply_platform_flags(options: &mut OpenOptions, flags: StreamFlags) {
    use std::os::windows::fs::OpenOptionsExt;

    use windows_sys::Win32::Storage::FileSystem::{
        FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
    };

    let mut custom = 0;
    if flags.contains(StreamFlags::SYNC) {
        custom |= FILE_FLAG_WRITE_THROUGH;
    }
    if flags.intersects(StreamFlags::DIRECT | StreamFlags::UNBUFFERED) {
        custom |= FILE_FLAG_NO_BUFFERING;
    }

    options
        .custom_flags(custom)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE);
}

/// Creates an anonymous file in `dir` that disappears once closed.
fn create_temp(dir: &Path, flags: StreamFlags) -> Result<File> {
    let flags = flags | StreamFlags::RDWR | StreamFlags::CREATE | StreamFlags::EXCL;

    for _ in 0..TEMP_ATTEMPTS {
        let name = format!(
            ".sio-{}-{}.tmp",
            std::process::id(),
            NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed)
        );
        let path = dir.join(name);

        let mut options = open_options(flags);
        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;

            use windows_sys::Win32::Storage::FileSystem::{FILE_ATTRIBUTE_TEMPORARY, FILE_FLAG_DELETE_ON_CLOSE};

            options.attributes(FILE_ATTRIBUTE_TEMPORARY).custom_flags(FILE_FLAG_DELETE_ON_CLOSE);
        }

        match options.open(&path) {
            Ok(file) => {
                #[cfg(unix)]
                std::fs::remove_file(&path)?;

                event!(Level::TRACE, message = "created temporary file", dir = %dir.display());
                return Ok(file);
            }
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error.into()),
        }
    }

    Err(ErrorCode::AlreadyExists.into())
}

impl Stream {
    /// Opens or creates a file.
    ///
    /// Without access bits the file is opened for reading, or for both directions with
    /// [`StreamFlags::TEMP`]. [`StreamFlags::CREATE`] creates the
    /// file if missing, together with [`StreamFlags::EXCL`] only if missing.
    /// [`StreamFlags::TRUNC`] empties it and [`StreamFlags::APPEND`] directs every write to its
    /// end. With [`StreamFlags::TEMP`], `path` names a directory in which an anonymous file is
    /// created that disappears once closed. With [`StreamFlags::MMAP`], reads are served from a
    /// shared mapping of the file, which [`mapped()`][Self::mapped] exposes.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if the file does not exist and may not be created,
    /// [`ErrorCode::AlreadyExists`] for an exclusive create of an existing file, and any other
    /// failure of the operating system.
    ///
    /// # Example
    ///
    /// ```
    /// # let dir = std::env::temp_dir();
    /// use sio::{Stream, StreamFlags};
    ///
    /// let mut file = Stream::open_file(&dir, StreamFlags::RDWR | StreamFlags::TEMP)?;
    /// file.write(b"scratch")?;
    /// assert_eq!(file.size()?, 7);
    /// # Ok::<(), sio::Error>(())
    /// ```
    pub fn open_file(path: impl AsRef<Path>, flags: StreamFlags) -> Result<Self> {
        let default = if flags.contains(StreamFlags::TEMP) {
            StreamFlags::RDWR
        } else {
            StreamFlags::READ
        };
        let flags = with_default_access(flags, default);
        let driver = FileDriver::open(path.as_ref(), flags)?;

        Ok(Self::from_native(StreamKind::File, flags, Native::File(driver)))
    }

    /// Adopts an open file.
    #[must_use]
    pub fn from_file(file: File, flags: StreamFlags) -> Self {
        let flags = with_default_access(flags, StreamFlags::RDWR);
        Self::from_native(StreamKind::File, flags, Native::File(FileDriver::from_file(file, flags)))
    }

    /// Takes an advisory lock on `len` bytes starting at `offset`. A length of zero covers
    /// everything from `offset` onwards, including bytes appended later.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Locked`] if the range is held by another process and `wait` is
    /// [`LockWait::Immediate`]; [`ErrorCode::Unsupported`] for streams that are not files.
    pub fn lock(&mut self, offset: u64, len: u64, kind: LockKind, wait: LockWait) -> Result<()> {
        self.file_driver()?.lock_range(offset, len, Some(kind), wait)
    }

    /// Releases an advisory lock taken by [`lock()`][Self::lock].
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for streams that are not files.
    pub fn unlock(&mut self, offset: u64, len: u64) -> Result<()> {
        self.file_driver()?.lock_range(offset, len, None, LockWait::Immediate)
    }

    fn file_driver(&mut self) -> Result<&mut FileDriver> {
        match self.native_mut()? {
            Native::File(driver) => Ok(driver),
            _ => Err(Error::unsupported()),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_seek_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");

        let mut file = Stream::open_file(&path, StreamFlags::RDWR | StreamFlags::CREATE).unwrap();
        assert_eq!(file.kind(), StreamKind::File);
        file.write_all(b"hello world").unwrap();

        assert_eq!(file.seek(SeekFrom::Start(6)).unwrap(), 6);
        let mut buf = [0_u8; 16];
        let transfer = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..transfer.len()], b"world");

        let transfer = file.read(&mut buf).unwrap();
        assert!(transfer.is_end_of_stream());
        assert!(file.is_eof());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();

        let error = Stream::open_file(dir.path().join("absent"), StreamFlags::READ).unwrap_err();

        assert_eq!(error.code(), ErrorCode::NotFound);
    }

    #[test]
    fn exclusive_create_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("once");
        Stream::open_file(&path, StreamFlags::WRITE | StreamFlags::CREATE).unwrap();

        let error = Stream::open_file(&path, StreamFlags::WRITE | StreamFlags::CREATE | StreamFlags::EXCL).unwrap_err();

        assert_eq!(error.code(), ErrorCode::AlreadyExists);
    }

    #[test]
    fn append_and_trunc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let mut file = Stream::open_file(&path, StreamFlags::WRITE | StreamFlags::CREATE).unwrap();
        file.write(b"first").unwrap();
        file.close().unwrap();

        let mut file = Stream::open_file(&path, StreamFlags::WRITE | StreamFlags::APPEND).unwrap();
        file.write(b"+second").unwrap();
        assert_eq!(file.get_option(OptionId::FILE_APPEND).unwrap(), OptionValue::Bool(true));
        file.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first+second");

        let file = Stream::open_file(&path, StreamFlags::WRITE | StreamFlags::TRUNC).unwrap();
        drop(file);
        assert!(std::fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn truncate_clamps_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Stream::open_file(dir.path(), StreamFlags::RDWR | StreamFlags::TEMP).unwrap();
        file.write(&[7; 100]).unwrap();

        file.truncate(40).unwrap();

        assert_eq!(file.size().unwrap(), 40);
        assert_eq!(file.tell().unwrap(), 40);
        assert_eq!(file.get_option(OptionId::FILE_PATH).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn temp_files_vanish() {
        let dir = tempfile::tempdir().unwrap();

        let mut file = Stream::open_file(dir.path(), StreamFlags::TEMP).unwrap();
        file.write(b"x").unwrap();
        file.close().unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn mapped_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut file = Stream::open_file(&path, StreamFlags::RDWR | StreamFlags::MMAP).unwrap();
        assert_eq!(file.mapped().unwrap(), b"0123456789");

        file.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0_u8; 3];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"456");

        file.mapped_mut().unwrap()[0] = b'X';
        file.flush().unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"X123456789");
    }

    #[test]
    fn mapping_follows_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow");

        let mut file = Stream::open_file(&path, StreamFlags::RDWR | StreamFlags::CREATE | StreamFlags::MMAP).unwrap();
        assert_eq!(file.mapped().unwrap_err().code(), ErrorCode::Unsupported);

        file.write(b"abc").unwrap();

        assert_eq!(file.mapped().unwrap(), b"abc");
    }

    #[test]
    fn failed_truncate_keeps_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep");
        std::fs::write(&path, b"mapped").unwrap();
        let mut file = Stream::open_file(&path, StreamFlags::RDWR | StreamFlags::MMAP).unwrap();

        file.truncate(u64::MAX).unwrap_err();

        assert_eq!(file.mapped().unwrap(), b"mapped");
        assert_eq!(file.size().unwrap(), 6);
    }

    #[test]
    fn exclusive_lock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Stream::open_file(dir.path(), StreamFlags::RDWR | StreamFlags::TEMP).unwrap();
        file.write(&[0; 64]).unwrap();

        file.lock(0, 32, LockKind::Exclusive, LockWait::Immediate).unwrap();
        file.unlock(0, 32).unwrap();
        file.lock(0, 0, LockKind::Shared, LockWait::Block).unwrap();
        file.unlock(0, 0).unwrap();
    }

    #[test]
    fn sync_option() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Stream::open_file(dir.path(), StreamFlags::TEMP).unwrap();

        file.set_option(OptionId::FILE_SYNC, true).unwrap();

        assert_eq!(file.get_option(OptionId::FILE_SYNC).unwrap(), OptionValue::Bool(true));
        file.flush().unwrap();
        assert_eq!(file.get_option(OptionId::TCP_NODELAY).unwrap_err().code(), ErrorCode::Unsupported);
    }

    #[cfg(unix)]
    #[test]
    fn blocking_option_falls_back_to_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Stream::open_file(dir.path(), StreamFlags::TEMP).unwrap();

        file.set_option(OptionId::BLOCKING, false).unwrap();

        assert!(file.flags().nonblocking());
        assert_eq!(file.get_option(OptionId::BLOCKING).unwrap(), OptionValue::Bool(false));
        assert_eq!(file.get_option(OptionId::CLOEXEC).unwrap(), OptionValue::Bool(true));
    }

    #[test]
    fn lock_on_other_kinds_is_unsupported() {
        let mut stream = Stream::from_memory(vec![0; 4], StreamFlags::RDWR);

        let error = stream.lock(0, 0, LockKind::Shared, LockWait::Immediate).unwrap_err();

        assert_eq!(error.code(), ErrorCode::Unsupported);
    }
}
