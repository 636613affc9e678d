// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::SeekFrom;

use crate::drivers::{Native, region_len, resolve_seek};
use crate::pal::RawSource;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, Result, Stream, StreamFlags, StreamKind, StreamOps};

/// A named shared memory region, accessed through a cursor.
pub(crate) struct ShmemDriver {
    region: Option<sys::Region>,
    position: usize,
}

impl ShmemDriver {
    fn region(&self) -> Result<&sys::Region> {
        self.region.as_ref().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    pub(crate) fn as_slice(&self) -> Option<&[u8]> {
        self.region.as_ref().map(sys::Region::as_slice)
    }

    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        self.region.as_mut()?.as_mut_slice()
    }
}

impl StreamOps for ShmemDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        let region = self.region()?.as_slice();
        let count = region_len(region.len(), self.position, buf.len());

        buf[..count].copy_from_slice(&region[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        let position = self.position;
        let region = self
            .region
            .as_mut()
            .ok_or(Error::Code(ErrorCode::BadHandle))?
            .as_mut_slice()
            .ok_or(Error::Code(ErrorCode::ReadOnly))?;
        let count = region_len(region.len(), position, buf.len());

        region[position..position + count].copy_from_slice(&buf[..count]);
        self.position += count;
        Ok(count)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = u64::try_from(self.region()?.as_slice().len()).unwrap_or(u64::MAX);
        let position = u64::try_from(self.position).unwrap_or(u64::MAX);

        let target = resolve_seek(pos, position, len)?;
        self.position = usize::try_from(target).map_err(|_too_large| Error::invalid_argument())?;
        Ok(target)
    }

    fn tell(&mut self) -> Result<u64> {
        self.region()?;
        Ok(u64::try_from(self.position).unwrap_or(u64::MAX))
    }

    fn size(&mut self) -> Result<u64> {
        Ok(u64::try_from(self.region()?.as_slice().len()).unwrap_or(u64::MAX))
    }

    fn flush(&mut self) -> Result<()> {
        self.region()?.flush()
    }

    fn close(&mut self) -> Result<()> {
        drop(self.region.take());
        Ok(())
    }

    fn raw_source(&self) -> Option<RawSource> {
        self.region.as_ref().map(sys::Region::source)
    }

    fn forget_handle(&mut self) {
        if let Some(region) = self.region.take() {
            region.forget();
        }
    }
}

impl Stream {
    /// Opens or creates the named shared memory region of `size` bytes.
    ///
    /// With [`StreamFlags::CREATE`] a missing region is created and sized to `size`. Opening an
    /// existing region with `size` 0 maps all of it. Reads and writes move a cursor within the
    /// region; writing past its end transfers what fits. [`Stream::mapped()`] exposes the region
    /// directly.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if the region does not exist and `CREATE` is not set,
    /// [`ErrorCode::InvalidArgument`] if the region would be empty.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sio::{Stream, StreamFlags};
    ///
    /// let mut region = Stream::shmem("sio-doc-region", 4096, StreamFlags::RDWR | StreamFlags::CREATE)?;
    /// region.write(b"shared")?;
    /// assert_eq!(&region.mapped()?[..6], b"shared");
    /// Stream::unlink_shmem("sio-doc-region")?;
    /// # Ok::<(), sio::Error>(())
    /// ```
    pub fn shmem(name: &str, size: usize, flags: StreamFlags) -> Result<Self> {
        let flags = with_default_access(flags, StreamFlags::RDWR);
        let driver = ShmemDriver {
            region: Some(sys::Region::open(name, size, flags)?),
            position: 0,
        };

        Ok(Self::from_native(StreamKind::Shmem, flags, Native::Shmem(driver)))
    }

    /// Removes the named shared memory region. Open streams keep their mapping.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotFound`] if no such region exists.
    pub fn unlink_shmem(name: &str) -> Result<()> {
        sys::unlink(name)
    }
}

#[cfg(unix)]
mod sys {
    use std::ffi::CString;
    use std::fs::File;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

    use memmap2::{Mmap, MmapMut, MmapOptions};

    use crate::pal::RawSource;
    use crate::pal::unix::check;
    use crate::{Error, Result, StreamFlags};

    enum Map {
        ReadOnly(Mmap),
        Writable(MmapMut),
    }

    pub(super) struct Region {
        file: File,
        map: Map,
    }

    impl Region {
        pub(super) fn open(name: &str, size: usize, flags: StreamFlags) -> Result<Self> {
            let name = region_name(name)?;

            let mut oflag = libc::O_CLOEXEC | if flags.writable() { libc::O_RDWR } else { libc::O_RDONLY };
            if flags.contains(StreamFlags::CREATE) {
                oflag |= libc::O_CREAT;
            }
            if flags.contains(StreamFlags::EXCL) {
                oflag |= libc::O_EXCL;
            }

            #[cfg(target_vendor = "apple")]
            let mode: libc::c_uint = 0o600;
            #[cfg(not(target_vendor = "apple"))]
            let mode: libc::mode_t = 0o600;

            // SAFETY: `name` is NUL-terminated.
            let fd = check(unsafe { libc::shm_open(name.as_ptr(), oflag, mode) })?;
            // SAFETY: `shm_open` returned a fresh descriptor that nothing else owns.
            let file = unsafe { File::from_raw_fd(fd) };

            let current = usize::try_from(file.metadata()?.len()).unwrap_or(usize::MAX);
            if size > current {
                if !flags.writable() {
                    return Err(Error::invalid_argument());
                }
                file.set_len(u64::try_from(size).unwrap_or(u64::MAX))?;
            }

            let len = if size == 0 { current } else { size };
            if len == 0 {
                return Err(Error::invalid_argument());
            }

            let mut options = MmapOptions::new();
            options.len(len);
            let map = if flags.writable() {
                // SAFETY: The region is shared memory; concurrent writers in other processes are
                // the purpose of the mapping.
                Map::Writable(unsafe { options.map_mut(&file)? })
            } else {
                // SAFETY: As above.
                Map::ReadOnly(unsafe { options.map(&file)? })
            };

            Ok(Self { file, map })
        }

        pub(super) fn as_slice(&self) -> &[u8] {
            match &self.map {
                Map::ReadOnly(map) => map,
                Map::Writable(map) => map,
            }
        }

        pub(super) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
            match &mut self.map {
                Map::ReadOnly(_) => None,
                Map::Writable(map) => Some(map),
            }
        }

        pub(super) fn flush(&self) -> Result<()> {
            if let Map::Writable(map) = &self.map {
                map.flush()?;
            }
            Ok(())
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Fd(self.file.as_raw_fd())
        }

        pub(super) fn forget(self) {
            let _fd = self.file.into_raw_fd();
        }
    }

    fn region_name(name: &str) -> Result<CString> {
        let name = if name.starts_with('/') { name.to_owned() } else { format!("/{name}") };
        CString::new(name).map_err(|_interior_nul| Error::invalid_argument())
    }

    pub(super) fn unlink(name: &str) -> Result<()> {
        let name = region_name(name)?;
        // SAFETY: `name` is NUL-terminated.
        check(unsafe { libc::shm_unlink(name.as_ptr()) })?;
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, IntoRawHandle, OwnedHandle};

    use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, FILE_MAP_READ, FILE_MAP_WRITE, FlushViewOfFile, MEMORY_BASIC_INFORMATION,
        MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW, PAGE_READWRITE, UnmapViewOfFile, VirtualQuery,
    };

    use crate::pal::RawSource;
    use crate::pal::windows::check_bool;
    use crate::{Error, ErrorCode, Result, StreamFlags};

    /// A mapped view of a named file mapping object.
    pub(super) struct Region {
        mapping: OwnedHandle,
        view: *mut u8,
        len: usize,
        writable: bool,
    }

    // SAFETY: The view is plain shared memory owned by this region; no thread affinity is involved.
    unsafe impl Send for Region {}

    impl Region {
        pub(super) fn open(name: &str, size: usize, flags: StreamFlags) -> Result<Self> {
            let wide: Vec<u16> = OsStr::new(&format!(r"Local\{name}")).encode_wide().chain(Some(0)).collect();
            let access = if flags.writable() { FILE_MAP_READ | FILE_MAP_WRITE } else { FILE_MAP_READ };

            let mapping = if flags.contains(StreamFlags::CREATE) {
                let size = u64::try_from(size).unwrap_or(u64::MAX);
                let high = u32::try_from(size >> 32).unwrap_or(u32::MAX);
                let low = u32::try_from(size & u64::from(u32::MAX)).unwrap_or(u32::MAX);
                // SAFETY: `wide` is NUL-terminated; the mapping is backed by the paging file.
                unsafe { CreateFileMappingW(INVALID_HANDLE_VALUE, std::ptr::null(), PAGE_READWRITE, high, low, wide.as_ptr()) }
            } else {
                // SAFETY: `wide` is NUL-terminated.
                unsafe { OpenFileMappingW(access, 0, wide.as_ptr()) }
            };
            if mapping.is_null() {
                return Err(Error::last_os_error());
            }
            // SAFETY: The call above returned a fresh handle that nothing else owns.
            let mapping = unsafe { OwnedHandle::from_raw_handle(mapping) };

            if flags.contains(StreamFlags::CREATE | StreamFlags::EXCL)
                && std::io::Error::last_os_error().raw_os_error()
                    == Some(windows_sys::Win32::Foundation::ERROR_ALREADY_EXISTS.cast_signed())
            {
                return Err(ErrorCode::AlreadyExists.into());
            }

            // SAFETY: The mapping handle is valid; offset 0 with `size` 0 maps the whole object.
            let view = unsafe { MapViewOfFile(mapping.as_raw_handle(), access, 0, 0, size) };
            if view.Value.is_null() {
                return Err(Error::last_os_error());
            }

            let len = if size == 0 { view_len(view) } else { size };
            Ok(Self {
                mapping,
                view: view.Value.cast(),
                len,
                writable: flags.writable(),
            })
        }

        pub(super) fn as_slice(&self) -> &[u8] {
            // SAFETY: The view covers `len` bytes and stays mapped while `self` lives.
            unsafe { std::slice::from_raw_parts(self.view, self.len) }
        }

        pub(super) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
            // SAFETY: The view covers `len` writable bytes and stays mapped while `self` lives.
            self.writable.then(|| unsafe { std::slice::from_raw_parts_mut(self.view, self.len) })
        }

        pub(super) fn flush(&self) -> Result<()> {
            // SAFETY: The view covers `len` bytes.
            check_bool(unsafe { FlushViewOfFile(self.view.cast(), self.len) })?;
            Ok(())
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Handle(self.mapping.as_raw_handle() as isize)
        }

        pub(super) fn forget(self) {
            let mut this = std::mem::ManuallyDrop::new(self);
            // SAFETY: `this` is never used or dropped again; the handle is moved out exactly once.
            let mapping = unsafe { std::ptr::read(&raw mut this.mapping) };
            let _handle = mapping.into_raw_handle();
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            let view = MEMORY_MAPPED_VIEW_ADDRESS { Value: self.view.cast() };
            // SAFETY: The view was mapped by this region and is unmapped exactly once.
            unsafe { UnmapViewOfFile(view) };
        }
    }

    fn view_len(view: MEMORY_MAPPED_VIEW_ADDRESS) -> usize {
        // SAFETY: `MEMORY_BASIC_INFORMATION` is a plain C structure for which all-zero bytes are valid.
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is valid for writes of its own size.
        let written = unsafe { VirtualQuery(view.Value, &raw mut info, size_of::<MEMORY_BASIC_INFORMATION>()) };
        if written == 0 { 0 } else { info.RegionSize }
    }

    /// Named mappings disappear with their last handle.
    pub(super) fn unlink(_name: &str) -> Result<()> {
        Ok(())
    }
}
