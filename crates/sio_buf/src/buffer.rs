// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use memmap2::{Mmap, MmapMut};
use num_traits::{FromBytes, ToBytes};
use tracing::{Level, event};

use crate::growth::{WORD_SIZE, align_up};
use crate::{Error, GrowthStrategy, MAX_CAPACITY, Result, Transfer};

/// A growable byte container with a read/write cursor.
///
/// A buffer tracks three quantities: its *capacity* (bytes of storage available), its *size*
/// (bytes of valid data, starting at offset 0) and its *position* (the cursor used by
/// [`read()`][ByteBuffer::read], [`write()`][ByteBuffer::write] and
/// [`seek()`][ByteBuffer::seek]). At all times `position <= size <= capacity`.
///
/// # Ownership
///
/// The storage of a buffer is in one of three states, reported by
/// [`ownership()`][ByteBuffer::ownership]:
///
/// * [`Ownership::Owned`] - allocated by the buffer. Owned storage grows on demand according to
///   the buffer's [`GrowthStrategy`] and can be resized or shrunk explicitly.
/// * [`Ownership::Borrowed`] - caller-supplied memory. The capacity is fixed.
/// * [`Ownership::Mapped`] - a memory-mapped file. The capacity is fixed to the file length.
///   Read-only mappings also reject all writes.
///
/// Non-owned storage rejects resizing and writes beyond capacity with [`Error::ReadOnly`].
///
/// Owned storage is always aligned to the platform pointer size and its capacity is always a
/// multiple of the pointer size.
///
/// # Thread safety
///
/// This type is `Send` but not `Sync`. Wrap it in a mutex to share it between threads.
///
/// # Example
///
/// ```
/// use sio_buf::ByteBuffer;
///
/// let mut buffer = ByteBuffer::new(16)?;
/// buffer.write(b"Hello, World!\r\n\r\n")?;
/// buffer.seek(std::io::SeekFrom::Start(0))?;
///
/// let mut target = [0_u8; 64];
/// let transfer = buffer.read(&mut target);
///
/// assert_eq!(transfer.len(), 17);
/// assert!(transfer.is_end_of_stream());
/// # Ok::<(), sio_buf::Error>(())
/// ```
pub struct ByteBuffer {
    storage: Storage,
    size: usize,
    position: usize,
    strategy: GrowthStrategy,
}

enum Storage {
    // Words rather than bytes, so the allocation is pointer-aligned.
    Owned(Vec<usize>),
    Borrowed { ptr: NonNull<u8>, len: usize },
    Mapped(Mapping),
}

enum Mapping {
    // Zero-length files cannot be mapped.
    Empty,
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// Who provides the storage of a [`ByteBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The buffer allocated the storage itself.
    Owned,
    /// The caller supplied the storage.
    Borrowed,
    /// The storage is a memory-mapped file.
    Mapped,
}

// SAFETY: Owned and mapped storage are plain owned memory. Borrowed storage is covered by the
// contract of `from_raw_parts()`, which grants the buffer exclusive access to the memory for its
// whole lifetime, so moving the buffer to another thread moves that exclusive access with it.
unsafe impl Send for ByteBuffer {}

impl ByteBuffer {
    /// Creates an owned buffer of at least `capacity` bytes using the default
    /// [`GrowthStrategy::Optimal`] strategy.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityOverflow`] if `capacity` exceeds [`MAX_CAPACITY`], and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_strategy(capacity, GrowthStrategy::default())
    }

    /// Creates an owned buffer of at least `capacity` bytes that grows using `strategy`.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityOverflow`] if `capacity` exceeds [`MAX_CAPACITY`], and
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn with_strategy(capacity: usize, strategy: GrowthStrategy) -> Result<Self> {
        Ok(Self {
            storage: Storage::Owned(allocate_words(capacity)?),
            size: 0,
            position: 0,
            strategy,
        })
    }

    /// Creates an owned buffer holding a copy of `data`, with the position at the start.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if the allocation fails.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut buffer = Self::new(data.len())?;
        buffer.write(data)?;
        buffer.position = 0;
        Ok(buffer)
    }

    /// Wraps caller-owned memory in a buffer without copying it.
    ///
    /// The buffer starts empty (size 0) with a fixed capacity of `len` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as the returned buffer
    /// exists, and that memory must not be accessed through any other path during that time.
    ///
    /// # Errors
    ///
    /// [`Error::Misaligned`] if `ptr` is not aligned to the platform pointer size.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Result<Self> {
        if len > 0 && ptr.as_ptr().addr() % WORD_SIZE != 0 {
            return Err(Error::Misaligned);
        }

        Ok(Self {
            storage: Storage::Borrowed { ptr, len },
            size: 0,
            position: 0,
            strategy: GrowthStrategy::Fixed,
        })
    }

    /// Wraps a leaked or static byte slice in a buffer without copying it.
    ///
    /// # Errors
    ///
    /// [`Error::Misaligned`] if the slice is not aligned to the platform pointer size.
    pub fn from_static(memory: &'static mut [u8]) -> Result<Self> {
        let len = memory.len();
        let ptr = NonNull::from(memory).cast::<u8>();

        // SAFETY: The exclusive `'static` borrow is consumed here, so the memory stays valid for
        // the lifetime of the buffer and is reachable through no other path.
        unsafe { Self::from_raw_parts(ptr, len) }
    }

    /// Maps the file at `path` into memory.
    ///
    /// The resulting buffer has size and capacity equal to the file length and the position at
    /// the start. Changes made through a writable mapping are visible to other mappings of the
    /// same file and reach the file itself no later than [`flush()`][Self::flush] or drop.
    ///
    /// # Errors
    ///
    /// Forwards any error from opening or mapping the file as [`Error::Io`].
    pub fn map_file(path: impl AsRef<Path>, readonly: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(!readonly).open(path)?;
        let len = usize::try_from(file.metadata()?.len()).map_err(|_overflow| Error::CapacityOverflow)?;

        let mapping = if len == 0 {
            Mapping::Empty
        } else if readonly {
            // SAFETY: The mapping is shared with the file; modifications made to the file by
            // other processes are visible through it, which is the documented behavior.
            Mapping::ReadOnly(unsafe { Mmap::map(&file)? })
        } else {
            // SAFETY: As above.
            Mapping::Writable(unsafe { MmapMut::map_mut(&file)? })
        };

        event!(Level::TRACE, message = "mapped file", path = %path.display(), len, readonly);

        Ok(Self::from_mapping(mapping, len))
    }

    /// Adopts an existing read-only mapping.
    #[must_use]
    pub fn from_mmap(map: Mmap) -> Self {
        let len = map.len();
        Self::from_mapping(Mapping::ReadOnly(map), len)
    }

    /// Adopts an existing writable mapping.
    #[must_use]
    pub fn from_mmap_mut(map: MmapMut) -> Self {
        let len = map.len();
        Self::from_mapping(Mapping::Writable(map), len)
    }

    fn from_mapping(mapping: Mapping, len: usize) -> Self {
        Self {
            storage: Storage::Mapped(mapping),
            size: len,
            position: 0,
            strategy: GrowthStrategy::Fixed,
        }
    }

    /// Number of bytes of storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(words) => words.len() * WORD_SIZE,
            Storage::Borrowed { len, .. } => *len,
            Storage::Mapped(Mapping::Empty) => 0,
            Storage::Mapped(Mapping::ReadOnly(map)) => map.len(),
            Storage::Mapped(Mapping::Writable(map)) => map.len(),
        }
    }

    /// Number of bytes of valid data.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Whether the buffer holds no data.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The cursor position.
    #[must_use]
    pub const fn tell(&self) -> usize {
        self.position
    }

    /// Number of bytes between the cursor and the end of the data.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.size - self.position
    }

    /// Whether the cursor is at the end of the data.
    #[must_use]
    pub const fn is_at_end(&self) -> bool {
        self.position == self.size
    }

    /// Who provides the storage.
    #[must_use]
    pub const fn ownership(&self) -> Ownership {
        match self.storage {
            Storage::Owned(_) => Ownership::Owned,
            Storage::Borrowed { .. } => Ownership::Borrowed,
            Storage::Mapped(_) => Ownership::Mapped,
        }
    }

    /// Whether the storage accepts writes at all.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        !matches!(self.storage, Storage::Mapped(Mapping::ReadOnly(_)))
    }

    /// The growth strategy applied when a write does not fit.
    #[must_use]
    pub const fn strategy(&self) -> GrowthStrategy {
        self.strategy
    }

    /// Replaces the growth strategy. Only owned buffers ever grow.
    pub const fn set_strategy(&mut self, strategy: GrowthStrategy) {
        self.strategy = strategy;
    }

    /// The valid data, `[0, size)`.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage()[..self.size]
    }

    /// The valid data, mutably.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] for read-only mappings.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        let size = self.size;
        Ok(&mut self.storage_mut()?[..size])
    }

    /// The data between the cursor and the end, `[position, size)`.
    #[must_use]
    pub fn current(&self) -> &[u8] {
        &self.storage()[self.position..self.size]
    }

    /// Writes `data` at the cursor, growing owned storage if needed.
    ///
    /// The cursor advances past the written bytes and the size grows to cover them. Either all
    /// of `data` is written or nothing is.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] if the buffer cannot hold the data because its storage is not owned
    /// (or is a read-only mapping). [`Error::CapacityExceeded`], [`Error::CapacityOverflow`] or
    /// [`Error::OutOfMemory`] if owned storage cannot grow far enough.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let end = self.position.checked_add(data.len()).ok_or(Error::CapacityOverflow)?;
        self.grow_for(end)?;

        let position = self.position;
        self.storage_mut()?[position..end].copy_from_slice(data);
        self.position = end;
        self.size = self.size.max(end);

        Ok(data.len())
    }

    /// Copies up to `target.len()` bytes from the cursor into `target` and advances the cursor.
    ///
    /// The transfer reports end-of-stream when fewer bytes than requested were available.
    pub fn read(&mut self, target: &mut [u8]) -> Transfer {
        let count = self.remaining().min(target.len());
        let start = self.position;

        target[..count].copy_from_slice(&self.storage()[start..start + count]);
        self.position += count;

        if count < target.len() {
            Transfer::end_of_stream(count, target.len())
        } else {
            Transfer::new(count, target.len())
        }
    }

    /// Moves the cursor. The new position must lie within `[0, size]`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if the target position is negative or beyond the data. The cursor is
    /// unchanged in that case.
    pub fn seek(&mut self, target: SeekFrom) -> Result<usize> {
        let position = match target {
            SeekFrom::Start(offset) => usize::try_from(offset).ok(),
            SeekFrom::Current(delta) => offset_by(self.position, delta),
            SeekFrom::End(delta) => offset_by(self.size, delta),
        };

        match position {
            Some(position) if position <= self.size => {
                self.position = position;
                Ok(position)
            }
            _ => Err(Error::OutOfRange { limit: self.size }),
        }
    }

    /// Discards all data and rewinds the cursor. The capacity is unchanged.
    pub const fn clear(&mut self) {
        self.size = 0;
        self.position = 0;
    }

    /// Shortens the data to `len` bytes, clamping the cursor. Has no effect if `len` is not
    /// below the current size.
    pub fn truncate(&mut self, len: usize) {
        if len < self.size {
            self.size = len;
            self.position = self.position.min(len);
        }
    }

    /// Sets the size of the data to `len`, zero-filling any bytes gained.
    ///
    /// # Errors
    ///
    /// As for [`write()`][Self::write] when the storage has to grow.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len <= self.size {
            self.truncate(len);
            return Ok(());
        }

        self.grow_for(len)?;
        let size = self.size;
        self.storage_mut()?[size..len].fill(0);
        self.size = len;
        Ok(())
    }

    /// Changes the capacity of owned storage to `capacity`, rounded up to the pointer size.
    ///
    /// Shrinking below the size truncates the data and clamps the cursor.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] for borrowed or mapped storage, [`Error::CapacityOverflow`] or
    /// [`Error::OutOfMemory`] if the storage cannot be allocated.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        let Storage::Owned(words) = &mut self.storage else {
            return Err(Error::ReadOnly);
        };

        let bytes = aligned_capacity(capacity)?;
        let word_count = bytes / WORD_SIZE;

        if word_count > words.len() {
            words
                .try_reserve_exact(word_count - words.len())
                .map_err(|_alloc| Error::OutOfMemory(bytes))?;
            words.resize(word_count, 0);
        } else {
            words.truncate(word_count);
            words.shrink_to_fit();
        }

        self.size = self.size.min(bytes);
        self.position = self.position.min(self.size);
        Ok(())
    }

    /// Ensures the capacity covers at least `additional` bytes beyond the current size.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] if non-owned storage is too small, otherwise as for
    /// [`resize()`][Self::resize].
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self.size.checked_add(additional).ok_or(Error::CapacityOverflow)?;
        if required <= self.capacity() {
            return Ok(());
        }

        self.resize(required)
    }

    /// Reduces the capacity of owned storage to the size of the data, rounded up to the pointer
    /// size.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] for borrowed or mapped storage.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        self.resize(self.size)
    }

    /// Flushes a writable mapping to its file. Does nothing for other storage.
    ///
    /// # Errors
    ///
    /// Forwards any error reported while syncing the mapping.
    pub fn flush(&self) -> Result<()> {
        if let Storage::Mapped(Mapping::Writable(map)) = &self.storage {
            map.flush()?;
        }

        Ok(())
    }

    /// Writes a number at the cursor in native byte order.
    ///
    /// # Errors
    ///
    /// As for [`write()`][Self::write].
    #[expect(clippy::needless_pass_by_value, reason = "tiny numeric types, fine to always pass by value")]
    pub fn put_num_ne<T: ToBytes>(&mut self, value: T) -> Result<()> {
        self.write(value.to_ne_bytes().as_ref()).map(|_| ())
    }

    /// Reads a number at the cursor in native byte order.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if fewer than `size_of::<T>()` bytes remain. The cursor is unchanged
    /// in that case.
    pub fn get_num_ne<T: FromBytes>(&mut self) -> Result<T>
    where
        T::Bytes: Sized,
    {
        let size = size_of::<T>();
        let Some(bytes) = self.current().get(..size) else {
            return Err(Error::OutOfRange { limit: self.size });
        };

        let bytes_array_ptr = bytes.as_ptr().cast::<T::Bytes>();

        // SAFETY: `bytes` holds exactly `size_of::<T>()` initialized bytes and the target type is
        // a byte array, so it has no alignment requirements.
        let value = T::from_ne_bytes(unsafe { &*bytes_array_ptr });
        self.position += size;
        Ok(value)
    }

    fn grow_for(&mut self, required: usize) -> Result<()> {
        let capacity = self.capacity();
        if required <= capacity && self.is_writable() {
            return Ok(());
        }

        match self.storage {
            Storage::Owned(_) => {
                let target = self.strategy.next_capacity(capacity, required)?;
                event!(Level::TRACE, message = "growing buffer", from = capacity, to = target);
                self.resize(target)
            }
            Storage::Borrowed { .. } | Storage::Mapped(_) => Err(Error::ReadOnly),
        }
    }

    fn storage(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(words) => {
                // SAFETY: `usize` has no padding bytes and every word is initialized, so the
                // allocation may be viewed as `words.len() * WORD_SIZE` initialized bytes.
                unsafe { slice::from_raw_parts(words.as_ptr().cast::<u8>(), words.len() * WORD_SIZE) }
            }
            Storage::Borrowed { ptr, len } => {
                // SAFETY: The `from_raw_parts()` contract guarantees `len` valid bytes at `ptr`.
                unsafe { slice::from_raw_parts(ptr.as_ptr(), *len) }
            }
            Storage::Mapped(Mapping::Empty) => &[],
            Storage::Mapped(Mapping::ReadOnly(map)) => &map[..],
            Storage::Mapped(Mapping::Writable(map)) => &map[..],
        }
    }

    fn storage_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.storage {
            Storage::Owned(words) => {
                // SAFETY: As in `storage()`; any byte pattern is a valid `usize`, so writes through
                // the byte view cannot produce invalid words.
                Ok(unsafe { slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), words.len() * WORD_SIZE) })
            }
            Storage::Borrowed { ptr, len } => {
                // SAFETY: The `from_raw_parts()` contract grants exclusive access to `len` bytes.
                Ok(unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), *len) })
            }
            Storage::Mapped(Mapping::Empty) => Ok(&mut [][..]),
            Storage::Mapped(Mapping::ReadOnly(_)) => Err(Error::ReadOnly),
            Storage::Mapped(Mapping::Writable(map)) => Ok(&mut map[..]),
        }
    }
}

macro_rules! number_accessors {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        impl ByteBuffer {
            $(
                #[doc = concat!("Reads a native-endian `", stringify!($ty), "` at the cursor.")]
                ///
                /// # Errors
                ///
                /// [`Error::OutOfRange`] if not enough bytes remain.
                pub fn $read(&mut self) -> Result<$ty> {
                    self.get_num_ne::<$ty>()
                }

                #[doc = concat!("Writes a native-endian `", stringify!($ty), "` at the cursor.")]
                ///
                /// # Errors
                ///
                /// As for [`write()`][Self::write].
                pub fn $write(&mut self, value: $ty) -> Result<()> {
                    self.put_num_ne(value)
                }
            )*
        }
    };
}

number_accessors! {
    read_u8, write_u8 => u8;
    read_u16, write_u16 => u16;
    read_u32, write_u32 => u32;
    read_u64, write_u64 => u64;
    read_i8, write_i8 => i8;
    read_i16, write_i16 => i16;
    read_i32, write_i32 => i32;
    read_i64, write_i64 => i64;
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
            size: 0,
            position: 0,
            strategy: GrowthStrategy::default(),
        }
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("ownership", &self.ownership())
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("strategy", &self.strategy)
            .finish()
    }
}

fn aligned_capacity(capacity: usize) -> Result<usize> {
    align_up(capacity)
        .filter(|bytes| *bytes <= MAX_CAPACITY)
        .ok_or(Error::CapacityOverflow)
}

fn allocate_words(capacity: usize) -> Result<Vec<usize>> {
    let bytes = aligned_capacity(capacity)?;
    let mut words = Vec::new();
    words
        .try_reserve_exact(bytes / WORD_SIZE)
        .map_err(|_alloc| Error::OutOfMemory(bytes))?;
    words.resize(bytes / WORD_SIZE, 0);
    Ok(words)
}

fn offset_by(base: usize, delta: i64) -> Option<usize> {
    let magnitude = usize::try_from(delta.unsigned_abs()).ok()?;
    if delta >= 0 {
        base.checked_add(magnitude)
    } else {
        base.checked_sub(magnitude)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::num::NonZero;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ByteBuffer: Send, fmt::Debug, Default);
    assert_not_impl_any!(ByteBuffer: Sync, Clone);

    fn leaked(len: usize) -> &'static mut [u8] {
        // Word-backed so the slice is pointer-aligned.
        let words: &'static mut [usize] = Box::leak(vec![0_usize; len.div_ceil(WORD_SIZE)].into_boxed_slice());
        let ptr = words.as_mut_ptr().cast::<u8>();
        // SAFETY: The leaked words cover at least `len` bytes and are never accessed again.
        unsafe { slice::from_raw_parts_mut(ptr, len) }
    }

    #[test]
    fn new_aligns_capacity() {
        let buffer = ByteBuffer::new(13).unwrap();

        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.capacity() % WORD_SIZE, 0);
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.tell(), 0);
        assert_eq!(buffer.ownership(), Ownership::Owned);
    }

    #[test]
    fn round_trip_with_growth_and_shrink() {
        let mut buffer = ByteBuffer::new(16).unwrap();

        assert_eq!(buffer.write(b"Hello, World!\r\n\r\n").unwrap(), 17);
        assert_eq!(buffer.write(b"!").unwrap(), 1);
        assert!(buffer.capacity() >= 18);
        assert_eq!(buffer.len(), 18);

        buffer.seek(SeekFrom::Start(0)).unwrap();
        let mut target = [0_u8; 64];
        let transfer = buffer.read(&mut target);

        assert_eq!(transfer.len(), 18);
        assert!(transfer.is_end_of_stream());
        assert_eq!(&target[..18], b"Hello, World!\r\n\r\n!");

        buffer.shrink_to_fit().unwrap();
        assert_eq!(buffer.capacity(), align_up(18).unwrap());
        assert_eq!(buffer.len(), 18);
    }

    #[test]
    fn grows_past_initial_capacity() {
        const INPUT: &[u8] = b"hello, sio buffer!";
        let mut buffer = ByteBuffer::new(16).unwrap();
        assert_eq!(buffer.capacity(), 16);

        assert_eq!(buffer.write(INPUT).unwrap(), 18);
        assert!(buffer.capacity() >= 18);
        assert_eq!(buffer.len(), 18);

        buffer.seek(SeekFrom::Start(0)).unwrap();
        let mut target = [0_u8; 64];
        let transfer = buffer.read(&mut target);

        assert_eq!(transfer.len(), 18);
        assert_eq!(transfer.requested(), 64);
        assert!(transfer.is_end_of_stream());
        assert_eq!(&target[..18], INPUT);

        buffer.shrink_to_fit().unwrap();
        assert!(buffer.capacity() >= 18);
        assert_eq!(buffer.as_slice(), INPUT);
    }

    #[test]
    fn full_read_is_not_end_of_stream() {
        let mut buffer = ByteBuffer::from_slice(b"abcd").unwrap();
        let mut target = [0_u8; 4];

        let transfer = buffer.read(&mut target);

        assert!(transfer.is_complete());
        assert!(!transfer.is_end_of_stream());
        assert!(buffer.is_at_end());
    }

    #[test]
    fn empty_read_is_not_end_of_stream() {
        let mut buffer = ByteBuffer::new(8).unwrap();

        let transfer = buffer.read(&mut []);

        assert!(transfer.is_empty());
        assert!(!transfer.is_end_of_stream());
    }

    #[test]
    fn write_in_the_middle_keeps_size() {
        let mut buffer = ByteBuffer::from_slice(b"0123456789").unwrap();
        buffer.seek(SeekFrom::Start(2)).unwrap();
        buffer.write(b"ab").unwrap();

        assert_eq!(buffer.as_slice(), b"01ab456789");
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.tell(), 4);
        assert_eq!(buffer.current(), b"456789");
        assert_eq!(buffer.remaining(), 6);
    }

    #[test]
    fn seek_bounds() {
        let mut buffer = ByteBuffer::from_slice(b"0123456789").unwrap();

        assert_eq!(buffer.seek(SeekFrom::End(0)).unwrap(), 10);
        assert_eq!(buffer.seek(SeekFrom::End(-3)).unwrap(), 7);
        assert_eq!(buffer.seek(SeekFrom::Current(-7)).unwrap(), 0);
        assert!(matches!(buffer.seek(SeekFrom::Current(-1)), Err(Error::OutOfRange { limit: 10 })));
        assert!(matches!(buffer.seek(SeekFrom::Start(11)), Err(Error::OutOfRange { .. })));
        assert!(matches!(buffer.seek(SeekFrom::End(1)), Err(Error::OutOfRange { .. })));
        assert!(matches!(buffer.seek(SeekFrom::Current(i64::MIN)), Err(Error::OutOfRange { .. })));
        assert_eq!(buffer.tell(), 0);
    }

    #[test]
    fn resize_below_size_truncates() {
        let mut buffer = ByteBuffer::from_slice(&[7_u8; 40]).unwrap();
        buffer.seek(SeekFrom::End(0)).unwrap();

        buffer.resize(10).unwrap();

        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.tell(), 16);
    }

    #[test]
    fn reserve_grows_exactly() {
        let mut buffer = ByteBuffer::from_slice(b"abc").unwrap();

        buffer.reserve(100).unwrap();

        assert!(buffer.capacity() >= 103);
        assert_eq!(buffer.as_slice(), b"abc");
    }

    #[test]
    fn fixed_strategy_rejects_overflowing_write() {
        let mut buffer = ByteBuffer::with_strategy(8, GrowthStrategy::Fixed).unwrap();

        buffer.write(b"12345678").unwrap();
        let error = buffer.write(b"9").unwrap_err();

        assert!(matches!(error, Error::CapacityExceeded { .. }));
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn linear_strategy_grows_in_steps() {
        let mut buffer = ByteBuffer::with_strategy(8, GrowthStrategy::Linear(NonZero::new(32).unwrap())).unwrap();

        buffer.write(&[1; 9]).unwrap();

        assert_eq!(buffer.capacity(), 40);
    }

    #[test]
    fn truncate_and_set_len() {
        let mut buffer = ByteBuffer::from_slice(b"abcdef").unwrap();
        buffer.seek(SeekFrom::End(0)).unwrap();

        buffer.truncate(2);
        assert_eq!(buffer.as_slice(), b"ab");
        assert_eq!(buffer.tell(), 2);

        buffer.set_len(5).unwrap();
        assert_eq!(buffer.as_slice(), b"ab\0\0\0");
        assert_eq!(buffer.tell(), 2);

        buffer.truncate(100);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buffer = ByteBuffer::from_slice(b"abcdef").unwrap();
        let capacity = buffer.capacity();

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.tell(), 0);
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn borrowed_storage_is_fixed() {
        let mut buffer = ByteBuffer::from_static(leaked(16)).unwrap();

        assert_eq!(buffer.ownership(), Ownership::Borrowed);
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.len(), 0);

        buffer.write(&[1; 16]).unwrap();
        assert!(matches!(buffer.write(b"x"), Err(Error::ReadOnly)));
        assert!(matches!(buffer.resize(64), Err(Error::ReadOnly)));
        assert!(matches!(buffer.shrink_to_fit(), Err(Error::ReadOnly)));
        assert!(matches!(buffer.reserve(1), Err(Error::ReadOnly)));
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn borrowed_storage_must_be_aligned() {
        let memory = leaked(32);
        let misaligned = &mut memory[1..];

        assert!(matches!(ByteBuffer::from_static(misaligned), Err(Error::Misaligned)));
    }

    #[test]
    fn numbers_round_trip_in_native_order() {
        let mut buffer = ByteBuffer::new(0).unwrap();

        buffer.write_u16(0xBEEF).unwrap();
        buffer.write_i32(-5).unwrap();
        buffer.write_u64(u64::MAX - 1).unwrap();
        buffer.put_num_ne(1.5_f64).unwrap();

        assert_eq!(&buffer.as_slice()[..2], &0xBEEF_u16.to_ne_bytes());

        buffer.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(buffer.read_u16().unwrap(), 0xBEEF);
        assert_eq!(buffer.read_i32().unwrap(), -5);
        assert_eq!(buffer.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(buffer.get_num_ne::<f64>().unwrap(), 1.5);
        assert!(matches!(buffer.read_u8(), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn short_number_read_leaves_cursor() {
        let mut buffer = ByteBuffer::from_slice(&[1, 2, 3]).unwrap();

        buffer.read_u32().unwrap_err();
        assert_eq!(buffer.tell(), 0);
        assert_eq!(buffer.read_i8().unwrap(), 1);
    }

    #[test]
    fn mapped_file_is_shared_between_mappings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0_u8; 32]).unwrap();
        file.flush().unwrap();

        let mut writer = ByteBuffer::map_file(file.path(), false).unwrap();
        let reader = ByteBuffer::map_file(file.path(), true).unwrap();

        assert_eq!(writer.ownership(), Ownership::Mapped);
        assert_eq!(writer.len(), 32);
        assert_eq!(writer.capacity(), 32);

        writer.write(b"shared").unwrap();
        writer.flush().unwrap();

        assert_eq!(&reader.as_slice()[..6], b"shared");
        assert!(matches!(writer.write(&[0; 27]), Err(Error::ReadOnly)));
    }

    #[test]
    fn readonly_mapping_rejects_writes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();
        file.flush().unwrap();

        let mut buffer = ByteBuffer::map_file(file.path(), true).unwrap();

        assert!(!buffer.is_writable());
        assert!(matches!(buffer.write(b"x"), Err(Error::ReadOnly)));
        assert!(matches!(buffer.as_mut_slice(), Err(Error::ReadOnly)));
        assert_eq!(buffer.current(), b"data");
    }

    #[test]
    fn empty_file_maps_to_empty_buffer() {
        let file = tempfile::NamedTempFile::new().unwrap();

        let buffer = ByteBuffer::map_file(file.path(), false).unwrap();

        assert_eq!(buffer.capacity(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn capacity_overflow_is_reported() {
        assert!(matches!(ByteBuffer::new(usize::MAX), Err(Error::CapacityOverflow)));
        assert!(matches!(ByteBuffer::new(MAX_CAPACITY + 1), Err(Error::CapacityOverflow)));
    }

    #[test]
    fn debug_output_names_fields() {
        let text = format!("{:?}", ByteBuffer::default());

        assert!(text.contains("ownership: Owned"));
        assert!(text.contains("capacity: 0"));
    }
}
