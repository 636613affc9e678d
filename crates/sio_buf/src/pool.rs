// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Level, event};

use crate::{ByteBuffer, Error, GrowthStrategy, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A fixed set of equally sized owned buffers that can be acquired and released.
///
/// Each slot holds one [`ByteBuffer`] of [`buffer_size()`][Self::buffer_size] bytes using the
/// [`GrowthStrategy::Fixed`] strategy, so pooled buffers never reallocate. Acquiring hands out a
/// [`PooledBuffer`] handle for an unused slot after clearing the slot's buffer; releasing the
/// handle makes the slot available again.
///
/// # Thread safety
///
/// The pool is `Send` but mutation requires `&mut self`. Wrap it in a mutex to share it.
///
/// # Example
///
/// ```
/// use sio_buf::BufferPool;
///
/// let mut pool = BufferPool::new(2, 1024)?;
/// let handle = pool.acquire()?;
/// pool.get_mut(&handle)?.write(b"hello")?;
/// pool.release(handle)?;
/// assert_eq!(pool.available(), 2);
/// # Ok::<(), sio_buf::Error>(())
/// ```
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    buffer_size: usize,
    slots: Vec<Slot>,
    in_use: usize,
}

#[derive(Debug)]
struct Slot {
    buffer: ByteBuffer,
    used: bool,
}

/// Grants access to one slot of the [`BufferPool`] that issued it.
///
/// The handle is not clonable; releasing it consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PooledBuffer {
    pool_id: u64,
    index: usize,
}

impl PooledBuffer {
    /// Index of the slot within its pool.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `buffer_size` bytes each.
    ///
    /// # Errors
    ///
    /// Forwards any allocation failure from [`ByteBuffer::with_strategy()`].
    pub fn new(count: usize, buffer_size: usize) -> Result<Self> {
        let slots = (0..count).map(|_| Slot::new(buffer_size)).collect::<Result<Vec<_>>>()?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        event!(Level::DEBUG, message = "created buffer pool", pool = id, count, buffer_size);

        Ok(Self {
            id,
            buffer_size,
            slots,
            in_use: 0,
        })
    }

    /// Takes the lowest-indexed unused slot, clearing its buffer first.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if every slot is in use.
    pub fn acquire(&mut self) -> Result<PooledBuffer> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.used)
            .ok_or(Error::Busy)?;

        slot.buffer.clear();
        slot.used = true;
        self.in_use += 1;

        Ok(PooledBuffer { pool_id: self.id, index })
    }

    /// Returns a slot to the pool.
    ///
    /// # Errors
    ///
    /// [`Error::NotFromPool`] if the handle was issued by another pool (or refers to a slot
    /// that no longer exists), [`Error::AlreadyReleased`] if the slot is not in use.
    pub fn release(&mut self, handle: PooledBuffer) -> Result<()> {
        let slot = self.slot_mut(&handle)?;
        slot.used = false;
        self.in_use -= 1;
        Ok(())
    }

    /// The buffer behind `handle`.
    ///
    /// # Errors
    ///
    /// As for [`release()`][Self::release].
    pub fn get(&self, handle: &PooledBuffer) -> Result<&ByteBuffer> {
        if handle.pool_id != self.id {
            return Err(Error::NotFromPool);
        }

        match self.slots.get(handle.index) {
            Some(slot) if slot.used => Ok(&slot.buffer),
            Some(_) => Err(Error::AlreadyReleased),
            None => Err(Error::NotFromPool),
        }
    }

    /// The buffer behind `handle`, mutably.
    ///
    /// # Errors
    ///
    /// As for [`release()`][Self::release].
    pub fn get_mut(&mut self, handle: &PooledBuffer) -> Result<&mut ByteBuffer> {
        Ok(&mut self.slot_mut(handle)?.buffer)
    }

    /// Changes the number of slots to `count`.
    ///
    /// Growing appends freshly allocated slots. Shrinking keeps the slots with the lowest
    /// indices and frees the rest, so outstanding handles stay valid.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if `count` is below the number of buffers in use, or if a buffer in use
    /// occupies a slot that would be removed.
    pub fn resize(&mut self, count: usize) -> Result<()> {
        if count < self.in_use || self.slots.iter().skip(count).any(|slot| slot.used) {
            return Err(Error::Busy);
        }

        if count > self.slots.len() {
            let missing = count - self.slots.len();
            self.slots.try_reserve_exact(missing).map_err(|_alloc| Error::OutOfMemory(missing))?;
            for _ in 0..missing {
                self.slots.push(Slot::new(self.buffer_size)?);
            }
        } else {
            self.slots.truncate(count);
            self.slots.shrink_to_fit();
        }

        event!(Level::DEBUG, message = "resized buffer pool", pool = self.id, count);
        Ok(())
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently acquired.
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of slots that can be acquired.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.len() - self.in_use
    }

    /// Size in bytes of every pooled buffer.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn slot_mut(&mut self, handle: &PooledBuffer) -> Result<&mut Slot> {
        if handle.pool_id != self.id {
            return Err(Error::NotFromPool);
        }

        match self.slots.get_mut(handle.index) {
            Some(slot) if slot.used => Ok(slot),
            Some(_) => Err(Error::AlreadyReleased),
            None => Err(Error::NotFromPool),
        }
    }
}

impl Slot {
    fn new(buffer_size: usize) -> Result<Self> {
        Ok(Self {
            buffer: ByteBuffer::with_strategy(buffer_size, GrowthStrategy::Fixed)?,
            used: false,
        })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BufferPool: Send);
    assert_not_impl_any!(PooledBuffer: Clone, Copy);

    #[test]
    fn acquire_until_busy() {
        let mut pool = BufferPool::new(2, 64).unwrap();

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();

        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert!(matches!(pool.acquire(), Err(Error::Busy)));
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn acquire_clears_reused_buffer() {
        let mut pool = BufferPool::new(1, 64).unwrap();

        let handle = pool.acquire().unwrap();
        pool.get_mut(&handle).unwrap().write(b"stale").unwrap();
        pool.release(handle).unwrap();

        let handle = pool.acquire().unwrap();
        let buffer = pool.get(&handle).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.tell(), 0);
        assert_eq!(buffer.capacity(), 64);
    }

    #[test]
    fn pooled_buffers_do_not_grow() {
        let mut pool = BufferPool::new(1, 8).unwrap();
        let handle = pool.acquire().unwrap();

        let error = pool.get_mut(&handle).unwrap().write(&[0; 9]).unwrap_err();

        assert!(matches!(error, Error::CapacityExceeded { .. }));
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut first = BufferPool::new(1, 16).unwrap();
        let mut second = BufferPool::new(1, 16).unwrap();

        let handle = first.acquire().unwrap();

        assert!(matches!(second.get(&handle), Err(Error::NotFromPool)));
        assert!(matches!(second.release(handle), Err(Error::NotFromPool)));
        assert_eq!(first.in_use(), 1);
    }

    #[test]
    fn resize_keeps_lowest_slots() {
        let mut pool = BufferPool::new(4, 16).unwrap();
        let kept = pool.acquire().unwrap();

        pool.resize(1).unwrap();

        assert_eq!(pool.capacity(), 1);
        pool.get(&kept).unwrap();
        assert!(matches!(pool.resize(0), Err(Error::Busy)));
    }

    #[test]
    fn resize_refuses_to_drop_used_slot() {
        let mut pool = BufferPool::new(4, 16).unwrap();
        let handles: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        let mut handles = handles.into_iter();
        for handle in handles.by_ref().take(3) {
            pool.release(handle).unwrap();
        }

        // Only slot 3 is in use, which a resize to 2 would remove.
        assert!(matches!(pool.resize(2), Err(Error::Busy)));
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn resize_grows_with_fresh_slots() {
        let mut pool = BufferPool::new(1, 32).unwrap();

        pool.resize(3).unwrap();

        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available(), 3);
        let handle = pool.acquire().unwrap();
        assert_eq!(pool.get(&handle).unwrap().capacity(), 32);
    }
}
