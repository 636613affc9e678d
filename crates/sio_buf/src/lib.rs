// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Growable byte buffers and buffer pools.
//!
//! This crate provides the memory layer underneath the `sio` stream library:
//!
//! * [`ByteBuffer`] is a byte container with a size, a capacity and a read/write cursor. Its
//!   storage is either owned (and grows on demand according to a [`GrowthStrategy`]), borrowed
//!   from the caller or a memory-mapped file.
//! * [`BufferPool`] holds a fixed number of equally sized buffers that are acquired and released
//!   through [`PooledBuffer`] handles.
//! * [`Transfer`] describes how many bytes a read or write moved and whether a read reached the
//!   end of its source.
//!
//! ```
//! use std::io::SeekFrom;
//!
//! use sio_buf::ByteBuffer;
//!
//! let mut buffer = ByteBuffer::new(8)?;
//! buffer.write_u32(7)?;
//! buffer.write(b"payload")?;
//!
//! buffer.seek(SeekFrom::Start(0))?;
//! assert_eq!(buffer.read_u32()?, 7);
//! assert_eq!(buffer.current(), b"payload");
//! # Ok::<(), sio_buf::Error>(())
//! ```

mod buffer;
mod error;
mod growth;
mod pool;
mod transfer;

pub use buffer::{ByteBuffer, Ownership};
pub use error::{Error, Result};
pub use growth::{GrowthStrategy, MAX_CAPACITY, OPTIMAL_DOUBLING_LIMIT};
pub use memmap2::{Mmap, MmapMut};
pub use pool::{BufferPool, PooledBuffer};
pub use transfer::Transfer;
