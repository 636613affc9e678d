// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]

//! Pool lifecycle across acquire, release and resize.

use sio_buf::{BufferPool, Error};

#[test]
fn exhaustion_release_and_resize() {
    let mut pool = BufferPool::new(4, 1024).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|index| {
            let handle = pool.acquire().unwrap();
            let text = format!("buffer {index}");
            pool.get_mut(&handle).unwrap().write(text.as_bytes()).unwrap();
            handle
        })
        .collect();

    assert!(matches!(pool.acquire(), Err(Error::Busy)));
    assert_eq!(pool.in_use(), 4);

    let mut handles = handles.into_iter();
    let released = handles.next().unwrap();
    pool.release(released).unwrap();

    let reacquired = pool.acquire().unwrap();
    assert_eq!(reacquired.index(), 0);
    assert!(pool.get(&reacquired).unwrap().is_empty());

    pool.resize(6).unwrap();
    assert_eq!(pool.capacity(), 6);
    assert_eq!(pool.in_use(), 4);
    assert_eq!(pool.available(), 2);

    // The surviving handles still reach their data.
    let second = handles.next().unwrap();
    assert_eq!(pool.get(&second).unwrap().as_slice(), b"buffer 1");

    let fifth = pool.acquire().unwrap();
    let sixth = pool.acquire().unwrap();
    assert_eq!((fifth.index(), sixth.index()), (4, 5));
    assert!(matches!(pool.acquire(), Err(Error::Busy)));
}

#[test]
fn buffer_size_is_uniform() {
    let mut pool = BufferPool::new(3, 100).unwrap();

    let handle = pool.acquire().unwrap();

    assert_eq!(pool.buffer_size(), 100);
    assert!(pool.get(&handle).unwrap().capacity() >= 100);
}
