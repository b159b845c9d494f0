//! Pooled frame buffers for the WSFS wire protocol.
//!
//! Hot read/write paths must not allocate per request, so every frame is
//! backed by a fixed [`MAX_FRAME`](crate::protocol::MAX_FRAME)-sized slab
//! borrowed from a process-wide free list. [`Frame`] is the lease: its
//! storage returns to the pool when it is dropped, which keeps borrow and
//! return balanced by scope.

mod frame;

pub use frame::{Frame, FrameReader};

use std::sync::OnceLock;

use crossbeam_queue::ArrayQueue;

use crate::protocol::MAX_FRAME;

/// Upper bound on idle slabs retained by the pool. Slabs released while
/// the pool is full are simply freed.
const POOL_SLOTS: usize = 256;

static POOL: OnceLock<ArrayQueue<Box<[u8]>>> = OnceLock::new();

fn pool() -> &'static ArrayQueue<Box<[u8]>> {
    POOL.get_or_init(|| ArrayQueue::new(POOL_SLOTS))
}

/// Borrows an empty frame from the pool, allocating a fresh slab when the
/// free list is empty.
pub fn take() -> Frame {
    let storage = match pool().pop() {
        Some(storage) => storage,
        None => vec![0u8; MAX_FRAME].into_boxed_slice(),
    };
    Frame::from_storage(storage)
}

pub(crate) fn give_back(storage: Box<[u8]>) {
    if storage.len() == MAX_FRAME {
        let _ = pool().push(storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_empty_frame() {
        let frame = take();
        assert_eq!(frame.len(), 0);
        assert_eq!(frame.capacity(), MAX_FRAME);
    }

    #[test]
    fn dropped_frames_are_reused() {
        let mut frame = take();
        frame.put_u32(0xDEAD_BEEF);
        drop(frame);

        // The recycled slab must come back with a reset cursor.
        let frame = take();
        assert_eq!(frame.len(), 0);
    }
}
