//! A bounded work-stealing deque.
//!
//! This is a fixed-capacity variant of the Chase–Lev deque. The owning worker
//! pushes and pops at the *bottom* (last-in-first-out) through a [`Deque`],
//! while any number of thieves take from the *top* (first-in-first-out)
//! through cloned [`Stealer`]s.
//!
//! Items are boxed, and each slot of the ring buffer holds an atomic pointer to
//! a box. A thief reads the slot before it races to claim it, and a thief that
//! loses the race simply forgets the pointer it read, so a stale read never
//! touches freed memory. Because the buffer never grows, no memory needs to be
//! reclaimed while thieves may still be looking at it. When the buffer is full
//! [`Deque::push`] hands the item back so the caller can put it somewhere else.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr;

use crate::platform::*;

// -----------------------------------------------------------------------------
// Padding

/// Pads and aligns a value to the length of a cache line, so that the owner's
/// index and the thieves' index do not share a line.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
struct CachePadded<T>(T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

// -----------------------------------------------------------------------------
// Shared buffer

struct Buffer<T> {
    /// One past the most recently pushed item. Only written by the owner.
    bottom: CachePadded<AtomicIsize>,
    /// The oldest item still in the deque. Advanced by thieves (and by the
    /// owner when it races them for the last item) with a CAS.
    top: CachePadded<AtomicIsize>,
    /// The ring of boxed items. Its length is a power of two.
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> Buffer<T> {
    #[inline(always)]
    fn slot(&self, index: isize) -> &AtomicPtr<T> {
        // The length is a power of two, so masking wraps the index.
        &self.slots[index as usize & (self.slots.len() - 1)]
    }

    #[inline(always)]
    fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Acquire);
        let top = self.top.load(Ordering::Acquire);
        bottom.saturating_sub(top).max(0) as usize
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        let bottom = *self.bottom.0.get_mut();
        let top = *self.top.0.get_mut();
        for index in top..bottom {
            let item = self.slot(index).load(Ordering::Relaxed);
            // SAFETY: Every index in `top..bottom` holds a pointer produced by
            // `Box::into_raw` in `Deque::push` that was never claimed by a pop
            // or a steal. We have `&mut self`, so nobody else can claim it now.
            drop(unsafe { Box::from_raw(item) });
        }
    }
}

// -----------------------------------------------------------------------------
// Owner half

/// The owner's end of a work-stealing deque.
///
/// There is exactly one `Deque` per buffer and it cannot be shared between
/// threads, which is what makes the unsynchronized bottom index sound.
pub struct Deque<T> {
    buffer: Arc<Buffer<T>>,
    /// Makes the owner `!Sync`: only one thread may push and pop at a time.
    _owner: PhantomData<Cell<()>>,
}

// SAFETY: The owner may be moved to another thread; the items are moved with
// it, so they must be `Send`.
unsafe impl<T: Send> Send for Deque<T> {}

impl<T> Deque<T> {
    /// Creates a new deque with room for at least `capacity` items. The
    /// capacity is rounded up to a power of two, and is at least two.
    pub fn new(capacity: usize) -> Deque<T> {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Deque {
            buffer: Arc::new(Buffer {
                bottom: CachePadded(AtomicIsize::new(0)),
                top: CachePadded(AtomicIsize::new(0)),
                slots,
            }),
            _owner: PhantomData,
        }
    }

    /// Creates a new handle that thieves can use to take items from the top
    /// of this deque.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            buffer: self.buffer.clone(),
        }
    }

    /// Returns the maximum number of items the deque can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.slots.len()
    }

    /// Returns the number of items in the deque. This is only a snapshot when
    /// thieves are active.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the deque appears to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes an item onto the bottom of the deque. If the deque is full, the
    /// item is handed back.
    pub fn push(&self, item: T) -> Result<(), T> {
        let buffer = &*self.buffer;
        let bottom = buffer.bottom.load(Ordering::Relaxed);
        let top = buffer.top.load(Ordering::Acquire);

        // `top` only grows, so if there is room now there is room when we
        // store; the slot we write cannot be one a thief is able to claim.
        if bottom.wrapping_sub(top) >= buffer.slots.len() as isize {
            return Err(item);
        }

        let item = Box::into_raw(Box::new(item));
        buffer.slot(bottom).store(item, Ordering::Release);
        buffer.bottom.store(bottom + 1, Ordering::Release);
        Ok(())
    }

    /// Pops the most recently pushed item from the bottom of the deque.
    pub fn pop(&self) -> Option<T> {
        let buffer = &*self.buffer;
        let bottom = buffer.bottom.load(Ordering::Relaxed) - 1;

        // Reserve the bottom item before looking at `top`. The fence pairs with
        // the one in `Stealer::steal`, so that either we see the thief's claim
        // or the thief sees our reservation.
        buffer.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = buffer.top.load(Ordering::Relaxed);

        if top > bottom {
            // The deque was empty; undo the reservation.
            buffer.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        let item = buffer.slot(bottom).load(Ordering::Relaxed);

        if top == bottom {
            // This is the last item, and a thief may be trying to take it too.
            // Whoever advances `top` first wins.
            let won = buffer
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            buffer.bottom.store(bottom + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }

        // SAFETY: The pointer was produced by `Box::into_raw` in `push`, and we
        // have claimed its index: either it was strictly above `top` after our
        // reservation, or we won the CAS on `top`. No thief can claim it now.
        Some(*unsafe { Box::from_raw(item) })
    }
}

// -----------------------------------------------------------------------------
// Thief half

/// The outcome of an attempt to steal from a deque.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// The deque was empty.
    Empty,
    /// Lost a race with the owner or another thief. Trying again may succeed.
    Retry,
    /// Claimed the oldest item in the deque.
    Success(T),
}

/// A thief's handle to a deque. Stealers can be cloned and shared freely.
pub struct Stealer<T> {
    buffer: Arc<Buffer<T>>,
}

// SAFETY: Thieves claim items with a CAS on `top`, so each item is moved to
// exactly one thread. That only requires the items to be `Send`.
unsafe impl<T: Send> Send for Stealer<T> {}
// SAFETY: See above; all shared state is accessed through atomics.
unsafe impl<T: Send> Sync for Stealer<T> {}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Stealer<T> {
        Stealer {
            buffer: self.buffer.clone(),
        }
    }
}

impl<T> Stealer<T> {
    /// Returns true if the deque appears to be empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.len() == 0
    }

    /// Attempts to take the oldest item from the top of the deque.
    pub fn steal(&self) -> Steal<T> {
        let buffer = &*self.buffer;
        let top = buffer.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = buffer.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        // Read the slot before claiming it. If the claim fails the pointer may
        // be stale, but we never dereference it in that case.
        let item = buffer.slot(top).load(Ordering::Acquire);

        if buffer
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }

        // SAFETY: We advanced `top` past this index, so we are the only party
        // that claimed it. The slot was written by `push` before `bottom` was
        // published past it, and is not overwritten until `top` has moved on.
        Steal::Success(*unsafe { Box::from_raw(item) })
    }
}
