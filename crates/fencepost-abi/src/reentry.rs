//! Per-thread guard against allocator recursion.
//!
//! Anything the heap does while holding the lock that calls back into
//! `malloc` (libc internals, the atexit report, a panic message) must not
//! reach the heap again. The nested call sees no guard and takes the native
//! path.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static INSIDE_HEAP: Cell<bool> = const { Cell::new(false) };
}

/// Held for the duration of one heap call on this thread. `!Send`, since it
/// releases this thread's flag.
pub struct ReentryGuard(PhantomData<*const ()>);

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        INSIDE_HEAP.with(|inside| inside.set(false));
    }
}

/// Enters the allocator on this thread, or `None` when already inside it.
#[inline]
pub fn enter() -> Option<ReentryGuard> {
    // A destroyed TLS slot during thread exit counts as nested.
    INSIDE_HEAP
        .try_with(|inside| (!inside.replace(true)).then(|| ReentryGuard(PhantomData)))
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_entry_is_refused_until_released() {
        let outer = enter().expect("first entry succeeds");
        assert!(enter().is_none());
        assert!(enter().is_none());
        drop(outer);
        assert!(enter().is_some());
    }

    #[test]
    fn guards_are_per_thread() {
        let _outer = enter().unwrap();
        let other = std::thread::spawn(|| enter().is_some()).join().unwrap();
        assert!(other);
    }
}
