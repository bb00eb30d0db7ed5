//! A heap-free replacement for boxed closures.
//!
//! A [`Callback`] stores any compatible callable inline in a small
//! fixed-capacity buffer. Whether it fits is checked at compile time, so
//! there is no runtime failure path. Callbacks are move-only and invoke at
//! most once.

use core::mem::{align_of, needs_drop, size_of, MaybeUninit};
use core::ptr;

/// The default callback storage capacity, in pointer-sized words.
pub const DEFAULT_CALLBACK_WORDS: usize = 4;

/// A deferred, move-only callable with inline storage.
///
/// Invoking an empty `Callback<()>` does nothing; invoking an empty
/// callback with a return value yields `None`, a non-empty one yields
/// `Some(value)`.
pub struct Callback<R = (), const WORDS: usize = DEFAULT_CALLBACK_WORDS> {
    storage: [MaybeUninit<usize>; WORDS],
    call: Option<unsafe fn(*mut ()) -> R>,
    drop: Option<unsafe fn(*mut ())>,
}

impl<R, const WORDS: usize> Callback<R, WORDS> {
    /// Creates an empty `Callback`.
    pub const fn empty() -> Callback<R, WORDS> {
        Callback {
            storage: [MaybeUninit::uninit(); WORDS],
            call: None,
            drop: None,
        }
    }

    /// Creates a `Callback` executing `f` when invoked.
    ///
    /// Fails to compile when `f` does not fit the inline storage.
    pub fn new<F>(f: F) -> Callback<R, WORDS>
    where
        F: FnOnce() -> R + Send,
    {
        const {
            assert!(
                size_of::<F>() <= WORDS * size_of::<usize>(),
                "cannot store the callable in the callback"
            );
            assert!(
                align_of::<F>() <= align_of::<usize>(),
                "callable is over-aligned for the callback storage"
            );
        }

        let mut callback = Callback::empty();
        unsafe {
            ptr::write(callback.storage.as_mut_ptr() as *mut F, f);
        }
        callback.call = Some(call_erased::<R, F>);
        callback.drop = if needs_drop::<F>() {
            Some(drop_erased::<F>)
        } else {
            None
        };
        callback
    }

    /// Checks whether there is a callable stored.
    pub fn is_empty(&self) -> bool {
        self.call.is_none()
    }

    /// Invokes and consumes the stored callable, leaving the callback
    /// empty. Returns `None` when there was nothing stored.
    pub fn invoke(&mut self) -> Option<R> {
        let call = self.call.take()?;
        self.drop = None;
        Some(unsafe { call(self.storage.as_mut_ptr() as *mut ()) })
    }
}

unsafe fn call_erased<R, F: FnOnce() -> R>(storage: *mut ()) -> R {
    (storage as *mut F).read()()
}

unsafe fn drop_erased<F>(storage: *mut ()) {
    ptr::drop_in_place(storage as *mut F);
}

impl<R, const WORDS: usize> Drop for Callback<R, WORDS> {
    fn drop(&mut self) {
        if let Some(drop) = self.drop.take() {
            unsafe { drop(self.storage.as_mut_ptr() as *mut ()) };
        }
    }
}

impl<R, const WORDS: usize> Default for Callback<R, WORDS> {
    fn default() -> Callback<R, WORDS> {
        Callback::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn invoke_returns_value() {
        let mut cb: Callback<u32> = Callback::new(|| 42);
        assert!(!cb.is_empty());
        assert_eq!(cb.invoke(), Some(42));
        assert!(cb.is_empty());
        assert_eq!(cb.invoke(), None);
    }

    #[test]
    fn empty_invoke_is_absent() {
        let mut cb: Callback<u32> = Callback::empty();
        assert_eq!(cb.invoke(), None);
        let mut cb: Callback = Callback::empty();
        assert_eq!(cb.invoke(), None);
    }

    #[test]
    fn captures_state() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut cb: Callback = Callback::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        cb.invoke();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drops_uninvoked_capture() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: Callback = Callback::new(move || {
            let _ = &h;
        });
        assert_eq!(Arc::strong_count(&hits), 2);
        drop(cb);
        assert_eq!(Arc::strong_count(&hits), 1);
    }

    #[test]
    fn invoked_capture_not_dropped_twice() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut cb: Callback = Callback::new(move || {
            drop(h);
        });
        cb.invoke();
        assert_eq!(Arc::strong_count(&hits), 1);
        drop(cb);
        assert_eq!(Arc::strong_count(&hits), 1);
    }

    #[test]
    fn assignment_replaces_previous() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut cb: Callback = Callback::new(move || {
            let _ = &h;
        });
        cb = Callback::new(|| {});
        assert_eq!(Arc::strong_count(&hits), 1);
        assert_eq!(cb.invoke(), Some(()));
    }
}
