use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicIsize, AtomicUsize, Ordering};

const MAX_REFCOUNT: isize = isize::MAX / 2;

struct RefBox<T> {
    strong: AtomicIsize,
    // Every live strong handle shares one implicit weak reference.
    weak: AtomicUsize,
    value: ManuallyDrop<T>,
}

/// Shared handle to an object that crosses the native/script boundary.
///
/// The count starts at 1 when the object is created. Cloning increments it, dropping decrements it,
/// and the object is destroyed on the thread that performs the transition to zero.
pub struct Handle<T> {
    ptr: NonNull<RefBox<T>>,
    _marker: PhantomData<RefBox<T>>,
}

/// Liveness flag for a [`Handle`] that does not keep the object alive.
pub struct WeakHandle<T> {
    ptr: NonNull<RefBox<T>>,
    _marker: PhantomData<RefBox<T>>,
}

unsafe impl<T: Send + Sync> Send for Handle<T> {}
unsafe impl<T: Send + Sync> Sync for Handle<T> {}
unsafe impl<T: Send + Sync> Send for WeakHandle<T> {}
unsafe impl<T: Send + Sync> Sync for WeakHandle<T> {}

impl<T> Handle<T> {
    pub fn new(value: T) -> Self {
        let boxed = Box::new(RefBox {
            strong: AtomicIsize::new(1),
            weak: AtomicUsize::new(1),
            value: ManuallyDrop::new(value),
        });
        Self { ptr: NonNull::from(Box::leak(boxed)), _marker: PhantomData }
    }

    fn inner(&self) -> &RefBox<T> {
        // SAFETY: the allocation outlives every strong handle.
        unsafe { self.ptr.as_ref() }
    }

    pub fn ref_count(this: &Self) -> isize {
        this.inner().strong.load(Ordering::Acquire)
    }

    pub fn downgrade(this: &Self) -> WeakHandle<T> {
        this.inner().weak.fetch_add(1, Ordering::Relaxed);
        WeakHandle { ptr: this.ptr, _marker: PhantomData }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Stable address of the shared object, usable as an identity key.
    pub fn as_ptr(this: &Self) -> *const T {
        &*this.inner().value as *const T
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        let previous = self.inner().strong.fetch_add(1, Ordering::Relaxed);
        if previous > MAX_REFCOUNT {
            std::process::abort();
        }
        Self { ptr: self.ptr, _marker: PhantomData }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        let previous = self.inner().strong.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "reference count went negative");
        if previous != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        // SAFETY: this was the last strong handle, so nothing else reads the value.
        unsafe { ManuallyDrop::drop(&mut (*self.ptr.as_ptr()).value) };
        drop(WeakHandle { ptr: self.ptr, _marker: PhantomData });
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T> WeakHandle<T> {
    fn inner(&self) -> &RefBox<T> {
        // SAFETY: weak handles keep the allocation (not the value) alive.
        unsafe { self.ptr.as_ref() }
    }

    /// Takes a strong reference if the object is still alive. Never resurrects a dead object.
    pub fn upgrade(&self) -> Option<Handle<T>> {
        let strong = &self.inner().strong;
        let mut current = strong.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return None;
            }
            if current > MAX_REFCOUNT {
                std::process::abort();
            }
            match strong.compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Some(Handle { ptr: self.ptr, _marker: PhantomData }),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner().strong.load(Ordering::Acquire) > 0
    }

    pub fn ptr_eq(&self, other: &Handle<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        self.inner().weak.fetch_add(1, Ordering::Relaxed);
        Self { ptr: self.ptr, _marker: PhantomData }
    }
}

impl<T> Drop for WeakHandle<T> {
    fn drop(&mut self) {
        if self.inner().weak.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        // SAFETY: last weak reference and the value has already been dropped.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

impl<T> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakHandle(alive: {})", self.is_alive())
    }
}
