use core::cell::UnsafeCell;
use core::ops::{
    Deref,
    DerefMut,
};
use core::sync::atomic::{
    AtomicBool,
    Ordering,
};

const UNLOCKED: bool = false;
const LOCKED: bool = true;

/// A simple spin lock. The core library doesn't have a mutex and the allocator can't
/// depend on one that allocates, therefore it brings its own.
///
/// Not reentrant: locking it twice from the same thread dead-locks.
#[derive(Debug)]
pub struct SimpleMutex<T> {
    data: UnsafeCell<T>,
    lock: AtomicBool,
}

unsafe impl<T: Send> Send for SimpleMutex<T> {}
unsafe impl<T: Send> Sync for SimpleMutex<T> {}

impl<T> SimpleMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            lock: AtomicBool::new(UNLOCKED),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Access without locking; the exclusive borrow guarantees that nobody holds the lock.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Spins until the lock is obtained.
    pub fn lock(&self) -> SimpleMutexGuard<T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // wait for the lock to be released before trying the expensive CAS again
            while self.lock.load(Ordering::Relaxed) == LOCKED {
                core::hint::spin_loop();
            }
        }
    }

    /// Returns `None` if the lock is currently held.
    pub fn try_lock(&self) -> Option<SimpleMutexGuard<T>> {
        self.lock
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SimpleMutexGuard { lock: self })
    }
}

impl<T: Default> Default for SimpleMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[derive(Debug)]
pub struct SimpleMutexGuard<'a, T> {
    lock: &'a SimpleMutex<T>,
}

impl<T> Deref for SimpleMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists, hence we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SimpleMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists, hence we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SimpleMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.lock.store(UNLOCKED, Ordering::Release);
    }
}
