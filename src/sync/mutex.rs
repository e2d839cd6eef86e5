//! Task mutex: a semaphore of one unit guarding a value.
//!
//! There is no ownership tracking and no recursion: a task that locks twice
//! blocks on itself.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::error::Result;
use crate::kernel::Kernel;
use crate::sync::semaphore::Semaphore;

/// Mutual exclusion between tasks of one kernel.
pub struct Mutex<T> {
    sem: Semaphore,
    data: UnsafeCell<T>,
}

/// Access to the value behind a [`Mutex`]. Unlocks on drop.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(kernel: &Kernel, value: T) -> Self {
        Self {
            sem: Semaphore::new(kernel, 1),
            data: UnsafeCell::new(value),
        }
    }

    /// Block until the mutex is free and take it.
    ///
    /// Fails like [`Semaphore::down`].
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.sem.down()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Destroy the mutex; blocked and later lockers get
    /// [`Error::Destroyed`](crate::Error::Destroyed).
    pub fn destroy(&self) -> Result<()> {
        self.sem.destroy()
    }

    pub fn is_locked(&self) -> bool {
        self.sem.value() <= 0
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the semaphore admits one guard at a time.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.sem.up() {
            log::debug!("mutex unlock failed: {err}");
        }
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}
