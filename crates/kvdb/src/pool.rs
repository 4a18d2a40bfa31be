use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Inner {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

/// Caps the number of concurrently open table iterators.
///
/// Every scan holds an [`IteratorToken`] for as long as it reads from the
/// underlying engine; the token goes back to the pool when dropped.
#[derive(Clone)]
pub struct IteratorPool {
    inner: Arc<Inner>,
}

impl IteratorPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                available: Mutex::new(capacity),
                released: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Takes a token, waiting until one is released if the pool is exhausted.
    pub fn acquire(&self) -> IteratorToken {
        let mut available = self.inner.available.lock();
        while *available == 0 {
            self.inner.released.wait(&mut available);
        }
        *available -= 1;
        IteratorToken {
            inner: self.inner.clone(),
        }
    }

    pub fn try_acquire(&self) -> Option<IteratorToken> {
        let mut available = self.inner.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(IteratorToken {
            inner: self.inner.clone(),
        })
    }

    pub fn available(&self) -> usize {
        *self.inner.available.lock()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Default for IteratorPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Permission to hold one open iterator.
pub struct IteratorToken {
    inner: Arc<Inner>,
}

impl Drop for IteratorToken {
    fn drop(&mut self) {
        *self.inner.available.lock() += 1;
        self.inner.released.notify_one();
    }
}
