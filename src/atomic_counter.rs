use atomic::{Atomic, Ordering};

/// 32-bit counter shared between mutator and collector threads.
///
/// `load` and `store` are plain accesses for callers that already have exclusive access or do
/// not care about ordering. Every read-modify-write is `AcqRel`, so whatever a thread wrote before
/// publishing a new counter value is visible to the thread that observes it.
#[repr(transparent)]
pub struct AtomicCounter {
    value: Atomic<i32>,
}

impl AtomicCounter {
    pub const fn new(value: i32) -> Self {
        Self {
            value: Atomic::new(value),
        }
    }

    #[inline(always)]
    pub fn load(&self) -> i32 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store(&self, value: i32) {
        self.value.store(value, Ordering::Relaxed)
    }

    /// Returns the value before the addition.
    #[inline(always)]
    pub fn fetch_add(&self, value: i32) -> i32 {
        self.value.fetch_add(value, Ordering::AcqRel)
    }

    /// Returns the value before the subtraction.
    #[inline(always)]
    pub fn fetch_sub(&self, value: i32) -> i32 {
        self.value.fetch_sub(value, Ordering::AcqRel)
    }

    /// Prefix increment, returns the new value.
    #[inline(always)]
    pub fn increment(&self) -> i32 {
        self.fetch_add(1).wrapping_add(1)
    }

    /// Prefix decrement, returns the new value.
    #[inline(always)]
    pub fn decrement(&self) -> i32 {
        self.fetch_sub(1).wrapping_sub(1)
    }

    /// Postfix increment, returns the old value.
    #[inline(always)]
    pub fn post_increment(&self) -> i32 {
        self.fetch_add(1)
    }

    /// Postfix decrement, returns the old value.
    #[inline(always)]
    pub fn post_decrement(&self) -> i32 {
        self.fetch_sub(1)
    }

    /// Replaces the value with `desired` if it is `expected`. Returns whether the swap happened.
    #[inline(always)]
    pub fn compare_and_swap(&self, expected: i32, desired: i32) -> bool {
        self.value
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Like [`compare_and_swap`](Self::compare_and_swap) but may fail spuriously, for use in retry
    /// loops.
    #[inline(always)]
    pub fn compare_and_swap_weak(&self, expected: i32, desired: i32) -> bool {
        self.value
            .compare_exchange_weak(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl core::fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.load())
    }
}
