//! Fixed capacity address stacks used as the collector's mark stack and the heap's allocation
//! stack.
//!
//! Both faces of a stack share one [`StackStorage`]: a memory mapped array of slots and the
//! `[front, back)` window of it that holds the current content. Threads race to push onto a
//! [`ConcurrentStack`] through `&self`; a [`SingleThreadedStack`] pushes and pops through
//! `&mut self` without any atomic read-modify-write. Switching between the two consumes the
//! stack, so a pop can never run concurrently with a push and the ABA problem of mixing the two
//! modes on one stack cannot come up.

use core::fmt;
use std::{
    mem::size_of,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::{
    error::{AccountingError, AccountingResult},
    mmap::MemMap,
    Address, AtomicCounter,
};

pub struct StackStorage {
    mem_map: MemMap,
    begin: *mut AtomicUsize,
    capacity: usize,
    /// Index of the first live slot.
    front_index: CachePadded<AtomicCounter>,
    /// Index one past the last live slot.
    back_index: CachePadded<AtomicCounter>,
    /// Whether `[front, back)` is sorted. Only tracked with debug assertions enabled.
    debug_is_sorted: AtomicBool,
    name: String,
}

unsafe impl Send for StackStorage {}
unsafe impl Sync for StackStorage {}

impl StackStorage {
    fn create(name: &str, capacity: usize) -> AccountingResult<Self> {
        let mem_map = Self::map(name, capacity)?;
        Ok(Self {
            begin: mem_map.begin().cast(),
            mem_map,
            capacity,
            front_index: CachePadded::new(AtomicCounter::new(0)),
            back_index: CachePadded::new(AtomicCounter::new(0)),
            debug_is_sorted: AtomicBool::new(true),
            name: name.to_owned(),
        })
    }

    fn map(name: &str, capacity: usize) -> AccountingResult<MemMap> {
        if capacity > i32::MAX as usize {
            return Err(AccountingError::CapacityTooLarge {
                name: name.to_owned(),
                capacity,
            });
        }
        MemMap::map_anonymous(name, capacity * size_of::<usize>())
    }

    #[inline(always)]
    fn slots(&self) -> &[AtomicUsize] {
        unsafe { std::slice::from_raw_parts(self.begin, self.capacity) }
    }

    #[inline(always)]
    fn front(&self) -> usize {
        self.front_index.load() as usize
    }

    #[inline(always)]
    fn back(&self) -> usize {
        self.back_index.load() as usize
    }

    #[inline(always)]
    fn invalidate_sorted(&self) {
        if cfg!(debug_assertions) {
            self.debug_is_sorted.store(false, Ordering::Relaxed);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.back() - self.front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.back() >= self.capacity
    }

    /// Snapshot of the content from front to back.
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        let slots = self.slots();
        (self.front()..self.back())
            .map(move |i| Address::from_usize(slots[i].load(Ordering::Relaxed)))
    }

    /// Linear search, usable at any time.
    pub fn contains(&self, value: Address) -> bool {
        self.iter().any(|v| v == value)
    }

    /// Binary search. Only valid after [`sort`](Self::sort) and before the next push.
    pub fn contains_sorted(&self, value: Address) -> bool {
        debug_assert!(
            self.debug_is_sorted.load(Ordering::Relaxed),
            "{} is not sorted",
            self.name
        );
        let slots = &self.slots()[self.front()..self.back()];
        slots
            .binary_search_by(|slot| slot.load(Ordering::Relaxed).cmp(&value.as_usize()))
            .is_ok()
    }

    /// Sorts `[front, back)` in place for [`contains_sorted`](Self::contains_sorted). Front and
    /// back stay where they are.
    pub fn sort(&mut self) {
        let (front, back) = (self.front(), self.back());
        let slots =
            unsafe { std::slice::from_raw_parts_mut(self.begin.cast::<usize>(), self.capacity) };
        slots[front..back].sort_unstable();
        self.debug_is_sorted.store(true, Ordering::Relaxed);
    }

    /// Empties the stack and lets the OS reclaim its pages. Capacity is unchanged.
    pub fn reset(&mut self) {
        self.mem_map.madvise_dontneed();
        self.front_index.store(0);
        self.back_index.store(0);
        self.debug_is_sorted.store(true, Ordering::Relaxed);
        log::trace!("reset {}", self.name);
    }

    /// Replaces the backing storage with one of `new_capacity` slots. The content is dropped.
    pub fn resize(&mut self, new_capacity: usize) -> AccountingResult<()> {
        let mem_map = Self::map(&self.name, new_capacity)?;
        self.begin = mem_map.begin().cast();
        self.mem_map = mem_map;
        self.capacity = new_capacity;
        self.front_index.store(0);
        self.back_index.store(0);
        self.debug_is_sorted.store(true, Ordering::Relaxed);
        log::debug!("resized {} to {} entries", self.name, new_capacity);
        Ok(())
    }
}

impl fmt::Display for StackStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[front={},back={},capacity={}]",
            self.name,
            self.front(),
            self.back(),
            self.capacity
        )
    }
}

/// Stack that any number of threads may push onto at once.
pub struct ConcurrentStack {
    storage: StackStorage,
}

impl ConcurrentStack {
    pub fn create(name: &str, capacity: usize) -> AccountingResult<Self> {
        Ok(Self {
            storage: StackStorage::create(name, capacity)?,
        })
    }

    /// Claims the next slot with a CAS on the back index and stores `value` in it. Returns false,
    /// leaving the stack untouched, when the stack is full.
    pub fn atomic_push_back(&self, value: Address) -> bool {
        let storage = &self.storage;
        let mut index;
        loop {
            index = storage.back_index.load();
            if index as usize >= storage.capacity {
                return false;
            }
            if storage.back_index.compare_and_swap_weak(index, index + 1) {
                break;
            }
        }
        storage.invalidate_sorted();
        debug_assert!(storage.front() <= index as usize);
        storage.slots()[index as usize].store(value.as_usize(), Ordering::Relaxed);
        true
    }

    pub fn into_single_threaded(self) -> SingleThreadedStack {
        SingleThreadedStack {
            storage: self.storage,
        }
    }
}

/// Stack owned by one thread, used while marking drains the work list.
pub struct SingleThreadedStack {
    storage: StackStorage,
}

/// The collector's mark stack.
pub type ObjectStack = SingleThreadedStack;

impl SingleThreadedStack {
    pub fn create(name: &str, capacity: usize) -> AccountingResult<Self> {
        Ok(Self {
            storage: StackStorage::create(name, capacity)?,
        })
    }

    /// # Panics
    ///
    /// Panics if the stack is full; check [`is_full`](StackStorage::is_full) first.
    #[inline]
    pub fn push_back(&mut self, value: Address) {
        let index = self.storage.back();
        assert!(index < self.storage.capacity, "{} overflowed", self.storage.name);
        self.storage.slots()[index].store(value.as_usize(), Ordering::Relaxed);
        self.storage.back_index.store(index as i32 + 1);
        self.storage.invalidate_sorted();
    }

    #[inline]
    pub fn pop_back(&mut self) -> Option<Address> {
        let back = self.storage.back();
        if back == self.storage.front() {
            return None;
        }
        self.storage.back_index.store(back as i32 - 1);
        Some(Address::from_usize(
            self.storage.slots()[back - 1].load(Ordering::Relaxed),
        ))
    }

    /// Takes from the opposite end, for breadth-first draining.
    #[inline]
    pub fn pop_front(&mut self) -> Option<Address> {
        let front = self.storage.front();
        if front == self.storage.back() {
            return None;
        }
        self.storage.front_index.store(front as i32 + 1);
        Some(Address::from_usize(
            self.storage.slots()[front].load(Ordering::Relaxed),
        ))
    }

    /// Drops the last `n` entries.
    pub fn pop_back_count(&mut self, n: usize) {
        debug_assert!(n <= self.storage.size());
        let n = n.min(self.storage.size());
        let back = self.storage.back();
        self.storage.back_index.store((back - n) as i32);
    }

    pub fn into_concurrent(self) -> ConcurrentStack {
        ConcurrentStack {
            storage: self.storage,
        }
    }
}

impl Deref for ConcurrentStack {
    type Target = StackStorage;
    fn deref(&self) -> &StackStorage {
        &self.storage
    }
}

impl DerefMut for ConcurrentStack {
    fn deref_mut(&mut self) -> &mut StackStorage {
        &mut self.storage
    }
}

impl Deref for SingleThreadedStack {
    type Target = StackStorage;
    fn deref(&self) -> &StackStorage {
        &self.storage
    }
}

impl DerefMut for SingleThreadedStack {
    fn deref_mut(&mut self) -> &mut StackStorage {
        &mut self.storage
    }
}

impl From<ConcurrentStack> for SingleThreadedStack {
    fn from(stack: ConcurrentStack) -> Self {
        stack.into_single_threaded()
    }
}

impl From<SingleThreadedStack> for ConcurrentStack {
    fn from(stack: SingleThreadedStack) -> Self {
        stack.into_concurrent()
    }
}
