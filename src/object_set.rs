//! Set based replacement for [`SpaceBitmap`](crate::SpaceBitmap).
//!
//! Large object spaces hold few objects spread over a lot of address space, so a bitmap over them
//! would be almost entirely zero. They track their objects in an ordered set instead.

use std::collections::BTreeSet;

use crate::{internal::space_bitmap::SWEEP_BATCH_SIZE, Address};

pub struct ObjectSet {
    name: String,
    contained: BTreeSet<Address>,
}

impl ObjectSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            contained: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contained.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.contained.len()
    }

    /// Adds `obj`, returning whether it was already present.
    #[inline]
    pub fn set(&mut self, obj: Address) -> bool {
        !self.contained.insert(obj)
    }

    /// Removes `obj`, returning whether it was present. Removing an object twice means the
    /// caller lost track of it.
    #[inline]
    pub fn clear(&mut self, obj: Address) -> bool {
        let removed = self.contained.remove(&obj);
        debug_assert!(removed, "{}: removing untracked object {}", self.name, obj);
        removed
    }

    pub fn clear_all(&mut self) {
        self.contained.clear();
    }

    #[inline]
    pub fn test(&self, obj: Address) -> bool {
        self.contained.contains(&obj)
    }

    /// Visits every object in ascending address order.
    pub fn walk(&self, mut callback: impl FnMut(Address)) {
        for obj in &self.contained {
            callback(*obj);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.contained.iter().copied()
    }

    pub fn copy_from(&mut self, source: &ObjectSet) {
        self.contained.clone_from(&source.contained);
    }

    /// Set counterpart of [`SpaceBitmap::sweep_walk`](crate::SpaceBitmap::sweep_walk): reports
    /// every object of `live` missing from `mark`, in ascending order and in batches.
    pub fn sweep_walk(live: &ObjectSet, mark: &ObjectSet, mut callback: impl FnMut(&[Address])) {
        let mut batch = Vec::with_capacity(SWEEP_BATCH_SIZE);
        for obj in live.contained.difference(&mark.contained) {
            batch.push(*obj);
            if batch.len() == SWEEP_BATCH_SIZE {
                callback(&batch);
                batch.clear();
            }
        }
        if !batch.is_empty() {
            callback(&batch);
        }
    }
}

impl core::fmt::Debug for ObjectSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}[{} objects]", self.name, self.contained.len())
    }
}
