use std::mem::swap;

use atomic::{Atomic, Ordering};

use crate::{
    error::AccountingResult, internal::space_bitmap::MarkBitmap, object_set::ObjectSet, Address,
};

/// Which collections may free objects of a space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcRetentionPolicy {
    /// Objects are retained forever.
    NeverCollect,
    /// Every collection may free objects.
    AlwaysCollect,
    /// Objects are only freed by full collections.
    FullCollect,
}

/// A space backed by one contiguous address range, `[begin, limit)`, of which `[begin, end)` is
/// in use.
///
/// The space does not own the memory it describes, only its live and mark bitmaps.
pub struct ContinuousSpace {
    name: String,
    begin: Address,
    end: Atomic<usize>,
    limit: Address,
    policy: GcRetentionPolicy,
    live_bitmap: MarkBitmap,
    mark_bitmap: MarkBitmap,
}

impl ContinuousSpace {
    pub fn create(
        name: &str,
        begin: Address,
        initial_size: usize,
        capacity: usize,
        policy: GcRetentionPolicy,
    ) -> AccountingResult<Self> {
        assert!(initial_size <= capacity);
        let live_bitmap =
            MarkBitmap::create(&format!("{} live bitmap", name), begin, initial_size)?;
        let mark_bitmap =
            MarkBitmap::create(&format!("{} mark bitmap", name), begin, initial_size)?;
        log::debug!(
            "created space {} {}-{} (limit {})",
            name,
            begin,
            begin.offset(initial_size),
            begin.offset(capacity)
        );
        Ok(Self {
            name: name.to_owned(),
            begin,
            end: Atomic::new(begin.offset(initial_size).as_usize()),
            limit: begin.offset(capacity),
            policy,
            live_bitmap,
            mark_bitmap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn end(&self) -> Address {
        Address::from_usize(self.end.load(Ordering::Relaxed))
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn gc_retention_policy(&self) -> GcRetentionPolicy {
        self.policy
    }

    /// Bytes in use.
    pub fn size(&self) -> usize {
        self.end().diff(self.begin)
    }

    /// Bytes the space may grow to.
    pub fn capacity(&self) -> usize {
        self.limit.diff(self.begin)
    }

    /// Is `obj` inside the part of the space that is in use?
    pub fn contains(&self, obj: Address) -> bool {
        obj >= self.begin && obj < self.end()
    }

    /// Is `obj` inside the reserved range of the space?
    pub fn has_address(&self, obj: Address) -> bool {
        obj >= self.begin && obj < self.limit
    }

    pub fn live_bitmap(&self) -> &MarkBitmap {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bitmap
    }

    pub fn mark_bitmap_mut(&mut self) -> &mut MarkBitmap {
        &mut self.mark_bitmap
    }

    /// Moves the end of the used range, growing both bitmaps when they no longer cover it.
    pub fn set_end(&mut self, end: Address) -> AccountingResult<()> {
        assert!(
            end >= self.begin && end <= self.limit,
            "{}: end {} outside of {}-{}",
            self.name,
            end,
            self.begin,
            self.limit
        );
        if end > self.live_bitmap.heap_limit() {
            self.live_bitmap.set_heap_limit(end)?;
            self.mark_bitmap.set_heap_limit(end)?;
        }
        self.end.store(end.as_usize(), Ordering::Relaxed);
        Ok(())
    }

    /// Exchanges the live and mark bitmaps, keeping their names with their roles.
    pub fn swap_bitmaps(&mut self) {
        swap(&mut self.live_bitmap, &mut self.mark_bitmap);
        let live_name = self.mark_bitmap.name().to_owned();
        let mark_name = self.live_bitmap.name().to_owned();
        self.live_bitmap.set_name(&live_name);
        self.mark_bitmap.set_name(&mark_name);
    }

    /// Reports every object live but not marked in `[begin, end)` to `callback` in batches and
    /// returns how many there were.
    ///
    /// With `swap_bitmaps` the roles of the bitmaps are exchanged, for collections that already
    /// swapped them. Otherwise the freed objects are also removed from the live bitmap.
    pub fn sweep(&self, swap_bitmaps: bool, mut callback: impl FnMut(&[Address])) -> usize {
        let (live, mark) = if swap_bitmaps {
            (&self.mark_bitmap, &self.live_bitmap)
        } else {
            (&self.live_bitmap, &self.mark_bitmap)
        };
        let mut freed = 0;
        MarkBitmap::sweep_walk(live, mark, self.begin, self.end(), |batch| {
            freed += batch.len();
            callback(batch);
            if !swap_bitmaps {
                for obj in batch {
                    live.clear(*obj);
                }
            }
        });
        log::trace!("{}: swept {} objects", self.name, freed);
        freed
    }
}

impl std::fmt::Debug for ContinuousSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}->{}(limit {}) {:?}",
            self.name,
            self.begin,
            self.end(),
            self.limit,
            self.policy
        )
    }
}

/// A space whose objects are scattered over memory, such as large objects mapped one by one.
pub struct DiscontinuousSpace {
    name: String,
    policy: GcRetentionPolicy,
    live_objects: ObjectSet,
    mark_objects: ObjectSet,
}

impl DiscontinuousSpace {
    pub fn new(name: &str, policy: GcRetentionPolicy) -> Self {
        Self {
            name: name.to_owned(),
            policy,
            live_objects: ObjectSet::new(&format!("{} live objects", name)),
            mark_objects: ObjectSet::new(&format!("{} mark objects", name)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gc_retention_policy(&self) -> GcRetentionPolicy {
        self.policy
    }

    pub fn contains(&self, obj: Address) -> bool {
        self.live_objects.test(obj)
    }

    pub fn live_objects(&self) -> &ObjectSet {
        &self.live_objects
    }

    pub fn live_objects_mut(&mut self) -> &mut ObjectSet {
        &mut self.live_objects
    }

    pub fn mark_objects(&self) -> &ObjectSet {
        &self.mark_objects
    }

    pub fn mark_objects_mut(&mut self) -> &mut ObjectSet {
        &mut self.mark_objects
    }

    pub fn swap_bitmaps(&mut self) {
        swap(&mut self.live_objects, &mut self.mark_objects);
        let live_name = self.mark_objects.name().to_owned();
        let mark_name = self.live_objects.name().to_owned();
        self.live_objects.set_name(&live_name);
        self.mark_objects.set_name(&mark_name);
    }

    /// Set counterpart of [`ContinuousSpace::sweep`].
    pub fn sweep(&mut self, swap_bitmaps: bool, mut callback: impl FnMut(&[Address])) -> usize {
        let (live, mark) = if swap_bitmaps {
            (&self.mark_objects, &self.live_objects)
        } else {
            (&self.live_objects, &self.mark_objects)
        };
        let mut dead = Vec::new();
        ObjectSet::sweep_walk(live, mark, |batch| {
            callback(batch);
            dead.extend_from_slice(batch);
        });
        if !swap_bitmaps {
            for obj in &dead {
                self.live_objects.clear(*obj);
            }
        }
        log::trace!("{}: swept {} objects", self.name, dead.len());
        dead.len()
    }
}

impl std::fmt::Debug for DiscontinuousSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?} {:?}", self.name, self.live_objects, self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEGIN: Address = Address::from_usize(0x2000_0000);

    #[test]
    fn ranges() {
        let space = ContinuousSpace::create(
            "alloc space",
            BEGIN,
            4096,
            64 * 1024,
            GcRetentionPolicy::AlwaysCollect,
        )
        .unwrap();
        assert_eq!(space.size(), 4096);
        assert_eq!(space.capacity(), 64 * 1024);
        assert!(space.contains(BEGIN.offset(8)));
        assert!(!space.contains(BEGIN.offset(4096)));
        assert!(space.has_address(BEGIN.offset(4096)));
        assert!(!space.has_address(BEGIN.offset(64 * 1024)));
        assert_eq!(space.gc_retention_policy(), GcRetentionPolicy::AlwaysCollect);
    }

    #[test]
    fn set_end_grows_bitmaps() {
        let mut space = ContinuousSpace::create(
            "alloc space",
            BEGIN,
            4096,
            1024 * 1024,
            GcRetentionPolicy::AlwaysCollect,
        )
        .unwrap();
        space.live_bitmap().set(BEGIN.offset(64));
        let new_end = BEGIN.offset(512 * 1024);
        space.set_end(new_end).unwrap();
        assert_eq!(space.end(), new_end);
        assert!(space.live_bitmap().heap_limit() >= new_end);
        assert!(space.mark_bitmap().heap_limit() >= new_end);
        assert!(space.live_bitmap().test(BEGIN.offset(64)));
        let last = Address::from_usize(new_end.as_usize() - 8);
        assert!(!space.live_bitmap().set(last));
        assert!(space.contains(last));
    }

    #[test]
    fn sweep_frees_unmarked() {
        let space = ContinuousSpace::create(
            "alloc space",
            BEGIN,
            8192,
            8192,
            GcRetentionPolicy::AlwaysCollect,
        )
        .unwrap();
        for n in 0..100 {
            let obj = BEGIN.offset(n * 64);
            space.live_bitmap().set(obj);
            if n % 3 == 0 {
                space.mark_bitmap().set(obj);
            }
        }
        let mut freed = Vec::new();
        let count = space.sweep(false, |batch| freed.extend_from_slice(batch));
        assert_eq!(count, freed.len());
        let expected: Vec<Address> = (0..100)
            .filter(|n| n % 3 != 0)
            .map(|n| BEGIN.offset(n * 64))
            .collect();
        assert_eq!(freed, expected);
        for obj in expected {
            assert!(!space.live_bitmap().test(obj));
        }
        assert!(space.live_bitmap().test(BEGIN));
    }

    #[test]
    fn sweep_stops_at_end() {
        // The used range ends in the middle of a bitmap word.
        let space = ContinuousSpace::create(
            "alloc space",
            BEGIN,
            160,
            4096,
            GcRetentionPolicy::AlwaysCollect,
        )
        .unwrap();
        for n in 0..64 {
            space.live_bitmap().set(BEGIN.offset(n * 8));
        }
        let mut freed = Vec::new();
        assert_eq!(space.sweep(false, |batch| freed.extend_from_slice(batch)), 20);
        let expected: Vec<Address> = (0..20).map(|n| BEGIN.offset(n * 8)).collect();
        assert_eq!(freed, expected);
        for n in 20..64 {
            assert!(space.live_bitmap().test(BEGIN.offset(n * 8)));
        }
    }

    #[test]
    fn swap_keeps_names() {
        let mut space =
            ContinuousSpace::create("zygote", BEGIN, 4096, 4096, GcRetentionPolicy::FullCollect)
                .unwrap();
        space.mark_bitmap().set(BEGIN);
        space.swap_bitmaps();
        assert!(space.live_bitmap().test(BEGIN));
        assert!(!space.mark_bitmap().test(BEGIN));
        assert_eq!(space.live_bitmap().name(), "zygote live bitmap");
        assert_eq!(space.mark_bitmap().name(), "zygote mark bitmap");
        // Freshly swapped bitmaps sweep with their roles exchanged back.
        let mut freed = Vec::new();
        space.sweep(true, |batch| freed.extend_from_slice(batch));
        assert!(freed.is_empty());
    }

    #[test]
    fn discontinuous_sweep() {
        let mut space = DiscontinuousSpace::new("large objects", GcRetentionPolicy::AlwaysCollect);
        let a = Address::from_usize(0x7000_0000);
        let b = Address::from_usize(0x7100_0000);
        space.live_objects_mut().set(a);
        space.live_objects_mut().set(b);
        space.mark_objects_mut().set(b);
        assert!(space.contains(a));
        let mut freed = Vec::new();
        assert_eq!(space.sweep(false, |batch| freed.extend_from_slice(batch)), 1);
        assert_eq!(freed, vec![a]);
        assert!(!space.contains(a));
        assert!(space.contains(b));

        space.swap_bitmaps();
        assert_eq!(space.live_objects().name(), "large objects live objects");
        assert!(space.live_objects().test(b));
    }
}
