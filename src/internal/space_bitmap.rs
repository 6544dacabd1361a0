use atomic::Atomic;
use atomic::Ordering;
use core::fmt;
use std::mem::size_of;

use crate::{
    error::{AccountingError, AccountingResult},
    mmap::MemMap,
    util::round_up,
    visitor::ObjectModel,
    Address, OBJECT_ALIGNMENT,
};

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

/// Largest number of addresses handed to a sweep callback at once.
pub const SWEEP_BATCH_SIZE: usize = size_of::<usize>() * BITS_PER_INTPTR;

/// Bitmap over the objects of the common case spaces.
pub type MarkBitmap = SpaceBitmap<OBJECT_ALIGNMENT>;

/// Where a bitmap gets its words from.
pub enum BitmapStorage {
    /// Map fresh anonymous memory sized for the covered range.
    Allocate,
    /// Take ownership of an existing mapping, which must be large enough.
    Adopt(MemMap),
}

/// One bit per `ALIGN`-byte slot of `[heap_begin, heap_limit)`.
///
/// Bits are packed in ascending address order inside each word: bit `n` of word `w` stands for
/// `heap_begin + (w * BITS_PER_WORD + n) * ALIGN`. Scanning a word from its lowest set bit upward
/// (`trailing_zeros`) therefore yields addresses in ascending order.
///
/// Bit operations take `&self`. Anything that changes the shape of the bitmap (the covered range,
/// the backing storage, or every bit at once) takes `&mut self`; that is the exclusive side of the
/// heap bitmap lock.
pub struct SpaceBitmap<const ALIGN: usize> {
    mem_map: MemMap,
    bitmap_begin: *mut Atomic<usize>,
    /// Size of the bitmap in bytes.
    bitmap_size: usize,
    /// Address of the slot described by the first bit.
    heap_begin: Address,
    name: String,
}

unsafe impl<const ALIGN: usize> Send for SpaceBitmap<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for SpaceBitmap<ALIGN> {}

impl<const ALIGN: usize> SpaceBitmap<ALIGN> {
    pub fn create(name: &str, heap_begin: Address, heap_capacity: usize) -> AccountingResult<Self> {
        Self::create_with_storage(name, heap_begin, heap_capacity, BitmapStorage::Allocate)
    }

    pub fn create_with_storage(
        name: &str,
        heap_begin: Address,
        heap_capacity: usize,
        storage: BitmapStorage,
    ) -> AccountingResult<Self> {
        debug_assert!(ALIGN.is_power_of_two());
        debug_assert!(heap_begin.is_aligned(ALIGN), "unaligned heap begin {}", heap_begin);
        let bitmap_size = Self::compute_bitmap_size(heap_capacity as _);
        let mem_map = match storage {
            BitmapStorage::Allocate => MemMap::map_anonymous(name, bitmap_size)?,
            BitmapStorage::Adopt(mem_map) => {
                if mem_map.len() < bitmap_size {
                    return Err(AccountingError::SizeMismatch {
                        name: name.to_owned(),
                        expected: bitmap_size,
                        actual: mem_map.len(),
                    });
                }
                mem_map
            }
        };
        Ok(Self {
            bitmap_begin: mem_map.begin().cast(),
            mem_map,
            bitmap_size,
            heap_begin,
            name: name.to_owned(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
    #[inline]
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }
    #[inline]
    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }
    /// One past the highest address the bitmap can describe.
    #[inline]
    pub fn heap_limit(&self) -> Address {
        self.heap_begin.offset(self.heap_size())
    }
    /// Size in bytes of the memory the bitmap spans.
    #[inline]
    pub fn heap_size(&self) -> usize {
        Self::index_to_offset(self.word_count() as u64) as _
    }
    /// Size of the bitmap itself in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bitmap_size
    }
    #[inline]
    fn word_count(&self) -> usize {
        self.bitmap_size / size_of::<usize>()
    }
    #[inline]
    fn words(&self) -> &[Atomic<usize>] {
        unsafe { std::slice::from_raw_parts(self.bitmap_begin, self.word_count()) }
    }
    #[inline]
    pub fn has_address(&self, obj: Address) -> bool {
        // Addresses below heap_begin wrap around to a huge offset and fail the check too.
        let offset = obj.diff(self.heap_begin);
        let index = Self::offset_to_index(offset);
        index < self.word_count()
    }
    #[inline]
    pub fn index_to_offset(index: u64) -> u64 {
        index * ALIGN as u64 * BITS_PER_INTPTR as u64
    }
    #[inline]
    pub fn offset_to_index(offset: usize) -> usize {
        offset / ALIGN / BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_bit_index(offset: usize) -> usize {
        (offset / ALIGN) % BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    pub fn compute_bitmap_size(capacity: u64) -> usize {
        let bytes_covered_per_word = ALIGN * BITS_PER_INTPTR;
        ((round_up(capacity, bytes_covered_per_word as _) / bytes_covered_per_word as u64)
            * size_of::<usize>() as u64) as _
    }
    pub fn compute_heap_size(bitmap_bytes: u64) -> usize {
        (bitmap_bytes * 8 * ALIGN as u64) as _
    }

    /// Sets the bit for `obj` and returns whether it was already set. Of all threads racing to set
    /// the same bit, exactly one sees `false`.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: Address) -> bool {
        debug_assert!(self.has_address(obj), "Invalid object address: {}", obj);
        let offset = obj.diff(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let atomic_entry = &self.words()[index];
        let mut old_word = atomic_entry.load(Ordering::Relaxed);
        loop {
            if (old_word & mask) != 0 {
                return true;
            }
            match atomic_entry.compare_exchange_weak(
                old_word,
                old_word | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(current) => old_word = current,
            }
        }
    }
    #[inline]
    pub fn test(&self, obj: Address) -> bool {
        debug_assert!(self.has_address(obj), "Invalid object address: {}", obj);
        let offset = obj.diff(self.heap_begin);
        let index = Self::offset_to_index(offset);
        (self.words()[index].load(Ordering::Relaxed) & Self::offset_to_mask(offset)) != 0
    }
    /// Non-atomic read-modify-write of one bit. Racing `modify` calls on the same word may lose
    /// updates; the concurrent marker goes through [`atomic_test_and_set`](Self::atomic_test_and_set).
    #[inline]
    pub fn modify<const SET_BIT: bool>(&self, obj: Address) -> bool {
        debug_assert!(self.has_address(obj), "Invalid object address: {}", obj);
        let offset = obj.diff(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let atomic_entry = &self.words()[index];
        let old_word = atomic_entry.load(Ordering::Relaxed);
        if SET_BIT {
            // Only store when the bit changes so that marking an already marked object does not
            // dirty the page.
            if (old_word & mask) == 0 {
                atomic_entry.store(old_word | mask, Ordering::Relaxed);
            }
        } else {
            atomic_entry.store(old_word & !mask, Ordering::Relaxed);
        }

        debug_assert_eq!(self.test(obj), SET_BIT);
        (old_word & mask) != 0
    }

    /// Sets the bit for `obj`, returning its previous value.
    #[inline(always)]
    pub fn set(&self, obj: Address) -> bool {
        self.modify::<true>(obj)
    }

    /// Clears the bit for `obj`, returning its previous value.
    #[inline(always)]
    pub fn clear(&self, obj: Address) -> bool {
        self.modify::<false>(obj)
    }

    /// Zeroes every bit, handing the pages back to the OS where possible.
    pub fn clear_all(&mut self) {
        self.mem_map.madvise_dontneed();
        log::trace!("cleared {}", self);
    }

    /// Clears the bits of `[begin, end)`. Edge slots are cleared one by one, whole words in the
    /// middle with one store each.
    pub fn clear_range(&self, begin: Address, end: Address) {
        debug_assert!(begin <= end);
        let mut begin_offset = begin.diff(self.heap_begin);
        let mut end_offset = end.diff(self.heap_begin);
        while begin_offset < end_offset && Self::offset_bit_index(begin_offset) != 0 {
            self.clear(self.heap_begin.offset(begin_offset));
            begin_offset += ALIGN;
        }

        while begin_offset < end_offset && Self::offset_bit_index(end_offset) != 0 {
            end_offset -= ALIGN;
            self.clear(self.heap_begin.offset(end_offset));
        }
        let words = self.words();
        for index in Self::offset_to_index(begin_offset)..Self::offset_to_index(end_offset) {
            words[index].store(0, Ordering::Relaxed);
        }
    }

    /// Replaces every bit with the corresponding bit of `source`.
    pub fn copy_from(&mut self, source: &Self) -> AccountingResult<()> {
        if self.size() != source.size() {
            return Err(AccountingError::SizeMismatch {
                name: self.name.clone(),
                expected: self.size(),
                actual: source.size(),
            });
        }
        for (dst, src) in self.words().iter().zip(source.words()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Moves the heap limit to `new_end`. Bits below both the old and the new limit are kept.
    /// Growing past the end of the backing storage maps a larger bitmap and copies the old bits
    /// over.
    pub fn set_heap_limit(&mut self, new_end: Address) -> AccountingResult<()> {
        debug_assert!(new_end >= self.heap_begin);
        let new_size = Self::compute_bitmap_size(new_end.diff(self.heap_begin) as u64);
        if new_size <= self.bitmap_size {
            self.bitmap_size = new_size;
            return Ok(());
        }
        if new_size > self.mem_map.len() {
            let new_map = MemMap::map_anonymous(&self.name, new_size)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.mem_map.begin(),
                    new_map.begin(),
                    self.bitmap_size,
                );
            }
            log::debug!(
                "{}: grew backing storage from {} to {} bytes",
                self.name,
                self.mem_map.len(),
                new_map.len()
            );
            self.bitmap_begin = new_map.begin().cast();
            self.mem_map = new_map;
        } else {
            // A previous shrink may have left bits behind above the old limit.
            let old_words = self.word_count();
            let new_words = new_size / size_of::<usize>();
            let all = unsafe { std::slice::from_raw_parts(self.bitmap_begin, new_words) };
            for word in &all[old_words..] {
                word.store(0, Ordering::Relaxed);
            }
        }
        self.bitmap_size = new_size;
        Ok(())
    }

    #[inline(always)]
    fn visit_word(ptr_base: usize, mut w: usize, visitor: &mut impl FnMut(Address)) {
        while w != 0 {
            let shift = w.trailing_zeros() as usize;
            visitor(Address::from_usize(ptr_base + shift * ALIGN));
            w ^= 1 << shift;
        }
    }

    /// Calls `visitor` once for every marked slot in `[visit_begin, visit_end)`, in ascending
    /// address order.
    ///
    /// The bitmap is only read. Each word is loaded once before its bits are visited, so the
    /// visitor may change bits of this bitmap without upsetting the iteration, though it will not
    /// see bits set behind the cursor.
    pub fn visit_marked_range(
        &self,
        visit_begin: Address,
        visit_end: Address,
        mut visitor: impl FnMut(Address),
    ) {
        debug_assert!(visit_begin >= self.heap_begin);
        debug_assert!(visit_end <= self.heap_limit());
        if visit_begin >= visit_end {
            return;
        }
        let offset_start = visit_begin.diff(self.heap_begin);
        let offset_end = visit_end.diff(self.heap_begin);

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let bit_start = Self::offset_bit_index(offset_start);
        let bit_end = Self::offset_bit_index(offset_end);
        let heap_begin = self.heap_begin.as_usize();
        let words = self.words();
        // Index(begin)  ...    Index(end)
        // [xxxxx???][........][????yyyy]
        //      ^                   ^
        //      |                   #---- Bit of visit_end
        //      #---- Bit of visit_begin
        //

        let mut left_edge = words[index_start].load(Ordering::Relaxed);
        left_edge &= !((1usize << bit_start) - 1);
        let mut right_edge;
        if index_start < index_end {
            // Left edge != right edge.
            Self::visit_word(
                Self::index_to_offset(index_start as _) as usize + heap_begin,
                left_edge,
                &mut visitor,
            );
            // Traverse the middle, full part.
            for i in index_start + 1..index_end {
                let w = words[i].load(Ordering::Relaxed);
                if w != 0 {
                    Self::visit_word(
                        Self::index_to_offset(i as _) as usize + heap_begin,
                        w,
                        &mut visitor,
                    );
                }
            }

            // visit_end may start a new word, in which case there is no right edge to look at.
            if bit_end == 0 {
                right_edge = 0;
            } else {
                right_edge = words[index_end].load(Ordering::Relaxed);
            }
        } else {
            right_edge = left_edge;
        }

        right_edge &= (1usize << bit_end) - 1;
        Self::visit_word(
            Self::index_to_offset(index_end as _) as usize + heap_begin,
            right_edge,
            &mut visitor,
        );
    }

    /// Calls `visitor` for every slot in `[visit_begin, visit_end)`, marked or not.
    pub fn visit_range(
        &self,
        visit_begin: Address,
        visit_end: Address,
        mut visitor: impl FnMut(Address),
    ) {
        let mut scan = visit_begin;
        while scan < visit_end {
            visitor(scan);
            scan = scan.offset(ALIGN);
        }
    }

    /// Visits every marked slot in address order. The callback must not change the bitmap's
    /// limit.
    pub fn walk(&self, mut callback: impl FnMut(Address)) {
        let heap_begin = self.heap_begin.as_usize();
        for (i, word) in self.words().iter().enumerate() {
            let w = word.load(Ordering::Relaxed);
            if w != 0 {
                Self::visit_word(
                    Self::index_to_offset(i as _) as usize + heap_begin,
                    w,
                    &mut callback,
                );
            }
        }
    }

    /// Visits every marked object and, depth first, every object reachable from it, each exactly
    /// once. Objects are reported before the objects they reference, in the order `model`
    /// reports references. References leaving the range of this bitmap are not followed.
    pub fn in_order_walk(
        &self,
        model: &dyn ObjectModel,
        mut callback: impl FnMut(Address),
    ) -> AccountingResult<()> {
        let visited = Self::create("bitmap for in-order walk", self.heap_begin, self.heap_size())?;
        let mut pending = Vec::new();
        let mut children = Vec::new();
        self.walk(|root| {
            pending.push(root);
            while let Some(obj) = pending.pop() {
                if visited.set(obj) {
                    continue;
                }
                callback(obj);
                model.visit_references(obj, &mut |referent| {
                    if !referent.is_null() && visited.has_address(referent) {
                        children.push(referent);
                    }
                });
                // Reversed so that the first reference is walked first.
                pending.extend(children.drain(..).rev());
            }
        });
        Ok(())
    }

    /// Walks `live` and `mark` in increasing address order over `[sweep_begin, sweep_end)` and
    /// reports every slot set in `live` but not in `mark`, in batches of at most
    /// [`SWEEP_BATCH_SIZE`] addresses.
    ///
    /// The callback must not change the limit of either bitmap.
    pub fn sweep_walk(
        live_bitmap: &Self,
        mark_bitmap: &Self,
        sweep_begin: Address,
        sweep_end: Address,
        mut callback: impl FnMut(&[Address]),
    ) {
        assert_eq!(live_bitmap.heap_begin, mark_bitmap.heap_begin);
        assert_eq!(live_bitmap.bitmap_size, mark_bitmap.bitmap_size);
        assert!(sweep_begin <= sweep_end);
        assert!(sweep_begin >= live_bitmap.heap_begin);

        if sweep_end <= sweep_begin {
            return;
        }

        let mut pointer_buf = [Address::NULL; SWEEP_BATCH_SIZE];
        let mut pb = 0;
        let offset_begin = sweep_begin.diff(live_bitmap.heap_begin);
        let offset_last = sweep_end.diff(live_bitmap.heap_begin) - 1;
        let start = Self::offset_to_index(offset_begin);
        let end = Self::offset_to_index(offset_last);
        assert!(end < live_bitmap.word_count());
        // Edge words only contribute their bits inside [sweep_begin, sweep_end).
        let start_mask = !((1usize << Self::offset_bit_index(offset_begin)) - 1);
        let last_bit = Self::offset_bit_index(offset_last);
        let end_mask = if last_bit == BITS_PER_INTPTR - 1 {
            !0
        } else {
            (1usize << (last_bit + 1)) - 1
        };
        let live = live_bitmap.words();
        let mark = mark_bitmap.words();
        let heap_begin = live_bitmap.heap_begin.as_usize();
        for i in start..=end {
            let mut garbage = live[i].load(Ordering::Relaxed) & !mark[i].load(Ordering::Relaxed);
            if i == start {
                garbage &= start_mask;
            }
            if i == end {
                garbage &= end_mask;
            }
            if garbage != 0 {
                let ptr_base = Self::index_to_offset(i as _) as usize + heap_begin;
                Self::visit_word(ptr_base, garbage, &mut |obj| {
                    pointer_buf[pb] = obj;
                    pb += 1;
                });
                // Make sure that there are always enough slots available for an entire word of
                // one bits.
                if pb >= SWEEP_BATCH_SIZE - BITS_PER_INTPTR {
                    callback(&pointer_buf[..pb]);
                    pb = 0;
                }
            }
        }
        if pb > 0 {
            callback(&pointer_buf[..pb]);
        }
    }
}

impl<const ALIGN: usize> fmt::Display for SpaceBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={},end={}]",
            self.name,
            self.heap_begin,
            self.heap_limit()
        )
    }
}

impl<const ALIGN: usize> fmt::Debug for SpaceBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
