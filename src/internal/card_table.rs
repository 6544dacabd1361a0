use core::fmt;
use std::{
    mem::size_of,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{error::AccountingResult, mmap::MemMap, util::is_aligned, Address};

/// Maintain a card table from the the write barrier. All writes of non-null references into heap
/// objects must dirty the card of the object written to.
///
/// One byte per [`CARD_SIZE`](CardTable::CARD_SIZE) bytes of `[heap_begin, heap_begin + capacity)`.
pub struct CardTable {
    /// Mmapped pages for the card table
    mem_map: MemMap,
    cards: *mut AtomicU8,
    card_count: usize,
    heap_begin: Address,
}

unsafe impl Send for CardTable {}
unsafe impl Sync for CardTable {}

impl CardTable {
    pub const CARD_SHIFT: usize = 7;
    pub const CARD_SIZE: usize = 1 << Self::CARD_SHIFT;
    pub const CARD_CLEAN: u8 = 0x0;
    pub const CARD_DIRTY: u8 = 0x70;
    /// A card that was dirty when its space was last processed.
    pub const CARD_AGED: u8 = Self::CARD_DIRTY - 1;

    pub fn create(heap_begin: Address, heap_capacity: usize) -> AccountingResult<Self> {
        debug_assert!(
            heap_begin.is_aligned(Self::CARD_SIZE),
            "card table begin {} is not card aligned",
            heap_begin
        );
        let card_count = (heap_capacity + Self::CARD_SIZE - 1) >> Self::CARD_SHIFT;
        let mem_map = MemMap::map_anonymous("card table", card_count)?;
        log::debug!(
            "card table for {}-{}: {} cards",
            heap_begin,
            heap_begin.offset(heap_capacity),
            card_count
        );
        Ok(Self {
            cards: mem_map.begin().cast(),
            mem_map,
            card_count,
            heap_begin,
        })
    }

    #[inline]
    fn cards(&self) -> &[AtomicU8] {
        unsafe { std::slice::from_raw_parts(self.cards, self.card_count) }
    }

    #[inline]
    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> Address {
        self.heap_begin.offset(self.card_count << Self::CARD_SHIFT)
    }

    #[inline]
    pub fn card_count(&self) -> usize {
        self.card_count
    }

    #[inline]
    pub fn has_address(&self, addr: Address) -> bool {
        (addr.diff(self.heap_begin) >> Self::CARD_SHIFT) < self.card_count
    }

    #[inline]
    pub fn card_index(&self, addr: Address) -> usize {
        debug_assert!(self.has_address(addr), "{} is not covered by the card table", addr);
        addr.diff(self.heap_begin) >> Self::CARD_SHIFT
    }

    /// First heap address covered by the card of `addr`.
    #[inline]
    pub fn card_address(&self, addr: Address) -> Address {
        self.addr_from_card(self.card_index(addr))
    }

    #[inline]
    pub fn addr_from_card(&self, card_index: usize) -> Address {
        self.heap_begin.offset(card_index << Self::CARD_SHIFT)
    }

    #[inline]
    pub fn card_from_addr(&self, addr: Address) -> &AtomicU8 {
        &self.cards()[self.card_index(addr)]
    }

    /// Write barrier: the object at `addr` had a reference stored into it.
    #[inline(always)]
    pub fn mark_card(&self, addr: Address) {
        self.card_from_addr(addr).store(Self::CARD_DIRTY, Ordering::Relaxed);
    }

    #[inline]
    pub fn get_card(&self, addr: Address) -> u8 {
        self.card_from_addr(addr).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_dirty(&self, addr: Address) -> bool {
        self.get_card(addr) == Self::CARD_DIRTY
    }

    #[inline]
    pub fn is_clean(&self, addr: Address) -> bool {
        self.get_card(addr) == Self::CARD_CLEAN
    }

    /// Dirty cards become aged, every other card becomes clean.
    #[inline]
    pub fn age_card(card: u8) -> u8 {
        if card == Self::CARD_DIRTY {
            card - 1
        } else {
            Self::CARD_CLEAN
        }
    }

    /// Zeroes the whole table.
    pub fn clear_card_table(&mut self) {
        self.mem_map.madvise_dontneed();
    }

    /// Cleans the cards covering `[begin, end)`.
    pub fn clear_card_range(&self, begin: Address, end: Address) {
        let cards = self.cards();
        let first = self.card_index(begin);
        let last = self.end_card_index(end);
        for card in &cards[first..last] {
            card.store(Self::CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Index one past the card covering the last byte before `end`.
    #[inline]
    fn end_card_index(&self, end: Address) -> usize {
        let end = end.align_up(Self::CARD_SIZE);
        (end.diff(self.heap_begin) >> Self::CARD_SHIFT).min(self.card_count)
    }

    /// Calls `visitor` with the address of every card in `[begin, end)` whose value is at least
    /// `minimum_age`.
    pub fn visit_dirty_cards(
        &self,
        begin: Address,
        end: Address,
        minimum_age: u8,
        mut visitor: impl FnMut(Address),
    ) -> usize {
        let cards = self.cards();
        let first = self.card_index(begin);
        let last = self.end_card_index(end);
        let mut count = 0;
        for (index, card) in cards[first..last].iter().enumerate() {
            if card.load(Ordering::Relaxed) >= minimum_age {
                visitor(self.addr_from_card(first + index));
                count += 1;
            }
        }
        count
    }

    /// Replaces every card `c` covering `[scan_begin, scan_end)` with `visitor(c)` using
    /// compare-and-swap, so that concurrent write barriers are never lost. `modified` is told
    /// about every card that changed, with the card's address, old value and new value.
    ///
    /// Runs of clean cards are skipped a word at a time.
    pub fn modify_cards_atomic(
        &self,
        scan_begin: Address,
        scan_end: Address,
        mut visitor: impl FnMut(u8) -> u8,
        mut modified: impl FnMut(Address, u8, u8),
    ) {
        let cards = self.cards();
        let mut card_cur = self.card_index(scan_begin);
        let mut card_end = self.end_card_index(scan_end);

        let mut modify_card = |index: usize| {
            let card = &cards[index];
            let mut expected = card.load(Ordering::Relaxed);
            loop {
                let new_value = visitor(expected);
                if expected == new_value {
                    break;
                }
                match card.compare_exchange_weak(
                    expected,
                    new_value,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        modified(self.addr_from_card(index), expected, new_value);
                        break;
                    }
                    Err(current) => expected = current,
                }
            }
        };

        while !self.is_word_aligned(card_cur) && card_cur < card_end {
            modify_card(card_cur);
            card_cur += 1;
        }
        while !self.is_word_aligned(card_end) && card_end > card_cur {
            card_end -= 1;
            modify_card(card_end);
        }

        // Both ends are word aligned now.
        let words = unsafe {
            std::slice::from_raw_parts(
                self.cards.add(card_cur).cast::<AtomicUsize>(),
                (card_end - card_cur) / size_of::<usize>(),
            )
        };
        for (word_index, word) in words.iter().enumerate() {
            let word_card = card_cur + word_index * size_of::<usize>();
            let mut expected_word = word.load(Ordering::Relaxed);
            loop {
                if expected_word == 0 {
                    break; // clean cards
                }
                let expected_bytes = expected_word.to_ne_bytes();
                let mut new_bytes = expected_bytes;
                for byte in new_bytes.iter_mut() {
                    *byte = visitor(*byte);
                }
                let new_word = usize::from_ne_bytes(new_bytes);
                if new_word == expected_word {
                    break;
                }
                match word.compare_exchange_weak(
                    expected_word,
                    new_word,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        for i in 0..size_of::<usize>() {
                            if expected_bytes[i] != new_bytes[i] {
                                modified(
                                    self.addr_from_card(word_card + i),
                                    expected_bytes[i],
                                    new_bytes[i],
                                );
                            }
                        }
                        break;
                    }
                    Err(current) => expected_word = current,
                }
            }
        }
    }

    #[inline]
    fn is_word_aligned(&self, card_index: usize) -> bool {
        is_aligned(self.cards as usize + card_index, size_of::<usize>())
    }
}

impl fmt::Debug for CardTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CardTable[begin={},end={},cards={:p}]",
            self.heap_begin,
            self.heap_limit(),
            self.cards
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP_BEGIN: Address = Address::from_usize(0x3000_0000);
    const CAPACITY: usize = 1024 * 1024;

    fn card(n: usize) -> Address {
        HEAP_BEGIN.offset(n * CardTable::CARD_SIZE)
    }

    #[test]
    fn card_addressing() {
        let table = CardTable::create(HEAP_BEGIN, CAPACITY).unwrap();
        assert_eq!(table.card_count(), CAPACITY / CardTable::CARD_SIZE);
        let obj = HEAP_BEGIN.offset(3 * 128 + 40);
        assert_eq!(table.card_index(obj), 3);
        assert_eq!(table.card_address(obj), card(3));
        assert!(table.has_address(obj));
        assert!(!table.has_address(HEAP_BEGIN.offset(CAPACITY)));
    }

    #[test]
    fn mark_and_clear() {
        let table = CardTable::create(HEAP_BEGIN, CAPACITY).unwrap();
        let obj = card(10).offset(8);
        assert!(table.is_clean(obj));
        table.mark_card(obj);
        assert!(table.is_dirty(obj));
        assert!(table.is_dirty(card(10)));
        assert!(table.is_clean(card(11)));
        table.clear_card_range(card(9), card(11));
        assert!(table.is_clean(obj));
    }

    #[test]
    fn aging() {
        assert_eq!(CardTable::age_card(CardTable::CARD_DIRTY), CardTable::CARD_AGED);
        assert_eq!(CardTable::age_card(CardTable::CARD_AGED), CardTable::CARD_CLEAN);
        assert_eq!(CardTable::age_card(CardTable::CARD_CLEAN), CardTable::CARD_CLEAN);
    }

    #[test]
    fn modify_cards_atomic_reports_every_change() {
        let table = CardTable::create(HEAP_BEGIN, CAPACITY).unwrap();
        // Cards at both unaligned edges and inside whole words.
        let dirty = [1usize, 2, 7, 8, 9, 31, 64, 65, 100, 198];
        for n in dirty {
            table.mark_card(card(n));
        }
        table.mark_card(card(250));
        let mut cleared = Vec::new();
        table.modify_cards_atomic(
            card(1),
            card(199).offset(5),
            CardTable::age_card,
            |addr, old, new| {
                assert_eq!(old, CardTable::CARD_DIRTY);
                assert_eq!(new, CardTable::CARD_AGED);
                cleared.push(addr);
            },
        );
        cleared.sort();
        assert_eq!(cleared, dirty.iter().map(|n| card(*n)).collect::<Vec<_>>());
        for n in dirty {
            assert_eq!(table.get_card(card(n)), CardTable::CARD_AGED);
        }
        assert!(table.is_dirty(card(250)));

        // A second pass turns aged cards clean.
        let mut count = 0;
        table.modify_cards_atomic(card(0), card(200), CardTable::age_card, |_, old, new| {
            assert_eq!(old, CardTable::CARD_AGED);
            assert_eq!(new, CardTable::CARD_CLEAN);
            count += 1;
        });
        assert_eq!(count, dirty.len());
    }

    #[test]
    fn modify_cards_atomic_small_range() {
        let table = CardTable::create(HEAP_BEGIN, CAPACITY).unwrap();
        table.mark_card(card(3));
        table.mark_card(card(4));
        let mut cleared = Vec::new();
        table.modify_cards_atomic(card(3), card(4), CardTable::age_card, |addr, _, _| {
            cleared.push(addr)
        });
        assert_eq!(cleared, vec![card(3)]);
        assert!(table.is_dirty(card(4)));
    }

    #[test]
    fn concurrent_barriers_are_not_lost() {
        let table = CardTable::create(HEAP_BEGIN, CAPACITY).unwrap();
        let cards = 4096;
        let mut seen = vec![0u32; cards];
        std::thread::scope(|s| {
            let table = &table;
            s.spawn(move || {
                for n in 0..cards {
                    table.mark_card(card(n));
                }
            });
            for _ in 0..8 {
                table.modify_cards_atomic(
                    card(0),
                    card(cards),
                    CardTable::age_card,
                    |addr, old, _| {
                        if old == CardTable::CARD_DIRTY {
                            seen[table.card_index(addr)] += 1;
                        }
                    },
                );
            }
        });
        // Whatever the interleaving, every dirty card was either observed by the clearing pass
        // or is still dirty.
        for n in 0..cards {
            assert!(seen[n] >= 1 || table.is_dirty(card(n)), "card {} lost", n);
        }
    }

    #[test]
    fn visit_dirty_cards_by_age() {
        let table = CardTable::create(HEAP_BEGIN, CAPACITY).unwrap();
        table.mark_card(card(5));
        table.mark_card(card(6));
        table.modify_cards_atomic(card(6), card(7), CardTable::age_card, |_, _, _| {});
        let mut dirty = Vec::new();
        table.visit_dirty_cards(card(0), card(100), CardTable::CARD_DIRTY, |c| dirty.push(c));
        assert_eq!(dirty, vec![card(5)]);
        let mut recent = Vec::new();
        assert_eq!(
            table.visit_dirty_cards(card(0), card(100), CardTable::CARD_AGED, |c| recent.push(c)),
            2
        );
        assert_eq!(recent, vec![card(5), card(6)]);
    }

    #[test]
    fn clear_card_table() {
        let mut table = CardTable::create(HEAP_BEGIN, CAPACITY).unwrap();
        table.mark_card(card(1));
        table.clear_card_table();
        assert!(table.is_clean(card(1)));
    }
}
