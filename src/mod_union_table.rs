//! Mod-union tables remember which cards of a space were dirtied between collections, so that a
//! partial collection can find the references from that space into the spaces it collects without
//! scanning the whole space.
//!
//! A cycle goes `clear_cards` (snapshot and age the dirty cards), `update` (refresh whatever the
//! table caches for the snapshot) and `mark_references` (hand the cache to the collector).
//! `clear_cards` may run several times before one `update`; nothing collected is lost.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{AccountingError, AccountingResult},
    internal::card_table::CardTable,
    space::{ContinuousSpace, DiscontinuousSpace, GcRetentionPolicy},
    visitor::{MarkVisitor, ObjectModel},
    Address,
};

/// What a mod-union table needs to know about the heap it belongs to.
pub trait HeapView {
    fn card_table(&self) -> &CardTable;
    fn object_model(&self) -> &dyn ObjectModel;
    fn find_continuous_space(&self, obj: Address) -> Option<&ContinuousSpace>;
    fn find_discontinuous_space(&self, obj: Address) -> Option<&DiscontinuousSpace>;
    /// Is `obj` a live object of any space or a recent allocation?
    fn is_live_object(&self, obj: Address) -> bool;
}

/// Decides which references found on dirty cards are worth remembering.
pub trait ReferenceFilter: Send {
    fn add_reference(&self, heap: &dyn HeapView, holder: Address, referent: Address) -> bool;
}

impl<F> ReferenceFilter for F
where
    F: Fn(&dyn HeapView, Address, Address) -> bool + Send,
{
    fn add_reference(&self, heap: &dyn HeapView, holder: Address, referent: Address) -> bool {
        self(heap, holder, referent)
    }
}

/// Keeps references into spaces that every collection collects.
#[derive(Clone, Copy, Default, Debug)]
pub struct AlwaysCollectFilter;

impl ReferenceFilter for AlwaysCollectFilter {
    fn add_reference(&self, heap: &dyn HeapView, _holder: Address, referent: Address) -> bool {
        if let Some(space) = heap.find_continuous_space(referent) {
            return space.gc_retention_policy() == GcRetentionPolicy::AlwaysCollect;
        }
        heap.find_discontinuous_space(referent)
            .map(|space| space.gc_retention_policy() == GcRetentionPolicy::AlwaysCollect)
            .unwrap_or(false)
    }
}

/// Where a table is in its collection cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ModUnionPhase {
    /// Nothing collected yet.
    #[default]
    Clean,
    /// Dirty cards were collected and wait for `update`.
    Collected,
    /// The cache reflects every collected card.
    Cached,
    /// The cache was handed to a collector.
    Applied,
}

pub trait ModUnionTable: Send {
    /// Ages every dirty card of `space` and remembers the cards that were dirty.
    fn clear_cards(&mut self, card_table: &CardTable, space: &ContinuousSpace);

    /// Refreshes the cache from the cards collected since the last update.
    fn update(&mut self, heap: &dyn HeapView, space: &ContinuousSpace);

    /// Marks everything the cache knows about through `collector`.
    fn mark_references(
        &mut self,
        heap: &dyn HeapView,
        space: &ContinuousSpace,
        collector: &mut dyn MarkVisitor,
    );

    /// Checks the cache against the heap. Errors mean the collector could miss live objects.
    fn verify(&self, heap: &dyn HeapView, space: &ContinuousSpace) -> AccountingResult<()>;

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    fn phase(&self) -> ModUnionPhase;
}

fn clear_space_cards(
    card_table: &CardTable,
    space: &ContinuousSpace,
    cleared_cards: &mut BTreeSet<Address>,
) -> usize {
    let mut count = 0;
    card_table.modify_cards_atomic(
        space.begin(),
        space.end(),
        CardTable::age_card,
        |card, expected, _| {
            if expected == CardTable::CARD_DIRTY {
                cleared_cards.insert(card);
                count += 1;
            }
        },
    );
    count
}

/// `[card, card + CARD_SIZE)` clipped to the used part of `space`. Spaces need not start or end on
/// a card boundary.
fn card_range(space: &ContinuousSpace, card: Address) -> (Address, Address) {
    let end = card.offset(CardTable::CARD_SIZE);
    let limit = space.end().min(space.live_bitmap().heap_limit());
    let begin = card.max(space.begin());
    (begin, end.min(limit).max(begin))
}

fn dump_card(out: &mut dyn fmt::Write, card: Address) -> fmt::Result {
    write!(out, "{}-{}", card, card.offset(CardTable::CARD_SIZE))
}

/// Caches, per collected card, the references its objects hold that pass a [`ReferenceFilter`].
pub struct ReferenceCacheTable<F: ReferenceFilter = AlwaysCollectFilter> {
    filter: F,
    cleared_cards: BTreeSet<Address>,
    references: BTreeMap<Address, Vec<Address>>,
    phase: ModUnionPhase,
}

impl<F: ReferenceFilter> ReferenceCacheTable<F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            cleared_cards: BTreeSet::new(),
            references: BTreeMap::new(),
            phase: ModUnionPhase::Clean,
        }
    }

    pub fn cleared_cards(&self) -> &BTreeSet<Address> {
        &self.cleared_cards
    }

    /// Cached references, by card.
    pub fn references(&self) -> &BTreeMap<Address, Vec<Address>> {
        &self.references
    }

    fn visit_card_references(
        &self,
        heap: &dyn HeapView,
        space: &ContinuousSpace,
        card: Address,
        mut visitor: impl FnMut(Address, Address),
    ) {
        let (begin, end) = card_range(space, card);
        let model = heap.object_model();
        space.live_bitmap().visit_marked_range(begin, end, |holder| {
            model.visit_references(holder, &mut |referent| {
                if !referent.is_null() && self.filter.add_reference(heap, holder, referent) {
                    visitor(holder, referent);
                }
            });
        });
    }
}

impl Default for ReferenceCacheTable {
    fn default() -> Self {
        Self::new(AlwaysCollectFilter)
    }
}

impl<F: ReferenceFilter> ModUnionTable for ReferenceCacheTable<F> {
    fn clear_cards(&mut self, card_table: &CardTable, space: &ContinuousSpace) {
        let count = clear_space_cards(card_table, space, &mut self.cleared_cards);
        log::trace!("{}: collected {} dirty cards", space.name(), count);
        self.phase = ModUnionPhase::Collected;
    }

    fn update(&mut self, heap: &dyn HeapView, space: &ContinuousSpace) {
        let cleared_cards = std::mem::take(&mut self.cleared_cards);
        for card in cleared_cards {
            let mut card_references = Vec::new();
            self.visit_card_references(heap, space, card, |_, referent| {
                card_references.push(referent)
            });
            if let Some(found) = self.references.get_mut(&card) {
                *found = card_references;
            } else if !card_references.is_empty() {
                self.references.insert(card, card_references);
            }
        }
        self.phase = ModUnionPhase::Cached;
    }

    fn mark_references(
        &mut self,
        _heap: &dyn HeapView,
        space: &ContinuousSpace,
        collector: &mut dyn MarkVisitor,
    ) {
        let mut count = 0;
        for referent in self.references.values().flatten() {
            collector.mark_root(*referent);
            count += 1;
        }
        log::trace!("{}: marked {} cached references", space.name(), count);
        self.phase = ModUnionPhase::Applied;
    }

    fn verify(&self, heap: &dyn HeapView, space: &ContinuousSpace) -> AccountingResult<()> {
        // Every cached reference must still point at a live object.
        for (card, references) in &self.references {
            for referent in references {
                if !heap.is_live_object(*referent) {
                    return Err(AccountingError::UnmarkedReference {
                        card: *card,
                        referent: *referent,
                    });
                }
            }
        }

        // Clean cards are not scanned again, so the cache has to know every reference on them.
        let card_table = heap.card_table();
        for (card, references) in &self.references {
            if !card_table.is_clean(*card) {
                continue;
            }
            let mut missing = None;
            self.visit_card_references(heap, space, *card, |holder, referent| {
                if missing.is_none() && !references.contains(&referent) {
                    missing = Some((holder, referent));
                }
            });
            if let Some((holder, referent)) = missing {
                return Err(AccountingError::MissingReference {
                    card: *card,
                    holder,
                    referent,
                });
            }
        }
        Ok(())
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "ModUnionTable cleared cards: [")?;
        for card in &self.cleared_cards {
            dump_card(out, *card)?;
            write!(out, ",")?;
        }
        writeln!(out, "]")?;
        write!(out, "ModUnionTable references: [")?;
        for (card, references) in &self.references {
            dump_card(out, *card)?;
            write!(out, "->{{")?;
            for referent in references {
                write!(out, "{},", referent)?;
            }
            write!(out, "}},")?;
        }
        writeln!(out, "]")
    }

    fn phase(&self) -> ModUnionPhase {
        self.phase
    }
}

impl<F: ReferenceFilter> fmt::Debug for ReferenceCacheTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceCacheTable")
            .field("phase", &self.phase)
            .field("cleared_cards", &self.cleared_cards.len())
            .field("references", &self.references.len())
            .finish()
    }
}

/// Caches only which cards were dirty, and rescans every object on them when marking.
///
/// Cards stay in the table once collected, so each collection rescans every card that was ever
/// dirtied.
#[derive(Default)]
pub struct CardCacheTable {
    cleared_cards: BTreeSet<Address>,
    phase: ModUnionPhase,
}

impl CardCacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cleared_cards(&self) -> &BTreeSet<Address> {
        &self.cleared_cards
    }
}

impl ModUnionTable for CardCacheTable {
    fn clear_cards(&mut self, card_table: &CardTable, space: &ContinuousSpace) {
        let count = clear_space_cards(card_table, space, &mut self.cleared_cards);
        log::trace!("{}: collected {} dirty cards", space.name(), count);
        self.phase = ModUnionPhase::Collected;
    }

    fn update(&mut self, _heap: &dyn HeapView, _space: &ContinuousSpace) {
        self.phase = ModUnionPhase::Cached;
    }

    fn mark_references(
        &mut self,
        _heap: &dyn HeapView,
        space: &ContinuousSpace,
        collector: &mut dyn MarkVisitor,
    ) {
        for card in &self.cleared_cards {
            let (begin, end) = card_range(space, *card);
            space
                .live_bitmap()
                .visit_marked_range(begin, end, |obj| collector.scan_object(obj));
        }
        log::trace!("{}: scanned {} cards", space.name(), self.cleared_cards.len());
        self.phase = ModUnionPhase::Applied;
    }

    fn verify(&self, _heap: &dyn HeapView, _space: &ContinuousSpace) -> AccountingResult<()> {
        // The cards themselves are the cache; there is nothing that could go stale.
        Ok(())
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "ModUnionTable dirty cards: [")?;
        for card in &self.cleared_cards {
            dump_card(out, *card)?;
            write!(out, ",")?;
        }
        writeln!(out, "]")
    }

    fn phase(&self) -> ModUnionPhase {
        self.phase
    }
}

impl fmt::Debug for CardCacheTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardCacheTable")
            .field("phase", &self.phase)
            .field("cleared_cards", &self.cleared_cards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const HEAP_BEGIN: Address = Address::from_usize(0x5000_0000);
    const SPACE_SIZE: usize = 64 * 1024;

    /// Objects are 16 bytes apart; `edges` says what they reference.
    #[derive(Default)]
    struct Graph {
        edges: HashMap<Address, Vec<Address>>,
    }

    impl ObjectModel for Graph {
        fn visit_references(&self, obj: Address, visitor: &mut dyn FnMut(Address)) {
            if let Some(edges) = self.edges.get(&obj) {
                for referent in edges {
                    visitor(*referent);
                }
            }
        }
    }

    /// An immune space followed by a collected one.
    struct TestHeap {
        card_table: CardTable,
        immune: ContinuousSpace,
        collected: ContinuousSpace,
        model: Graph,
    }

    impl TestHeap {
        fn new() -> Self {
            Self {
                card_table: CardTable::create(HEAP_BEGIN, 2 * SPACE_SIZE).unwrap(),
                immune: ContinuousSpace::create(
                    "image space",
                    HEAP_BEGIN,
                    SPACE_SIZE,
                    SPACE_SIZE,
                    GcRetentionPolicy::NeverCollect,
                )
                .unwrap(),
                collected: ContinuousSpace::create(
                    "alloc space",
                    HEAP_BEGIN.offset(SPACE_SIZE),
                    SPACE_SIZE,
                    SPACE_SIZE,
                    GcRetentionPolicy::AlwaysCollect,
                )
                .unwrap(),
                model: Graph::default(),
            }
        }

        fn immune_obj(&self, n: usize) -> Address {
            let obj = HEAP_BEGIN.offset(n * 16);
            self.immune.live_bitmap().set(obj);
            obj
        }

        fn collected_obj(&self, n: usize) -> Address {
            let obj = HEAP_BEGIN.offset(SPACE_SIZE + n * 16);
            self.collected.live_bitmap().set(obj);
            obj
        }

        fn write(&mut self, holder: Address, referent: Address) {
            self.model.edges.entry(holder).or_default().push(referent);
            self.card_table.mark_card(holder);
        }
    }

    impl HeapView for TestHeap {
        fn card_table(&self) -> &CardTable {
            &self.card_table
        }

        fn object_model(&self) -> &dyn ObjectModel {
            &self.model
        }

        fn find_continuous_space(&self, obj: Address) -> Option<&ContinuousSpace> {
            [&self.immune, &self.collected]
                .into_iter()
                .find(|space| space.contains(obj))
        }

        fn find_discontinuous_space(&self, _obj: Address) -> Option<&DiscontinuousSpace> {
            None
        }

        fn is_live_object(&self, obj: Address) -> bool {
            self.find_continuous_space(obj)
                .map(|space| space.live_bitmap().test(obj))
                .unwrap_or(false)
        }
    }

    #[derive(Default)]
    struct Recorder {
        roots: Vec<Address>,
        scanned: Vec<Address>,
    }

    impl MarkVisitor for Recorder {
        fn mark_root(&mut self, obj: Address) {
            self.roots.push(obj);
        }

        fn scan_object(&mut self, obj: Address) {
            self.scanned.push(obj);
        }
    }

    fn cycle(table: &mut dyn ModUnionTable, heap: &TestHeap) -> Recorder {
        let mut recorder = Recorder::default();
        table.clear_cards(&heap.card_table, &heap.immune);
        assert_eq!(table.phase(), ModUnionPhase::Collected);
        table.update(heap, &heap.immune);
        assert_eq!(table.phase(), ModUnionPhase::Cached);
        table.mark_references(heap, &heap.immune, &mut recorder);
        assert_eq!(table.phase(), ModUnionPhase::Applied);
        recorder
    }

    #[test]
    fn caches_references_into_collected_spaces() {
        let mut heap = TestHeap::new();
        let holder = heap.immune_obj(1);
        let other_immune = heap.immune_obj(100);
        let young = heap.collected_obj(3);
        heap.write(holder, young);
        heap.write(holder, other_immune);

        let mut table = ReferenceCacheTable::new(AlwaysCollectFilter);
        assert_eq!(table.phase(), ModUnionPhase::Clean);
        let recorder = cycle(&mut table, &heap);
        assert_eq!(recorder.roots, vec![young]);
        let card = heap.card_table.card_address(holder);
        assert_eq!(table.references().get(&card), Some(&vec![young]));
        assert!(table.cleared_cards().is_empty());
        assert_eq!(heap.card_table.get_card(holder), CardTable::CARD_AGED);
        table.verify(&heap, &heap.immune).unwrap();
    }

    #[test]
    fn update_is_idempotent_without_writes() {
        let mut heap = TestHeap::new();
        for n in 0..50 {
            let holder = heap.immune_obj(n * 20);
            let young = heap.collected_obj(n);
            heap.write(holder, young);
        }
        let mut table = ReferenceCacheTable::new(AlwaysCollectFilter);
        cycle(&mut table, &heap);
        let first = table.references().clone();
        assert_eq!(first.values().map(Vec::len).sum::<usize>(), 50);
        cycle(&mut table, &heap);
        assert_eq!(table.references(), &first);
    }

    #[test]
    fn clear_cards_calls_coalesce() {
        let mut heap = TestHeap::new();
        let a = heap.immune_obj(0);
        let b = heap.immune_obj(1000);
        let young_a = heap.collected_obj(0);
        let young_b = heap.collected_obj(1);
        heap.write(a, young_a);
        let mut table = ReferenceCacheTable::new(AlwaysCollectFilter);
        table.clear_cards(&heap.card_table, &heap.immune);
        heap.write(b, young_b);
        table.clear_cards(&heap.card_table, &heap.immune);
        assert_eq!(table.cleared_cards().len(), 2);
        table.update(&heap, &heap.immune);
        let mut recorder = Recorder::default();
        table.mark_references(&heap, &heap.immune, &mut recorder);
        recorder.roots.sort();
        assert_eq!(recorder.roots, vec![young_a, young_b]);
    }

    #[test]
    fn rescanned_card_replaces_its_references() {
        let mut heap = TestHeap::new();
        let holder = heap.immune_obj(0);
        let young = heap.collected_obj(0);
        heap.write(holder, young);
        let mut table = ReferenceCacheTable::new(AlwaysCollectFilter);
        cycle(&mut table, &heap);

        // The field now holds an immune object instead.
        let other = heap.immune_obj(500);
        heap.model.edges.insert(holder, vec![other]);
        heap.card_table.mark_card(holder);
        cycle(&mut table, &heap);
        let card = heap.card_table.card_address(holder);
        assert_eq!(table.references().get(&card), Some(&Vec::new()));
    }

    #[test]
    fn custom_filter() {
        let mut heap = TestHeap::new();
        let holder = heap.immune_obj(0);
        let other = heap.immune_obj(1);
        let young = heap.collected_obj(0);
        heap.write(holder, other);
        heap.write(holder, young);
        let mut table = ReferenceCacheTable::new(
            |heap: &dyn HeapView, _holder: Address, referent: Address| {
                heap.find_continuous_space(referent)
                    .map(|space| space.gc_retention_policy() == GcRetentionPolicy::NeverCollect)
                    .unwrap_or(false)
            },
        );
        let recorder = cycle(&mut table, &heap);
        assert_eq!(recorder.roots, vec![other]);
    }

    #[test]
    fn verify_catches_missing_reference() {
        let mut heap = TestHeap::new();
        let holder = heap.immune_obj(0);
        let young = heap.collected_obj(0);
        heap.write(holder, young);
        let mut table = ReferenceCacheTable::new(AlwaysCollectFilter);
        cycle(&mut table, &heap);
        // Age the card to clean, as the next cycle would.
        table.clear_cards(&heap.card_table, &heap.immune);
        table.update(&heap, &heap.immune);
        assert!(heap.card_table.is_clean(holder));
        table.verify(&heap, &heap.immune).unwrap();

        // A store that skipped the write barrier.
        let sneaky = heap.collected_obj(1);
        heap.model.edges.entry(holder).or_default().push(sneaky);
        let err = table.verify(&heap, &heap.immune).unwrap_err();
        match err {
            AccountingError::MissingReference {
                holder: h,
                referent,
                ..
            } => {
                assert_eq!(h, holder);
                assert_eq!(referent, sneaky);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn verify_catches_dead_reference() {
        let mut heap = TestHeap::new();
        let holder = heap.immune_obj(0);
        let young = heap.collected_obj(0);
        heap.write(holder, young);
        let mut table = ReferenceCacheTable::new(AlwaysCollectFilter);
        cycle(&mut table, &heap);
        heap.collected.live_bitmap().clear(young);
        assert!(matches!(
            table.verify(&heap, &heap.immune),
            Err(AccountingError::UnmarkedReference { referent, .. }) if referent == young
        ));
    }

    #[test]
    fn card_cache_rescans_every_collected_card() {
        let mut heap = TestHeap::new();
        let a = heap.immune_obj(0);
        let a2 = heap.immune_obj(1);
        let b = heap.immune_obj(1000);
        let young = heap.collected_obj(0);
        heap.write(a, young);
        let mut table = CardCacheTable::new();
        let recorder = cycle(&mut table, &heap);
        assert_eq!(recorder.scanned, vec![a, a2]);

        heap.write(b, young);
        let recorder = cycle(&mut table, &heap);
        assert_eq!(recorder.scanned, vec![a, a2, b]);
        assert_eq!(table.cleared_cards().len(), 2);
        table.verify(&heap, &heap.immune).unwrap();
    }

    #[test]
    fn dump_format() {
        let mut heap = TestHeap::new();
        let holder = heap.immune_obj(0);
        let young = heap.collected_obj(0);
        heap.write(holder, young);

        let mut table = ReferenceCacheTable::new(AlwaysCollectFilter);
        table.clear_cards(&heap.card_table, &heap.immune);
        let mut out = String::new();
        table.dump(&mut out).unwrap();
        assert_eq!(
            out,
            "ModUnionTable cleared cards: [0x50000000-0x50000080,]\nModUnionTable references: []\n"
        );
        table.update(&heap, &heap.immune);
        out.clear();
        table.dump(&mut out).unwrap();
        assert_eq!(
            out,
            "ModUnionTable cleared cards: []\nModUnionTable references: [0x50000000-0x50000080->{0x50010000,},]\n"
        );

        let mut cards = CardCacheTable::new();
        heap.card_table.mark_card(holder);
        cards.clear_cards(&heap.card_table, &heap.immune);
        out.clear();
        cards.dump(&mut out).unwrap();
        assert_eq!(out, "ModUnionTable dirty cards: [0x50000000-0x50000080,]\n");
    }
}
