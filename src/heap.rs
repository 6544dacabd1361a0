use core::fmt;
use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::{
    error::AccountingResult,
    internal::card_table::CardTable,
    mod_union_table::{HeapView, ModUnionTable},
    space::{ContinuousSpace, DiscontinuousSpace, GcRetentionPolicy},
    stack::{ConcurrentStack, ObjectStack},
    visitor::{MarkVisitor, ObjectModel},
    Address, Config,
};

/// The accounting side of a heap: its spaces with their bitmaps, the card table covering them,
/// the stacks recording allocations and the mod-union tables of spaces that partial collections
/// do not collect.
pub struct Heap {
    config: Config,
    card_table: CardTable,
    continuous_spaces: Vec<ContinuousSpace>,
    discontinuous_spaces: Vec<DiscontinuousSpace>,
    /// By index into `continuous_spaces`.
    mod_union_tables: BTreeMap<usize, Mutex<Box<dyn ModUnionTable>>>,
    object_model: Box<dyn ObjectModel>,
    allocation_stack: ConcurrentStack,
    live_stack: ConcurrentStack,
}

impl Heap {
    /// Creates a heap whose continuous spaces will all lie inside
    /// `[heap_begin, heap_begin + heap_capacity)`.
    pub fn new(
        config: Config,
        heap_begin: Address,
        heap_capacity: usize,
        object_model: Box<dyn ObjectModel>,
    ) -> AccountingResult<Self> {
        let card_table = CardTable::create(heap_begin, heap_capacity)?;
        let allocation_stack =
            ConcurrentStack::create("allocation stack", config.allocation_stack_capacity)?;
        let live_stack = ConcurrentStack::create("live stack", config.allocation_stack_capacity)?;
        logln_if!(
            config.verbose,
            "heap {}-{} with {:?}",
            heap_begin,
            heap_begin.offset(heap_capacity),
            card_table
        );
        Ok(Self {
            config,
            card_table,
            continuous_spaces: Vec::new(),
            discontinuous_spaces: Vec::new(),
            mod_union_tables: BTreeMap::new(),
            object_model,
            allocation_stack,
            live_stack,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adds a space and returns its index.
    pub fn add_continuous_space(&mut self, space: ContinuousSpace) -> usize {
        assert!(
            self.card_table.has_address(space.begin())
                && space.limit() <= self.card_table.heap_limit(),
            "{:?} is not covered by the card table",
            space
        );
        debug_assert!(
            self.continuous_spaces
                .iter()
                .all(|other| space.limit() <= other.begin() || space.begin() >= other.limit()),
            "{:?} overlaps another space",
            space
        );
        self.continuous_spaces.push(space);
        self.continuous_spaces.len() - 1
    }

    pub fn add_discontinuous_space(&mut self, space: DiscontinuousSpace) -> usize {
        self.discontinuous_spaces.push(space);
        self.discontinuous_spaces.len() - 1
    }

    /// Gives the space at `space_index` a mod-union table, replacing any table it had.
    pub fn attach_mod_union_table(&mut self, space_index: usize, table: Box<dyn ModUnionTable>) {
        assert!(space_index < self.continuous_spaces.len());
        if self
            .mod_union_tables
            .insert(space_index, Mutex::new(table))
            .is_some()
        {
            log::debug!(
                "replaced mod-union table of {}",
                self.continuous_spaces[space_index].name()
            );
        }
    }

    pub fn continuous_spaces(&self) -> &[ContinuousSpace] {
        &self.continuous_spaces
    }

    pub fn continuous_space_mut(&mut self, index: usize) -> &mut ContinuousSpace {
        &mut self.continuous_spaces[index]
    }

    pub fn discontinuous_spaces(&self) -> &[DiscontinuousSpace] {
        &self.discontinuous_spaces
    }

    pub fn discontinuous_space_mut(&mut self, index: usize) -> &mut DiscontinuousSpace {
        &mut self.discontinuous_spaces[index]
    }

    pub fn allocation_stack(&self) -> &ConcurrentStack {
        &self.allocation_stack
    }

    pub fn live_stack(&self) -> &ConcurrentStack {
        &self.live_stack
    }

    /// Must follow every store of a reference into `holder`.
    #[inline(always)]
    pub fn write_barrier(&self, holder: Address) {
        self.card_table.mark_card(holder);
    }

    /// Pushes a new object onto the allocation stack. Returns `false` when the stack is full; the
    /// caller has to collect (which swaps the stacks) and retry.
    pub fn record_allocation(&self, obj: Address) -> bool {
        if self.allocation_stack.atomic_push_back(obj) {
            true
        } else {
            log::debug!("{} is full", *self.allocation_stack);
            false
        }
    }

    /// Makes the allocations recorded so far the live stack of the collection that is starting.
    /// The previous live stack becomes the new, empty, allocation stack.
    pub fn swap_stacks(&mut self) {
        std::mem::swap(&mut self.allocation_stack, &mut self.live_stack);
        self.allocation_stack.reset();
        self.allocation_stack.set_name("allocation stack");
        self.live_stack.set_name("live stack");
    }

    /// Snapshots the dirty cards of every space with a mod-union table into that table and ages
    /// the cards of every other space.
    pub fn process_cards(&self) {
        let mut tables = 0;
        for (index, space) in self.continuous_spaces.iter().enumerate() {
            match self.mod_union_tables.get(&index) {
                Some(table) => {
                    table.lock().clear_cards(&self.card_table, space);
                    tables += 1;
                }
                None => self.card_table.modify_cards_atomic(
                    space.begin(),
                    space.end(),
                    CardTable::age_card,
                    |_, _, _| {},
                ),
            }
        }
        logln_if!(
            self.config.verbose,
            "processed cards of {} spaces, {} with mod-union tables",
            self.continuous_spaces.len(),
            tables
        );
    }

    /// Brings every mod-union table up to date and marks what it caches through `collector`.
    pub fn update_and_mark_mod_union(&self, collector: &mut dyn MarkVisitor) {
        for (index, table) in &self.mod_union_tables {
            let space = &self.continuous_spaces[*index];
            let mut table = table.lock();
            table.update(self, space);
            table.mark_references(self, space, collector);
        }
        if self.config.verify_mod_union_tables {
            self.verify_mod_union_tables();
        }
    }

    /// Panics with a dump of the offending table if any table is inconsistent with the heap.
    pub fn verify_mod_union_tables(&self) {
        for (index, table) in &self.mod_union_tables {
            let space = &self.continuous_spaces[*index];
            let table = table.lock();
            if let Err(err) = table.verify(self, space) {
                let mut dump = String::new();
                let _ = table.dump(&mut dump);
                log::error!("{}: {}\n{}", space.name(), err, dump);
                panic!("mod-union table of {} is inconsistent: {}", space.name(), err);
            }
        }
    }

    pub fn dump_mod_union_tables(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for (index, table) in &self.mod_union_tables {
            writeln!(out, "{}:", self.continuous_spaces[*index].name())?;
            table.lock().dump(out)?;
        }
        Ok(())
    }

    /// A fresh work list for marking.
    pub fn create_mark_stack(&self) -> AccountingResult<ObjectStack> {
        ObjectStack::create("mark stack", self.config.mark_stack_capacity)
    }

    /// Clears the mark bitmaps of every space that `full` (or a partial) collection collects.
    pub fn clear_mark_bitmaps(&mut self, full: bool) {
        for space in &mut self.continuous_spaces {
            if is_collected(space.gc_retention_policy(), full) {
                space.mark_bitmap_mut().clear_all();
            }
        }
        for space in &mut self.discontinuous_spaces {
            if is_collected(space.gc_retention_policy(), full) {
                space.mark_objects_mut().clear_all();
            }
        }
    }

    /// Sweeps every space that a full or partial collection collects, reporting freed objects to
    /// `callback`, and returns how many were freed.
    pub fn sweep(
        &mut self,
        full: bool,
        swap_bitmaps: bool,
        mut callback: impl FnMut(&[Address]),
    ) -> usize {
        let mut freed = 0;
        for space in &self.continuous_spaces {
            if is_collected(space.gc_retention_policy(), full) {
                freed += space.sweep(swap_bitmaps, &mut callback);
            }
        }
        for space in &mut self.discontinuous_spaces {
            if is_collected(space.gc_retention_policy(), full) {
                freed += space.sweep(swap_bitmaps, &mut callback);
            }
        }
        logln_if!(self.config.verbose, "swept {} objects", freed);
        freed
    }

    /// Exchanges live and mark bitmaps of every collected space.
    pub fn swap_bitmaps(&mut self, full: bool) {
        for space in &mut self.continuous_spaces {
            if is_collected(space.gc_retention_policy(), full) {
                space.swap_bitmaps();
            }
        }
        for space in &mut self.discontinuous_spaces {
            if is_collected(space.gc_retention_policy(), full) {
                space.swap_bitmaps();
            }
        }
    }
}

fn is_collected(policy: GcRetentionPolicy, full: bool) -> bool {
    match policy {
        GcRetentionPolicy::NeverCollect => false,
        GcRetentionPolicy::AlwaysCollect => true,
        GcRetentionPolicy::FullCollect => full,
    }
}

impl HeapView for Heap {
    fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    fn object_model(&self) -> &dyn ObjectModel {
        &*self.object_model
    }

    fn find_continuous_space(&self, obj: Address) -> Option<&ContinuousSpace> {
        self.continuous_spaces.iter().find(|space| space.contains(obj))
    }

    fn find_discontinuous_space(&self, obj: Address) -> Option<&DiscontinuousSpace> {
        self.discontinuous_spaces
            .iter()
            .find(|space| space.contains(obj))
    }

    fn is_live_object(&self, obj: Address) -> bool {
        if let Some(space) = self.find_continuous_space(obj) {
            if space.live_bitmap().test(obj) {
                return true;
            }
        } else if self.find_discontinuous_space(obj).is_some() {
            return true;
        }
        // Objects allocated since the bitmaps were last brought up to date.
        self.allocation_stack.contains(obj) || self.live_stack.contains(obj)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("card_table", &self.card_table)
            .field("continuous_spaces", &self.continuous_spaces)
            .field("discontinuous_spaces", &self.discontinuous_spaces)
            .field("mod_union_tables", &self.mod_union_tables.len())
            .finish()
    }
}
