//! Heap accounting for a concurrent mark-sweep collector: mark bitmaps and sets, mark and
//! allocation stacks, a card table and the mod-union tables built on top of it.

/// Logs at info level when `$cond` holds and at debug level otherwise.
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        } else {
            log::debug!($($t)*);
        }
    };
}

pub mod address;
pub mod atomic_counter;
pub mod error;
pub mod heap;
pub mod internal;
pub mod mmap;
pub mod mod_union_table;
pub mod object_set;
pub mod space;
pub mod stack;
pub mod util;
pub mod visitor;


pub use address::Address;
pub use atomic_counter::AtomicCounter;
pub use error::{AccountingError, AccountingResult};
pub use heap::Heap;
pub use internal::{
    card_table::CardTable,
    space_bitmap::{BitmapStorage, MarkBitmap, SpaceBitmap},
};
pub use mod_union_table::{
    AlwaysCollectFilter, CardCacheTable, HeapView, ModUnionPhase, ModUnionTable,
    ReferenceCacheTable, ReferenceFilter,
};
pub use object_set::ObjectSet;
pub use space::{ContinuousSpace, DiscontinuousSpace, GcRetentionPolicy};
pub use stack::{ConcurrentStack, ObjectStack, SingleThreadedStack};
pub use visitor::{MarkVisitor, ObjectModel};

/// Alignment of every object, and so the granularity of mark bitmaps.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Entries of each mark stack created by the heap.
    pub mark_stack_capacity: usize,
    /// Entries of the allocation stack and of the live stack it is swapped with.
    pub allocation_stack_capacity: usize,
    /// Log collection summaries at info instead of debug level
    pub verbose: bool,
    /// Verify mod-union tables after every update and panic on inconsistencies.
    pub verify_mod_union_tables: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mark_stack_capacity: 64 * 1024,
            allocation_stack_capacity: 1024 * 1024,
            verbose: false,
            verify_mod_union_tables: false,
        }
    }
}
