use crate::Address;

/// Layout knowledge the accounting structures borrow from the runtime's object model.
pub trait ObjectModel: Send + Sync {
    /// Calls `visitor` with the address of every object `obj` references. Null references may
    /// be skipped or reported as [`Address::NULL`].
    fn visit_references(&self, obj: Address, visitor: &mut dyn FnMut(Address));
}

/// The collector side of marking.
pub trait MarkVisitor {
    /// Marks `obj` and queues it for scanning unless it is already marked.
    fn mark_root(&mut self, obj: Address);

    /// Marks everything `obj` references. `obj` itself is known to be alive already.
    fn scan_object(&mut self, obj: Address);
}
