//! Raw heap addresses.
//!
//! Accounting structures key everything by the address of an object. An [`Address`] is only ever
//! compared, hashed, offset and converted back to a pointer for the collector; nothing in this
//! crate dereferences it. Holding an `Address` conveys no ownership of and no borrow on the object
//! it names, so the usual aliasing rules apply to whoever turns it back into a reference.

use core::fmt;

use crate::util::{align_down, align_up, is_aligned};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Number of bytes from `base` up to `self`. Wraps when `self < base`, which range checks
    /// rely on to reject addresses below a region with a single comparison.
    #[inline(always)]
    pub const fn diff(self, base: Self) -> usize {
        self.0.wrapping_sub(base.0)
    }

    #[inline(always)]
    pub const fn align_down(self, align: usize) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline(always)]
    pub const fn align_up(self, align: usize) -> Self {
        Self(align_up(self.0, align))
    }

    #[inline(always)]
    pub const fn is_aligned(self, align: usize) -> bool {
        is_aligned(self.0, align)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
