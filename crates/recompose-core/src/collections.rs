//! Hash collections used across the runtime.
//!
//! The default build uses `rustc-hash` maps which are noticeably faster for the
//! small integer and pointer keys the composer works with. The `std-hash`
//! feature swaps in the standard SipHash maps for hosts that need
//! DoS-resistant hashing.

use std::rc::Rc;

#[cfg(feature = "std-hash")]
pub mod map {
    pub use std::collections::hash_map::Entry;
    pub use std::collections::{HashMap, HashSet};
}

#[cfg(not(feature = "std-hash"))]
pub mod map {
    pub use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
    pub use std::collections::hash_map::Entry;
}

/// Identity of a reference-counted allocation, independent of the value's own
/// `Hash`/`Eq` implementation.
///
/// Works for unsized pointees (`Rc<dyn Trait>`) by discarding the vtable half
/// of the fat pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PtrKey(usize);

impl PtrKey {
    pub fn of<T: ?Sized>(rc: &Rc<T>) -> Self {
        Self(Rc::as_ptr(rc) as *const () as usize)
    }

    pub fn addr(self) -> usize {
        self.0
    }
}
