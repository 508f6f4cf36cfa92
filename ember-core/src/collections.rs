//! Collection aliases used across the workspace.
//!
//! Hash maps and sets default to `foldhash` for speed; these are not
//! DoS-hardened and must not key on untrusted input.

pub use smallvec::{smallvec, SmallVec};

pub mod hashmap {
    pub type HashMap<K, V> = hashbrown::HashMap<K, V, foldhash::fast::RandomState>;
    pub use hashbrown::hash_map::Entry;
}

pub mod hashset {
    pub type HashSet<T> = hashbrown::HashSet<T, foldhash::fast::RandomState>;
}
