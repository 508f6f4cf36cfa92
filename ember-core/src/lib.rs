//! Ember core - CPU-side foundations shared by the renderer crates.

pub mod arena;
pub mod collections;
pub mod log;
pub mod thread_context;

pub use arena::{Arena, ArenaMarker, ARENA_MIN_CAPACITY};
pub use thread_context::{ScratchScope, ThreadContext};

pub const SIZE_KB: u64 = 1024;
pub const SIZE_MB: u64 = 1024 * 1024;
pub const SIZE_GB: u64 = 1024 * 1024 * 1024;
