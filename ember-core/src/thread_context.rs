//! Per-thread scratch arenas.
//!
//! Each thread owns two scratch arenas. A function that already holds one
//! scratch arena and needs another asks for a scratch arena that does not
//! conflict with the one it holds, so nested scopes never alias.

use std::io;

use crate::arena::{Arena, ArenaMarker};
use crate::{SIZE_GB, SIZE_MB};

const SCRATCH_ARENA_COUNT: usize = 2;
const SCRATCH_RESERVED: u64 = 2 * SIZE_GB;
const SCRATCH_COMMITTED: u64 = SIZE_MB;

pub struct ThreadContext {
    arenas: [Arena; SCRATCH_ARENA_COUNT],
}

impl ThreadContext {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            arenas: [
                Arena::new(SCRATCH_RESERVED, SCRATCH_COMMITTED)?,
                Arena::new(SCRATCH_RESERVED, SCRATCH_COMMITTED)?,
            ],
        })
    }

    /// The default scratch arena.
    #[inline]
    pub fn scratch(&mut self) -> &mut Arena {
        &mut self.arenas[0]
    }

    /// A scratch arena other than the one identified by `conflict`.
    ///
    /// `conflict` is the [`Arena::id`] of an arena the caller is already
    /// using; pass `None` when there is no conflict.
    pub fn scratch_for(&mut self, conflict: Option<u32>) -> &mut Arena {
        let conflict = match conflict {
            Some(id) => id,
            None => return &mut self.arenas[0],
        };

        let index = self
            .arenas
            .iter()
            .position(|arena| arena.id() != conflict)
            .unwrap_or_else(|| unreachable!("two scratch arenas cannot share an id"));
        &mut self.arenas[index]
    }

    /// Both scratch arenas at once, for callers juggling two scopes.
    pub fn scratch_pair(&mut self) -> (&mut Arena, &mut Arena) {
        let [a, b] = &mut self.arenas;
        (a, b)
    }
}

/// Marker guard: captures an arena watermark on creation and restores it
/// when dropped, releasing everything allocated inside the scope on every
/// exit path.
pub struct ScratchScope<'a> {
    arena: &'a mut Arena,
    marker: ArenaMarker,
}

impl<'a> ScratchScope<'a> {
    pub fn new(arena: &'a mut Arena) -> Self {
        let marker = arena.marker();
        Self { arena, marker }
    }

    #[inline]
    pub fn arena(&mut self) -> &mut Arena {
        self.arena
    }
}

impl Drop for ScratchScope<'_> {
    fn drop(&mut self) {
        self.arena.pop_to_marker(self.marker);
    }
}

std::thread_local! {
    static THREAD_CONTEXT: std::cell::RefCell<Option<ThreadContext>> =
        const { std::cell::RefCell::new(None) };
}

/// Run `f` with this thread's context, creating it on first use.
///
/// Panics if the scratch reservation itself cannot be created; a thread
/// without scratch memory cannot make progress.
pub fn with_thread_context<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> R {
    THREAD_CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let ctx = match slot.as_mut() {
            Some(ctx) => ctx,
            None => {
                let ctx = ThreadContext::new()
                    .unwrap_or_else(|e| panic!("scratch arena reservation failed: {e}"));
                slot.insert(ctx)
            }
        };
        f(ctx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_for_never_returns_the_conflict() {
        let mut ctx = ThreadContext::new().unwrap();

        let default_id = ctx.scratch().id();
        let other = ctx.scratch_for(Some(default_id));
        assert_ne!(other.id(), default_id);

        let other_id = other.id();
        assert_eq!(ctx.scratch_for(Some(other_id)).id(), default_id);
    }

    #[test]
    fn scratch_without_conflict_is_the_default() {
        let mut ctx = ThreadContext::new().unwrap();
        let default_id = ctx.scratch().id();
        assert_eq!(ctx.scratch_for(None).id(), default_id);
    }

    #[test]
    fn scope_releases_on_drop() {
        let mut ctx = ThreadContext::new().unwrap();
        let arena = ctx.scratch();
        let before = arena.marker();

        {
            let mut scope = ScratchScope::new(arena);
            scope.arena().push_aligned(4096, 16);
            assert!(scope.arena().size() > before.value());
        }

        assert_eq!(ctx.scratch().marker().value(), before.value());
    }

    #[test]
    fn thread_local_context_is_reused() {
        let first = with_thread_context(|ctx| ctx.scratch().id());
        let second = with_thread_context(|ctx| ctx.scratch().id());
        assert_eq!(first, second);
    }
}
