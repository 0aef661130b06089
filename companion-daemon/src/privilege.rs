//! Scoped identity changes.
//!
//! Incoming API calls run under the caller's identity; host OS calls made on
//! the caller's behalf run under the liaison's own identity. Both are
//! [`IdentityScope`] guards, so the previous identity comes back when the
//! guard drops, whether the block returned, failed, or panicked.

use std::cell::Cell;

use companion_core::types::Identity;

/// Ambient identity storage.
pub trait IdentityContext: Send + Sync {
    fn current(&self) -> Identity;

    /// Install `identity`, returning the one it replaced.
    fn replace(&self, identity: Identity) -> Identity;
}

thread_local! {
    static AMBIENT: Cell<Identity> = const { Cell::new(Identity::Unset) };
}

/// Per-thread ambient identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadIdentity;

impl IdentityContext for ThreadIdentity {
    fn current(&self) -> Identity {
        AMBIENT.with(Cell::get)
    }

    fn replace(&self, identity: Identity) -> Identity {
        AMBIENT.with(|cell| cell.replace(identity))
    }
}

#[must_use = "the previous identity is restored when the scope is dropped"]
pub struct IdentityScope<'a> {
    ctx: &'a dyn IdentityContext,
    previous: Identity,
}

impl<'a> IdentityScope<'a> {
    pub fn assume(ctx: &'a dyn IdentityContext, identity: Identity) -> Self {
        let previous = ctx.replace(identity);
        Self { ctx, previous }
    }

    /// Drop the caller's identity in favor of the liaison's own.
    pub fn clear_calling_identity(ctx: &'a dyn IdentityContext) -> Self {
        Self::assume(ctx, Identity::System)
    }

    pub fn previous(&self) -> Identity {
        self.previous
    }
}

impl Drop for IdentityScope<'_> {
    fn drop(&mut self) {
        self.ctx.replace(self.previous);
    }
}

/// Run `f` with the liaison's own identity.
pub fn as_system<T>(ctx: &dyn IdentityContext, f: impl FnOnce() -> T) -> T {
    let _scope = IdentityScope::clear_calling_identity(ctx);
    f()
}
