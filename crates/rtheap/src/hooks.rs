//! Host-supplied concurrency and error hooks.
//!
//! The heap never owns a synchronization primitive. Each page is configured
//! with a [`PageHooks`] implementation whose `lock`/`unlock` bracket every
//! mutating page operation, and whose `on_error` receives every error the
//! page detects. All methods default to no-ops, which is the "no callbacks
//! configured" case: the caller then serializes access externally.

use core::fmt;

use crate::error::ErrorCode;

/// Lock, unlock and error callbacks for one page.
pub trait PageHooks {
    /// Enters the page's critical section. May block.
    fn lock(&self) {}

    /// Leaves the page's critical section.
    fn unlock(&self) {}

    /// Receives an error detected by the page.
    fn on_error(&self, code: ErrorCode) {
        let _ = code;
    }
}

impl<H> PageHooks for &H
where
    H: PageHooks + ?Sized,
{
    fn lock(&self) {
        (**self).lock();
    }

    fn unlock(&self) {
        (**self).unlock();
    }

    fn on_error(&self, code: ErrorCode) {
        (**self).on_error(code);
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoHooks;

impl PageHooks for NoHooks {}

/// Hooks backed by a spin lock, for hosts without an RTOS mutex.
#[derive(Default)]
pub struct SpinHooks {
    lock: spin::Mutex<()>,
}

impl fmt::Debug for SpinHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinHooks")
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}

impl SpinHooks {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
        }
    }
}

impl PageHooks for SpinHooks {
    fn lock(&self) {
        // released by `unlock`
        core::mem::forget(self.lock.lock());
    }

    fn unlock(&self) {
        unsafe { self.lock.force_unlock() }
    }
}

/// What to do after a corrupted heap invariant has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionPolicy {
    /// Report and keep going, skipping the offending operation.
    Continue,
    /// Report and panic.
    Abort,
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Abort
        } else {
            Self::Continue
        }
    }
}

/// Holds a page's critical section for as long as it lives.
pub(crate) struct HookGuard<'a> {
    hooks: &'a dyn PageHooks,
}

impl<'a> HookGuard<'a> {
    pub(crate) fn lock(hooks: &'a dyn PageHooks) -> Self {
        hooks.lock();
        Self { hooks }
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.hooks.unlock();
    }
}

/// Error sink handed to page operations.
#[derive(Clone, Copy)]
pub(crate) struct Reporter<'a> {
    hooks: &'a dyn PageHooks,
    policy: CorruptionPolicy,
    page: usize,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(hooks: &'a dyn PageHooks, policy: CorruptionPolicy, page: usize) -> Self {
        Self {
            hooks,
            policy,
            page,
        }
    }

    /// Reports a recoverable failure such as page exhaustion.
    pub(crate) fn failure(&self, code: ErrorCode) {
        log::warn!("page {}: {code}", self.page);
        self.hooks.on_error(code);
    }

    /// Reports a broken invariant and applies the corruption policy.
    #[track_caller]
    pub(crate) fn corruption(&self, code: ErrorCode, addr: usize) {
        log::error!("page {}: {code} at {addr:#x}", self.page);
        self.hooks.on_error(code);
        if self.policy == CorruptionPolicy::Abort {
            panic!("heap corruption in page {}: {code} at {addr:#x}", self.page);
        }
    }
}
