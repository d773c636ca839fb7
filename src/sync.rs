//! Interrupt-safe spinning locks.
//!
//! The filesystem runs on multiple cores with a timer IRQ descheduling
//! threads between instructions. A plain spinlock taken from both thread and
//! interrupt context self-deadlocks, so every lock here masks local
//! interrupts for the duration of the critical section.
//!
//! The arch layer owns the actual masking instructions; it installs them once
//! through [`install_irq_hooks`]. The saved interrupt state rides inside the
//! guard and is restored when the guard drops, which makes nested acquisition
//! on one thread naturally re-entrant: the inner guard restores the (already
//! masked) outer state, the outer guard restores the original one. When no
//! hooks are installed (hosted builds, tests) the masking is a no-op.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use spin::mutex::{Mutex, MutexGuard};
use spin::Once;

/// Saved local-interrupt state, as returned by the arch save hook.
pub type IrqState = usize;

/// Interrupt mask/unmask callbacks supplied by the arch layer.
#[derive(Clone, Copy)]
pub struct IrqHooks {
    /// Masks local interrupts, returning the previous state word.
    pub save: fn() -> IrqState,
    /// Restores a previously saved state word.
    pub restore: fn(IrqState),
}

static IRQ_HOOKS: Once<IrqHooks> = Once::new();

/// Installs the arch interrupt hooks. Later calls are ignored.
pub fn install_irq_hooks(hooks: IrqHooks) {
    IRQ_HOOKS.call_once(|| hooks);
}

fn irq_save() -> IrqState {
    match IRQ_HOOKS.get() {
        Some(hooks) => (hooks.save)(),
        None => 0,
    }
}

fn irq_restore(state: IrqState) {
    if let Some(hooks) = IRQ_HOOKS.get() {
        (hooks.restore)(state);
    }
}

/// A spinlock whose critical sections run with local interrupts masked.
pub struct IrqSpinlock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Masks local interrupts and busy-waits for the lock.
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let saved = irq_save();
        IrqSpinlockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            saved,
        }
    }
}

/// Guard for an [`IrqSpinlock`]. Releases the lock, then restores the saved
/// interrupt state.
pub struct IrqSpinlockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    saved: IrqState,
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // The lock must be released before interrupts are unmasked.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        irq_restore(self.saved);
    }
}
