//! Simulated interrupt state.
//!
//! The single-CPU model uses interrupt masking as its only atomicity
//! primitive against interrupt handlers. The hosted kernel keeps that
//! contract in an [`IntrCell`]: a current level (on/off), a flag marking
//! execution inside a simulated external-interrupt handler, and the
//! deferred yield requested by the tick handler. Assertions throughout
//! the scheduler and the synchronization primitives are checked against
//! this cell, and the simulated timer interrupt honors the deferred
//! yield at "interrupt return".

use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupt level: enabled or disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    On,
    Off,
}

/// Per-kernel interrupt state.
///
/// Only the running thread manipulates the cell, so the atomics carry
/// no cross-thread protocol; they exist to make the cell shareable.
pub struct IntrCell {
    enabled: AtomicBool,
    in_handler: AtomicBool,
    yield_on_return: AtomicBool,
}

impl IntrCell {
    /// Interrupts start disabled, as during early boot.
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            in_handler: AtomicBool::new(false),
            yield_on_return: AtomicBool::new(false),
        }
    }

    pub fn get_level(&self) -> IntrLevel {
        if self.enabled.load(Ordering::Acquire) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    /// Disable interrupts and return the previous level.
    pub fn disable(&self) -> IntrLevel {
        let old = self.get_level();
        self.enabled.store(false, Ordering::Release);
        old
    }

    /// Enable interrupts and return the previous level.
    ///
    /// Must not be called from an interrupt handler.
    pub fn enable(&self) -> IntrLevel {
        assert!(!self.context(), "enabling interrupts inside a handler");
        let old = self.get_level();
        self.enabled.store(true, Ordering::Release);
        old
    }

    /// Restore a level previously returned by `disable` or `enable`.
    pub fn set_level(&self, level: IntrLevel) {
        match level {
            IntrLevel::On => {
                self.enable();
            }
            IntrLevel::Off => {
                self.disable();
            }
        }
    }

    /// True while executing a simulated external-interrupt handler.
    pub fn context(&self) -> bool {
        self.in_handler.load(Ordering::Acquire)
    }

    /// Request a yield when the current interrupt handler returns.
    ///
    /// Only meaningful from within a handler.
    pub fn yield_on_return(&self) {
        assert!(self.context(), "yield_on_return outside interrupt context");
        self.yield_on_return.store(true, Ordering::Release);
    }

    /// Enter a simulated external-interrupt handler: interrupts are
    /// masked for the handler's duration. Returns the pre-interrupt
    /// level for `exit_handler`.
    pub fn enter_handler(&self) -> IntrLevel {
        assert!(!self.context(), "nested interrupt handler");
        let old = self.disable();
        self.in_handler.store(true, Ordering::Release);
        old
    }

    /// Leave the handler, restoring the pre-interrupt level. Returns
    /// true if the handler requested a yield on return.
    pub fn exit_handler(&self, old: IntrLevel) -> bool {
        assert!(self.context());
        self.in_handler.store(false, Ordering::Release);
        let wants_yield = self.yield_on_return.swap(false, Ordering::AcqRel);
        self.set_level(old);
        wants_yield
    }
}

impl Default for IntrCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_restore_nesting() {
        let cell = IntrCell::new();
        cell.enable();

        let outer = cell.disable();
        assert_eq!(outer, IntrLevel::On);
        let inner = cell.disable();
        assert_eq!(inner, IntrLevel::Off);

        cell.set_level(inner);
        assert_eq!(cell.get_level(), IntrLevel::Off);
        cell.set_level(outer);
        assert_eq!(cell.get_level(), IntrLevel::On);
    }

    #[test]
    fn test_handler_masks_and_defers_yield() {
        let cell = IntrCell::new();
        cell.enable();

        let old = cell.enter_handler();
        assert!(cell.context());
        assert_eq!(cell.get_level(), IntrLevel::Off);
        cell.yield_on_return();
        assert!(cell.exit_handler(old));
        assert!(!cell.context());
        assert_eq!(cell.get_level(), IntrLevel::On);

        // The flag is consumed.
        let old = cell.enter_handler();
        assert!(!cell.exit_handler(old));
    }
}
