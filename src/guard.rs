//! The stack/heap collision guard.
//!
//! On the targeted microcontrollers the heap grows upwards from the end of
//! the static data while the call stack grows downwards from the top of the
//! RAM. Both share the same memory, so before every allocator operation the
//! heap end is compared against the live stack pointer.
use crate::fault::Fault;

/// The number of bytes, that have to stay free between the heap end and the
/// stack pointer, if not configured otherwise.
pub const DEFAULT_SAFETY_MARGIN: usize = 10;

/// A source of the current stack pointer.
pub trait StackPointer {
    /// Read the current stack pointer as an absolute address.
    fn read(&self) -> usize;
}
impl<F: Fn() -> usize> StackPointer for F {
    fn read(&self) -> usize {
        self()
    }
}

/// Stack pointer source for targets, where the stack does not share its
/// memory with the heap buffer (e.g. hosted targets).
///
/// The reported stack pointer is always the highest address, so the guard
/// never triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeparateStack;
impl StackPointer for SeparateStack {
    fn read(&self) -> usize {
        usize::MAX
    }
}

/// Stack pointer source for AVR microcontrollers.
///
/// This reads the `SPL`/`SPH` I/O registers through their data space
/// addresses.
#[cfg(target_arch = "avr")]
#[derive(Debug, Clone, Copy, Default)]
pub struct AvrStackPointer;
#[cfg(target_arch = "avr")]
impl StackPointer for AvrStackPointer {
    fn read(&self) -> usize {
        const SPL: *const u8 = 0x5d as *const u8;
        const SPH: *const u8 = 0x5e as *const u8;

        // SAFETY: both addresses are memory mapped registers present on every
        // AVR core with a 16 bit stack pointer. Reading them has no side
        // effects.
        let (low, high) = unsafe { (SPL.read_volatile(), SPH.read_volatile()) };
        usize::from(u16::from_le_bytes([low, high]))
    }
}

/// Check, that the heap end stays at least `margin` bytes below the stack
/// pointer.
///
/// # Errors
/// A heap end within the margin of the stack pointer (or above it) is
/// reported as [`Fault::StackHeapCollision`].
pub fn check(heap_end: usize, stack_pointer: usize, margin: usize) -> Result<(), Fault> {
    if heap_end.saturating_add(margin) > stack_pointer {
        log::error!(
            "heap end {:#06x} within {} bytes of stack pointer {:#06x}",
            heap_end,
            margin,
            stack_pointer
        );
        return Err(Fault::StackHeapCollision {
            heap_end,
            stack_pointer,
        });
    }
    Ok(())
}
