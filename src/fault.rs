//! The fault reporter: the single escape path for unrecoverable conditions.
//!
//! There is no unwinding on the targets this crate is written for, therefore
//! fatal conditions are not returned as errors. Instead a user-supplied
//! handler is called, which never returns (it might print the fault over a
//! serial line and halt, reset the device, etc.).
use core::fmt;

/// A handler invoked with the [`Fault`] describing an unrecoverable
/// condition. It must not return.
pub type FaultHandler = fn(Fault) -> !;

/// Invoke `handler` with `payload`.
///
/// This is the only place where fault handlers are called. It does not
/// inspect either argument.
pub fn panic<P>(handler: fn(P) -> !, payload: P) -> ! {
    handler(payload)
}

/// An unrecoverable condition detected by the allocator.
///
/// All addresses are absolute addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A block of zero bytes was requested. Contains the diagnostic token
    /// (typically the source line) passed by the caller.
    ZeroSizeRequested {
        /// The caller-supplied diagnostic token.
        line: u16,
    },
    /// A pointer without an allocator header was freed.
    UnallocatedBlock {
        /// The pointer passed to the deallocation.
        address: usize,
    },
    /// An already freed block was freed again.
    DoubleFree {
        /// The pointer passed to the deallocation.
        address: usize,
    },
    /// The trailer after the payload of a block was overwritten.
    BufferOverrun {
        /// The payload address of the overrun block.
        address: usize,
    },
    /// A block header in the heap was overwritten.
    HeapCorruption {
        /// The payload address belonging to the damaged header.
        address: usize,
    },
    /// The heap end came too close to the stack pointer.
    StackHeapCollision {
        /// The address of the heap-end cursor.
        heap_end: usize,
        /// The stack pointer read during the check.
        stack_pointer: usize,
    },
    /// The allocator was entered while it was already in use, e.g. from an
    /// interrupt handler.
    ReentrantCall,
}
impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ZeroSizeRequested { line } => {
                write!(f, "Memory allocation failed: zero bytes requested (line {line})")
            }
            Self::UnallocatedBlock { address } => {
                write!(f, "Attempted to free unallocated block at {address:#06x}")
            }
            Self::DoubleFree { address } => write!(f, "Double free at {address:#06x}"),
            Self::BufferOverrun { address } => {
                write!(f, "Buffer overrun of block at {address:#06x}")
            }
            Self::HeapCorruption { address } => {
                write!(f, "Heap corruption at {address:#06x}")
            }
            Self::StackHeapCollision {
                heap_end,
                stack_pointer,
            } => write!(
                f,
                "Stack/Heap collision: heap end {heap_end:#06x}, stack pointer {stack_pointer:#06x}"
            ),
            Self::ReentrantCall => f.write_str("Allocator re-entered, e.g. from an interrupt"),
        }
    }
}
