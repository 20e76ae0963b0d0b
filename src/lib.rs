//! Tagged heap allocator for small microcontrollers
//!
//! This crate provides a single type called [`Allocator`]. It manages a small
//! region of RAM (a few kilobytes at most) and hands out blocks of up to 2047
//! bytes. Every block carries a bit of in-band metadata, which lets the
//! allocator detect the classic memory bugs: double frees, freeing pointers
//! that were never allocated and writes past the end of a payload. Before
//! every operation the heap end is compared against the live stack pointer, so
//! that a heap growing into the stack is noticed before it corrupts anything.
//!
//! # Usage
//! Declare the allocator as a `static` with the number of bytes to manage, a
//! source for the stack pointer and a fault handler. The fault handler is
//! called with a [`Fault`] for every unrecoverable condition and must not
//! return:
//! ```no_run
//! use sramalloc::{Allocator, Fault, SeparateStack};
//!
//! fn halt(_fault: Fault) -> ! {
//!     // report the fault, e.g. over a serial line
//!     loop {}
//! }
//!
//! static ALLOCATOR: Allocator<1024, SeparateStack> = Allocator::new(SeparateStack, halt);
//!
//! let ptr = ALLOCATOR.allocate(16, line!() as u16).expect("out of memory");
//! ALLOCATOR.deallocate(ptr.as_ptr());
//! ```
//! On AVR use `AvrStackPointer` instead of [`SeparateStack`]. The allocator
//! implements [`GlobalAlloc`] as well, so it can be used with the
//! [`alloc`-crate][alloc] for collections with small elements.
//!
//! The allocator must only be used from the foreground code (or with
//! interrupts disabled around each call). An interrupt handler calling into
//! the allocator while the interrupted code is inside of it is detected and
//! reported as [`Fault::ReentrantCall`].
//!
//! # Implementation
//! Every block is laid out as follows:
//! ```text
//! +--------+---------------------+---------+---------+
//! | header | payload (size bytes)| trailer | padding |
//! | 2 byte |                     | 1 byte  | 0/1 byte|
//! +--------+---------------------+---------+---------+
//!          ^--- returned pointer (always 2-byte aligned)
//! ```
//! The header packs the payload size (11 bits), an active flag and a three
//! bit tag, which marks the header as written by the allocator. The trailer
//! is a sentinel byte, which is checked when the block is freed.
//!
//! The algorithm is a linear scan over the blocks:
//! 1.  We start with an empty heap, the heap end is at the heap start.
//! 2.  A block of 1 is allocated.
//!     ```text
//!     hh p t hh p p t _
//!     ^----^ ^--------^
//!     USED 1 USED 2
//!     ```
//!     There is no block to reuse, so the new block is appended and the heap
//!     end moves behind it. The same happens for another block of 2 (which
//!     needs a padding byte).
//! 3.  The first block is freed. Its active flag is cleared, but the block
//!     stays in place and the heap end does not move.
//! 4.  Another block of 1 is allocated. The scan finds the freed block first
//!     and, as it is large enough, reuses it. A larger freed block would be
//!     split, if the remainder can hold a block on its own.
//! 5.  A request not fitting into any freed block is appended again, unless
//!     the heap end would move into the safety margin below the stack pointer
//!     or past the end of the buffer. Then the allocation fails with
//!     [`OutOfMemory`], which is the only recoverable error.
//!
//! Freed blocks are never merged with their neighbors and the heap never
//! shrinks.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

mod fault;
mod guard;
mod raw_allocator;

use raw_allocator::{AllocError, Corruption, FreeError, RawAllocator};

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, NonNull};

pub use fault::{panic, Fault, FaultHandler};
#[cfg(target_arch = "avr")]
pub use guard::AvrStackPointer;
pub use guard::{SeparateStack, StackPointer, DEFAULT_SAFETY_MARGIN};
pub use raw_allocator::{HeapStats, MAX_SIZE};

/// The alignment of every returned payload.
pub const ALIGNMENT: usize = 2;

/// The request could not be served: there is neither a freed block large
/// enough nor room to append a new block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Memory allocation failed: out of memory")
    }
}

/// The memory allocator for small microcontrollers.
///
/// This is the core type of this crate: it is an allocator with a predefined
/// heap size `N`. The heap memory is part of the allocator itself and fully
/// zero-initialized, so a `static` allocator ends up in `.bss`.
///
/// `S` reads the current stack pointer, which is compared against the heap
/// end before every operation. Unrecoverable conditions are passed to the
/// [`FaultHandler`].
pub struct Allocator<const N: usize, S> {
    raw: spin::Mutex<RawAllocator<N>>,
    stack_pointer: S,
    handler: FaultHandler,
    safety_margin: usize,
}
impl<const N: usize, S: StackPointer> Allocator<N, S> {
    /// Create a new [`Allocator`] with the [`DEFAULT_SAFETY_MARGIN`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N` is less
    /// than `4` or not divisible by `2`.
    #[must_use = "assign the allocator to a static variable to use it"]
    pub const fn new(stack_pointer: S, handler: FaultHandler) -> Self {
        Self::with_safety_margin(stack_pointer, handler, DEFAULT_SAFETY_MARGIN)
    }

    /// Create a new [`Allocator`] keeping at least `safety_margin` bytes free
    /// between the heap end and the stack pointer.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N` is less
    /// than `4` or not divisible by `2`.
    #[must_use = "assign the allocator to a static variable to use it"]
    pub const fn with_safety_margin(
        stack_pointer: S,
        handler: FaultHandler,
        safety_margin: usize,
    ) -> Self {
        Self {
            raw: spin::Mutex::new(RawAllocator::new()),
            stack_pointer,
            handler,
            safety_margin,
        }
    }

    /// Allocate a block of `size` bytes.
    ///
    /// `line` is a diagnostic token (typically `line!()`), which is passed to
    /// the fault handler, if a zero-sized block is requested.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`] and valid for `size`
    /// bytes. Writing past those bytes is detected on deallocation.
    ///
    /// # Errors
    /// If there is no room for the block, [`OutOfMemory`] is returned. This
    /// includes requests larger than [`MAX_SIZE`].
    ///
    /// Requesting zero bytes, a stack/heap collision or a damaged heap are
    /// reported to the fault handler instead.
    pub fn allocate(&self, size: u16, line: u16) -> Result<NonNull<u8>, OutOfMemory> {
        self.with_raw(|raw, stack_pointer| {
            if size == 0 {
                return Err(Fault::ZeroSizeRequested { line });
            }
            let base = raw.base_address();
            guard::check(base + raw.heap_end(), stack_pointer, self.safety_margin)?;

            let limit = stack_pointer
                .saturating_sub(self.safety_margin)
                .saturating_sub(base);
            match raw.alloc(size, limit) {
                Ok(ptr) => Ok(Ok(ptr)),
                Err(AllocError::OutOfMemory) => {
                    log::warn!("out of memory allocating {} bytes", size);
                    Ok(Err(OutOfMemory))
                }
                Err(AllocError::ZeroSize) => Err(Fault::ZeroSizeRequested { line }),
                Err(AllocError::Corrupted(offset)) => Err(Fault::HeapCorruption {
                    address: base + offset,
                }),
            }
        })
    }

    /// Release the block `ptr` points to.
    ///
    /// Pointers not returned by [`allocate()`](Self::allocate), already freed
    /// blocks, blocks whose payload was overrun and a stack/heap collision are
    /// reported to the fault handler.
    pub fn deallocate(&self, ptr: *mut u8) {
        self.with_raw(|raw, stack_pointer| {
            let base = raw.base_address();
            guard::check(base + raw.heap_end(), stack_pointer, self.safety_margin)?;

            let address = ptr as usize;
            raw.free(ptr).map_err(|error| match error {
                FreeError::AllocationNotFound => Fault::UnallocatedBlock { address },
                FreeError::DoubleFreeDetected => Fault::DoubleFree { address },
                FreeError::BufferOverrun => Fault::BufferOverrun { address },
            })
        });
    }

    /// The absolute address of the heap-end cursor.
    pub fn heap_end(&self) -> usize {
        self.with_raw(|raw, _| Ok(raw.base_address() + raw.heap_end()))
    }

    /// Collect statistics about the current heap usage.
    pub fn stats(&self) -> HeapStats {
        self.with_raw(|raw, _| Ok(raw.stats()))
    }

    /// Walk all blocks and check their headers and trailers.
    ///
    /// A damaged block is reported to the fault handler.
    pub fn verify(&self) {
        self.with_raw(|raw, _| {
            let base = raw.base_address();
            raw.verify().map_err(|corruption| match corruption {
                Corruption::Header(offset) => Fault::HeapCorruption {
                    address: base + offset,
                },
                Corruption::Trailer(offset) => Fault::BufferOverrun {
                    address: base + offset,
                },
            })
        });
    }

    /// Run `f` with exclusive access to the raw allocator and the current
    /// stack pointer. A returned fault is passed to the fault handler after
    /// the lock is released.
    fn with_raw<T>(
        &self,
        f: impl FnOnce(&mut RawAllocator<N>, usize) -> Result<T, Fault>,
    ) -> T {
        let result = match self.raw.try_lock() {
            Some(mut raw) => f(&mut *raw, self.stack_pointer.read()),
            None => Err(Fault::ReentrantCall),
        };
        match result {
            Ok(value) => value,
            Err(fault) => {
                log::error!("{}", fault);
                fault::panic(self.handler, fault)
            }
        }
    }
}
unsafe impl<const N: usize, S: StackPointer> GlobalAlloc for Allocator<N, S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        match u16::try_from(layout.size()) {
            Ok(size) => self
                .allocate(size, 0)
                .map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.deallocate(ptr);
    }
}
