//! This module provides the raw allocator and its support types.
//!
//! A "raw allocator" is one, that works on offsets into its own buffer and
//! reports every problem as an error value. Deciding which of those errors are
//! fatal is left to the [`Allocator`](crate::Allocator).
mod buffer;
mod header;
mod region;

use buffer::{block_len, Buffer, ValidatedOffset, MIN_BLOCK_LEN};
use header::{Header, HEADER_SIZE};
use region::Region;

use core::ptr::NonNull;

pub use header::MAX_SIZE;

/// An error occurred when calling `alloc()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A block of zero bytes was requested.
    ZeroSize,
    /// There is neither a fitting freed block nor enough room to append a new
    /// one.
    OutOfMemory,
    /// The block walk hit a header, that was not written by the allocator.
    /// Contains the offset of the damaged header.
    Corrupted(usize),
}

/// An error occurred when calling `free()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// There is a double-free detected. An already freed-up-block is freed up
    /// again.
    DoubleFreeDetected,
    /// An invalid pointer was freed up (either a pointer outside of the heap
    /// memory or one without an allocator header in front of it).
    AllocationNotFound,
    /// The sentinel byte after the payload was overwritten.
    BufferOverrun,
}

/// A damaged block found by [`RawAllocator::verify()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The header in front of this payload offset is not an allocator header.
    Header(usize),
    /// The trailer of the block at this payload offset was overwritten.
    Trailer(usize),
}

/// A snapshot of the heap usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The number of blocks currently in use.
    pub used_blocks: usize,
    /// The number of freed blocks waiting for reuse.
    pub free_blocks: usize,
    /// The sum of the payload sizes of all used blocks.
    pub used_bytes: usize,
    /// The sum of the payload sizes of all freed blocks.
    pub free_bytes: usize,
    /// The number of bytes between heap start and heap end.
    pub heap_len: usize,
}

/// A raw memory allocator for contiguous slices of bytes.
///
/// Every block consists of a two byte header, the payload, a one byte trailer
/// and padding to keep the next header aligned. Therefore the returned
/// payloads are always aligned to `2`.
pub struct RawAllocator<const N: usize> {
    buffer: Buffer<N>,
    region: Region,
}
impl<const N: usize> RawAllocator<N> {
    /// Create a new [`RawAllocator`] with a given heap size.
    ///
    /// # Panics
    /// This function panics if the buffer size is less than `4` (the smallest
    /// possible block) or if it is not divisible by 2.
    pub const fn new() -> Self {
        assert!(N >= MIN_BLOCK_LEN, "too small heap memory: minimum size is 4");
        assert!(N % 2 == 0, "memory size has to be divisible by 2");

        Self {
            buffer: Buffer::new(),
            region: Region::new(0),
        }
    }

    /// The absolute address of the first byte of the heap.
    pub fn base_address(&self) -> usize {
        self.buffer.base_address()
    }

    /// The offset of the heap-end cursor relative to the heap start.
    pub fn heap_end(&self) -> usize {
        self.region.end()
    }

    /// Allocate a new memory block of size `n`.
    ///
    /// The blocks are scanned from the start of the heap up to its end and the
    /// first freed block with enough room is reused (first-fit). If there is
    /// no such block, a new one is appended at the heap end, as long as the
    /// heap end stays at or below `limit` (an offset as well).
    ///
    /// # Errors
    /// A zero-sized request, a request larger than [`MAX_SIZE`] or a request
    /// not fitting into the remaining memory fails with the corresponding
    /// [`AllocError`]. Damaged block headers encountered during the walk are
    /// reported as [`AllocError::Corrupted`].
    pub fn alloc(&mut self, n: u16, limit: usize) -> Result<NonNull<u8>, AllocError> {
        if n == 0 {
            return Err(AllocError::ZeroSize);
        }
        if n > MAX_SIZE {
            return Err(AllocError::OutOfMemory);
        }

        let mut reusable = None;
        for block in self.buffer.blocks(&self.region) {
            if !block.header.is_tagged() || block.end() > self.region.end() {
                return Err(AllocError::Corrupted(block.at.get()));
            }
            log::trace!("scan: block at {} {:?}", block.at.get(), block.header);
            if !block.header.is_active() && block.header.size() >= n {
                reusable = Some(block);
                break;
            }
        }

        let at = match reusable {
            Some(block) => {
                self.reuse(block.at, block.header, n);
                block.at
            }
            None => self.append(n, limit)?,
        };
        Ok(self.buffer.payload_ptr(at))
    }

    /// Reuse the freed block at `at` for a request of `n` bytes.
    ///
    /// The header always records `n`, so the trailer sits directly behind the
    /// new payload. If the block is large enough to hold another block behind
    /// the new payload, it is split and the remainder becomes a new freed
    /// block. A remainder of two bytes cannot form a block, in that case the
    /// block keeps its recorded size. The old payload bytes are not touched.
    fn reuse(&mut self, at: ValidatedOffset, old: Header, n: u16) {
        let remainder = block_len(old.size()) - block_len(n);
        if remainder == 0 {
            self.buffer.format(at, Header::used(n));
            log::debug!("reused block at {} ({} bytes)", at.get(), n);
        } else if remainder >= MIN_BLOCK_LEN {
            let rest = ValidatedOffset::new(at.get() + block_len(n));
            // the remainder is at most as large as the old payload, so it
            // always fits the 11 bit size field
            let rest_size = (remainder - HEADER_SIZE - 1) as u16;
            self.buffer.format(at, Header::used(n));
            self.buffer.format(rest, Header::free(rest_size));
            log::debug!("reused block at {}, split off {} bytes", at.get(), rest_size);
        } else {
            self.buffer.format(at, Header::used(old.size()));
            log::debug!("reused block at {} ({} bytes)", at.get(), old.size());
        }
    }

    /// Append a new block at the heap end.
    fn append(&mut self, n: u16, limit: usize) -> Result<ValidatedOffset, AllocError> {
        let start = self.region.end();
        let new_end = start + block_len(n);
        if new_end > limit.min(N) {
            log::debug!("cannot append {} bytes: limit {}", n, limit.min(N));
            return Err(AllocError::OutOfMemory);
        }

        let at = ValidatedOffset::new(start + HEADER_SIZE);
        self.buffer.format(at, Header::used(n));
        self.region.advance_to(new_end);
        log::debug!("appended block at {}, heap end now {}", at.get(), new_end);
        Ok(at)
    }

    /// Free a pointer to the payload of a used memory block.
    ///
    /// This method is used to release a memory block allocated with this raw
    /// allocator. If the pointer carries a valid header, the corresponding
    /// memory block is marked as free. Freed blocks are neither merged with
    /// their neighbors nor given back to the region.
    ///
    /// # Algorithm
    /// The pointer is checked to be inside the used part of the heap and to
    /// be aligned. The two bytes in front of it have to carry the allocator
    /// tag, otherwise the user tried to free an allocation, that was not
    /// allocated with this allocator and [`FreeError::AllocationNotFound`] is
    /// reported.
    ///
    /// The selected block is tested for its state. If it is marked as "used",
    /// than everything is fine. If it is already marked as "free", than
    /// [`FreeError::DoubleFreeDetected`] is returned. Finally the trailer has
    /// to be intact, otherwise the payload was overrun and
    /// [`FreeError::BufferOverrun`] is returned. In every error case the block
    /// is left untouched.
    pub fn free(&mut self, ptr: *const u8) -> Result<(), FreeError> {
        let at = self
            .buffer
            .validate(ptr, &self.region)
            .ok_or(FreeError::AllocationNotFound)?;
        let header = self.buffer.header(at);
        if !header.is_tagged() {
            log::debug!("no header in front of {} (tag {:#05b})", at.get(), header.tag());
            return Err(FreeError::AllocationNotFound);
        }
        if !header.is_active() {
            return Err(FreeError::DoubleFreeDetected);
        }
        if !self.buffer.trailer_intact(at, header) {
            return Err(FreeError::BufferOverrun);
        }

        self.buffer.set_header(at, header.deactivated());
        log::debug!("freed block at {} ({} bytes)", at.get(), header.size());
        Ok(())
    }

    /// Walk all blocks and check their headers and trailers.
    ///
    /// # Errors
    /// The first damaged block is reported.
    pub fn verify(&self) -> Result<(), Corruption> {
        for block in self.buffer.blocks(&self.region) {
            if !block.header.is_tagged() || block.end() > self.region.end() {
                return Err(Corruption::Header(block.at.get()));
            }
            if !self.buffer.trailer_intact(block.at, block.header) {
                return Err(Corruption::Trailer(block.at.get()));
            }
        }
        Ok(())
    }

    /// Collect usage statistics by walking all blocks.
    ///
    /// The walk stops at the first damaged header.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_len: self.region.end() - self.region.start(),
            ..HeapStats::default()
        };
        for block in self
            .buffer
            .blocks(&self.region)
            .take_while(|block| block.header.is_tagged())
        {
            let size = usize::from(block.header.size());
            if block.header.is_active() {
                stats.used_blocks += 1;
                stats.used_bytes += size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
            }
        }
        stats
    }
}
