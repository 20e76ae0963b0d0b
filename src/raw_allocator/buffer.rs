use super::header::{Header, HEADER_SIZE};
use super::region::Region;

use core::ptr::NonNull;

/// The sentinel byte written directly after every payload.
pub const TRAILER: u8 = 0x03;
/// The number of bytes the trailer occupies after the payload.
pub const TRAILER_SIZE: usize = 1;
/// The smallest possible block: header, one payload byte and the trailer.
pub const MIN_BLOCK_LEN: usize = 4;

/// The number of bytes a block with the given payload size spans, from the
/// first header byte up to the next header.
///
/// This includes the padding, which keeps the next header 2-byte-aligned.
pub const fn block_len(size: u16) -> usize {
    let len = HEADER_SIZE + size as usize + TRAILER_SIZE;
    len + len % 2
}

/// A payload offset into the [`Buffer`], that is validated and known to be
/// safe: it is even and has room for a header in front of it.
///
/// Note, that the header slot in front of the offset might still contain
/// arbitrary data, so the tag needs to be checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedOffset(usize);
impl ValidatedOffset {
    /// Mark a payload offset computed by the block layout as valid.
    ///
    /// # Panics
    /// This function panics if the offset is odd or leaves no room for a
    /// header in front of it.
    pub const fn new(offset: usize) -> Self {
        assert!(offset >= HEADER_SIZE && offset % 2 == 0, "invalid payload offset");
        Self(offset)
    }

    /// The raw offset of the first payload byte.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// The buffer memory backing the heap.
///
/// The whole buffer is zero-initialized, so that a `static` allocator is
/// placed into `.bss` instead of `.data`.
#[repr(align(2))]
pub struct Buffer<const N: usize>([u8; N]);
impl<const N: usize> Buffer<N> {
    /// Create a new, zeroed buffer.
    ///
    /// # Panics
    /// This function panics if the buffer cannot hold the smallest possible
    /// block, i.e. if `N < 4`.
    pub const fn new() -> Self {
        assert!(N >= MIN_BLOCK_LEN, "buffer too small, use N >= 4");
        Self([0; N])
    }

    /// The absolute address of the first buffer byte.
    pub fn base_address(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Turn an absolute payload pointer into a [`ValidatedOffset`].
    ///
    /// This returns `None`, if the pointer does not point into the used part
    /// of the `region`, if it is not 2-byte-aligned or if there is no room for
    /// a header in front of it.
    pub fn validate(&self, ptr: *const u8, region: &Region) -> Option<ValidatedOffset> {
        let offset = (ptr as usize).checked_sub(self.base_address())?;
        let valid = offset % 2 == 0
            && offset >= region.start() + HEADER_SIZE
            && offset < region.end()
            && offset < N;
        valid.then(|| ValidatedOffset(offset))
    }

    /// Read the header in front of the payload at `at`.
    pub fn header(&self, at: ValidatedOffset) -> Header {
        let at = at.0;
        Header::decode(u16::from_le_bytes([self.0[at - 2], self.0[at - 1]]))
    }

    /// Overwrite the header in front of the payload at `at`.
    pub fn set_header(&mut self, at: ValidatedOffset, header: Header) {
        let at = at.0;
        let [low, high] = header.encode().to_le_bytes();
        self.0[at - 2] = low;
        self.0[at - 1] = high;
    }

    /// Write a complete block at `at`: its header and its trailer.
    ///
    /// # Panics
    /// This function panics if the block does not fit into the buffer.
    pub fn format(&mut self, at: ValidatedOffset, header: Header) {
        self.set_header(at, header);
        self.0[at.0 + header.size() as usize] = TRAILER;
    }

    /// Check, whether the trailer behind the payload at `at` is untouched.
    ///
    /// A trailer outside of the buffer counts as damaged.
    pub fn trailer_intact(&self, at: ValidatedOffset, header: Header) -> bool {
        self.0.get(at.0 + header.size() as usize) == Some(&TRAILER)
    }

    /// Obtain a pointer to the payload at `at`.
    ///
    /// The pointer is derived from the whole buffer, so it may be used for
    /// the complete payload of the block.
    ///
    /// # Panics
    /// This function panics if the offset is outside of the buffer.
    pub fn payload_ptr(&mut self, at: ValidatedOffset) -> NonNull<u8> {
        assert!(at.0 < N);

        // SAFETY: the offset is inside of the buffer (asserted above), so the
        // resulting pointer stays inside of the same allocated object.
        let ptr = unsafe { self.0.as_mut_ptr().add(at.0) };
        // SAFETY: the pointer is derived from a reference, so it is non-null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Iterate over all blocks between the start and the end of `region`.
    pub fn blocks(&self, region: &Region) -> Blocks<'_, N> {
        Blocks::new(self, region)
    }
}

/// A block found while walking the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// The payload offset of this block.
    pub at: ValidatedOffset,
    /// The header of this block as read from memory.
    pub header: Header,
}
impl Block {
    /// The offset of the first byte after this block (the next header).
    pub const fn end(&self) -> usize {
        self.at.0 - HEADER_SIZE + block_len(self.header.size())
    }
}

/// Iterator over the blocks of a [`Buffer`].
///
/// The walk stops after yielding a block without a valid tag, since the size
/// of such a block (and therefore the position of the next one) is unknown.
pub struct Blocks<'buffer, const N: usize> {
    buffer: &'buffer Buffer<N>,
    offset: usize,
    end: usize,
}
impl<'buffer, const N: usize> Blocks<'buffer, N> {
    /// Create a block iterator over the given [`Buffer`].
    pub fn new(buffer: &'buffer Buffer<N>, region: &Region) -> Self {
        Self {
            buffer,
            offset: region.start(),
            end: region.end(),
        }
    }
}
impl<'buffer, const N: usize> Iterator for Blocks<'buffer, N> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + HEADER_SIZE > self.end.min(N) {
            return None;
        }

        let at = ValidatedOffset(self.offset + HEADER_SIZE);
        let header = self.buffer.header(at);
        let block = Block { at, header };
        self.offset = if header.is_tagged() {
            block.end()
        } else {
            self.end
        };
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::{block_len, Block, Buffer, Header, Region, ValidatedOffset, TRAILER};

    #[test]
    fn empty_buffer() {
        let buffer = Buffer::<32>::new();
        assert!(buffer.0.iter().all(|&byte| byte == 0));
        assert_eq!(buffer.base_address() % 2, 0);
        assert_eq!(buffer.blocks(&Region::new(0)).next(), None);
    }

    #[test]
    fn block_lengths() {
        assert_eq!(block_len(1), 4);
        assert_eq!(block_len(2), 6);
        assert_eq!(block_len(3), 6);
        assert_eq!(block_len(4), 8);
        assert_eq!(block_len(2047), 2050);
    }

    #[test]
    fn format_writes_header_and_trailer() {
        let mut buffer = Buffer::<16>::new();
        buffer.format(ValidatedOffset(2), Header::used(3));

        assert_eq!(buffer.0[0..2], Header::used(3).encode().to_le_bytes());
        assert_eq!(buffer.0[5], TRAILER);
        assert_eq!(buffer.header(ValidatedOffset(2)), Header::used(3));
        assert!(buffer.trailer_intact(ValidatedOffset(2), Header::used(3)));

        buffer.0[5] = 0xff;
        assert!(!buffer.trailer_intact(ValidatedOffset(2), Header::used(3)));
    }

    #[test]
    fn trailer_outside_of_the_buffer_is_damaged() {
        let buffer = Buffer::<8>::new();
        assert!(!buffer.trailer_intact(ValidatedOffset(2), Header::used(6)));
    }

    #[test]
    fn walking_blocks() {
        let mut buffer = Buffer::<32>::new();
        buffer.format(ValidatedOffset(2), Header::free(1));
        buffer.format(ValidatedOffset(6), Header::used(4));
        buffer.format(ValidatedOffset(14), Header::used(5));
        let mut region = Region::new(0);
        region.advance_to(20);

        let mut iter = buffer.blocks(&region);
        let first = iter.next().unwrap();
        assert_eq!(first.at, ValidatedOffset(2));
        assert_eq!(first.end(), 4);
        assert_eq!(iter.next().unwrap().at, ValidatedOffset(6));
        assert_eq!(
            iter.next(),
            Some(Block {
                at: ValidatedOffset(14),
                header: Header::used(5)
            })
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn walking_stops_at_untagged_memory() {
        let mut buffer = Buffer::<32>::new();
        buffer.format(ValidatedOffset(2), Header::used(1));
        let mut region = Region::new(0);
        region.advance_to(16);

        let mut iter = buffer.blocks(&region);
        assert!(iter.next().unwrap().header.is_tagged());
        assert!(!iter.next().unwrap().header.is_tagged());
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn validating_pointers() {
        let buffer = Buffer::<32>::new();
        let base = buffer.0.as_ptr();
        let mut region = Region::new(0);
        region.advance_to(12);

        let at = |offset: usize| base.wrapping_add(offset);
        assert_eq!(buffer.validate(at(2), &region), Some(ValidatedOffset(2)));
        assert_eq!(buffer.validate(at(10), &region), Some(ValidatedOffset(10)));
        assert_eq!(buffer.validate(at(0), &region), None); // no room for header
        assert_eq!(buffer.validate(at(3), &region), None); // unaligned
        assert_eq!(buffer.validate(at(12), &region), None); // beyond heap end
        assert_eq!(buffer.validate(base.wrapping_sub(2), &region), None);
        assert_eq!(buffer.validate(core::ptr::null(), &region), None);
    }

    #[test]
    fn payload_pointer() {
        use core::ptr;

        let mut buffer = Buffer::<20>::new();
        let expected = ptr::addr_of!(buffer.0[4]);
        let actual = buffer.payload_ptr(ValidatedOffset(4));
        assert_eq!(expected, actual.as_ptr() as *const u8);
    }
}
