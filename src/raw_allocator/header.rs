//! The in-band block header.
//!
//! Every block starts with a 16-bit little-endian word directly in front of
//! the payload. The word is packed as follows:
//! ```text
//! 15                      5   4   3   2   0
//! +-----------------------+---+---+-------+
//! |         size          | r | a |  tag  |
//! +-----------------------+---+---+-------+
//! ```
//! - `tag`: the fixed magic value `0b011` marking allocator metadata,
//! - `a`: the active flag (`1` = in use, `0` = freed),
//! - `r`: reserved, always zero,
//! - `size`: the payload length in bytes (11 bits, so up to 2047 bytes).
//!
//! All the bit-twiddling of the crate is contained in this module.

/// The magic value stored in the lowest three bits of every header.
pub const TAG: u8 = 0b011;
/// The largest payload size, that can be encoded in a header.
pub const MAX_SIZE: u16 = 0x07ff;
/// The number of bytes a header occupies in front of the payload.
pub const HEADER_SIZE: usize = 2;

const TAG_MASK: u16 = 0x0007;
const ACTIVE_MASK: u16 = 0x0008;
const ACTIVE_SHIFT: u16 = 3;
const RESERVED_MASK: u16 = 0x0010;
const SIZE_MASK: u16 = 0xffe0;
const SIZE_SHIFT: u16 = 5;

/// A decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    size: u16,
    active: bool,
    reserved: bool,
    tag: u8,
}
impl Header {
    /// Create the header of an in-use block with the given payload size.
    ///
    /// # Panics
    /// This function panics, if `size` does not fit into 11 bits.
    pub const fn used(size: u16) -> Self {
        Self::new(size, true)
    }

    /// Create the header of a freed block with the given payload size.
    ///
    /// # Panics
    /// This function panics, if `size` does not fit into 11 bits.
    pub const fn free(size: u16) -> Self {
        Self::new(size, false)
    }

    const fn new(size: u16, active: bool) -> Self {
        assert!(size <= MAX_SIZE, "block size exceeds 11 bits");
        Self {
            size,
            active,
            reserved: false,
            tag: TAG,
        }
    }

    /// Unpack a raw header word.
    ///
    /// This never fails: arbitrary memory decodes to some header, which is
    /// why callers have to check [`is_tagged()`](Self::is_tagged) before
    /// trusting the other fields.
    pub const fn decode(raw: u16) -> Self {
        Self {
            size: (raw & SIZE_MASK) >> SIZE_SHIFT,
            active: (raw & ACTIVE_MASK) >> ACTIVE_SHIFT == 1,
            reserved: raw & RESERVED_MASK != 0,
            tag: (raw & TAG_MASK) as u8,
        }
    }

    /// Pack this header into its raw word. The fixed tag is always written.
    pub const fn encode(self) -> u16 {
        (self.size << SIZE_SHIFT) | ((self.active as u16) << ACTIVE_SHIFT) | TAG as u16
    }

    /// The payload size recorded in this header.
    pub const fn size(&self) -> u16 {
        self.size
    }

    /// Whether the block is in use.
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// The three tag bits as read from memory.
    pub const fn tag(&self) -> u8 {
        self.tag
    }

    /// Whether this header was written by the allocator, i.e. the tag matches
    /// and the reserved bit is clear.
    pub const fn is_tagged(&self) -> bool {
        self.tag == TAG && !self.reserved
    }

    /// Return a copy of this header with the active flag cleared.
    pub const fn deactivated(self) -> Self {
        Self {
            active: false,
            ..self
        }
    }
}
