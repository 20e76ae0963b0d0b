//! Tracking of the managed heap region.

/// The bounds of the region handed out so far.
///
/// Both values are offsets into the backing buffer. `start` is fixed when the
/// allocator is created, `end` is the heap-end cursor: the offset directly
/// after the trailer and padding of the highest block. The cursor only ever
/// grows, freed blocks are reused in place but never given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    start: usize,
    end: usize,
}
impl Region {
    /// Create an empty region beginning at `start`.
    pub const fn new(start: usize) -> Self {
        Self { start, end: start }
    }

    /// The lowest offset of the region.
    pub const fn start(&self) -> usize {
        self.start
    }

    /// The current heap-end cursor.
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Move the heap-end cursor forward to `new_end`.
    ///
    /// # Panics
    /// This function panics if `new_end` is below the current cursor, as the
    /// region never shrinks.
    pub fn advance_to(&mut self, new_end: usize) {
        assert!(new_end >= self.end, "heap end must not move backwards");
        self.end = new_end;
    }
}
