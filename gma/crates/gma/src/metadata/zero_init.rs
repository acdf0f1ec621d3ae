//! Zero-initialized range tracking.
//!
//! A freshly created heap is zero-filled. The tracker remembers one contiguous
//! range that has never been handed out, so a placement entirely inside it can
//! skip an explicit clear. It is conservative: once a range is used, it never
//! becomes zero again, and when a used range splits the zero range in two only
//! the larger half is kept.

/// Half-open `[begin, end)` range known to still hold zeroes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroInitializedRange {
    begin: u64,
    end: u64,
}

impl ZeroInitializedRange {
    pub fn new(size: u64) -> Self {
        Self { begin: 0, end: size }
    }

    pub fn reset(&mut self, size: u64) {
        self.begin = 0;
        self.end = size;
    }

    pub fn is_range_zero_initialized(&self, begin: u64, end: u64) -> bool {
        debug_assert!(begin < end);
        begin >= self.begin && end <= self.end
    }

    pub fn mark_range_as_used(&mut self, used_begin: u64, used_end: u64) {
        debug_assert!(used_begin < used_end);
        // No overlap.
        if used_end <= self.begin || used_begin >= self.end {
            return;
        }

        if used_begin <= self.begin {
            if used_end >= self.end {
                self.begin = 0;
                self.end = 0;
            } else {
                self.begin = used_end;
            }
        } else if used_end >= self.end {
            self.end = used_begin;
        } else if used_begin - self.begin > self.end - used_end {
            self.end = used_begin;
        } else {
            self.begin = used_end;
        }
    }

    pub fn bounds(&self) -> (u64, u64) {
        (self.begin, self.end)
    }
}
