//! Alignment Utilities
//!
//! Helper functions for offset alignment. Every alignment passed here is a
//! power of two; callers validate that at the API boundary.

/// Alignment - utility for alignment operations
pub struct Alignment;

impl Alignment {
    /// Align value up to boundary
    ///
    /// # Examples
    /// ```
    /// use gma::util::Alignment;
    /// assert_eq!(Alignment::align_up(100, 8), 104);
    /// assert_eq!(Alignment::align_up(64, 8), 64);
    /// ```
    #[inline]
    pub fn align_up(value: u64, alignment: u64) -> u64 {
        debug_assert!(alignment.is_power_of_two());
        (value + alignment - 1) & !(alignment - 1)
    }

    /// Align value down to boundary
    #[inline]
    pub fn align_down(value: u64, alignment: u64) -> u64 {
        debug_assert!(alignment.is_power_of_two());
        value & !(alignment - 1)
    }

    /// Check if value is aligned
    #[inline]
    pub fn is_aligned(value: u64, alignment: u64) -> bool {
        value & (alignment - 1) == 0
    }

    /// Get alignment padding needed
    #[inline]
    pub fn padding(value: u64, alignment: u64) -> u64 {
        Self::align_up(value, alignment) - value
    }

    /// Index of the highest set bit; `value` must be non-zero
    #[inline]
    pub fn bit_scan_msb(value: u64) -> u32 {
        debug_assert!(value != 0);
        63 - value.leading_zeros()
    }

    /// Index of the lowest set bit; `value` must be non-zero
    #[inline]
    pub fn bit_scan_lsb(value: u64) -> u32 {
        debug_assert!(value != 0);
        value.trailing_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up_down() {
        assert_eq!(Alignment::align_up(0, 256), 0);
        assert_eq!(Alignment::align_up(1, 256), 256);
        assert_eq!(Alignment::align_down(511, 256), 256);
        assert_eq!(Alignment::padding(100, 64), 28);
        assert!(Alignment::is_aligned(4096, 4096));
        assert!(!Alignment::is_aligned(4097, 2));
    }

    #[test]
    fn test_bit_scans() {
        assert_eq!(Alignment::bit_scan_msb(1), 0);
        assert_eq!(Alignment::bit_scan_msb(257), 8);
        assert_eq!(Alignment::bit_scan_lsb(0b1000), 3);
        assert_eq!(Alignment::bit_scan_lsb(u64::MAX), 0);
    }
}
