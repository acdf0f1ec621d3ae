//! Debug Utilities
//!
//! Expensive consistency checks gated behind the `heavy-assert` feature.

/// Assert an O(n) metadata invariant when `heavy-assert` is enabled
#[macro_export]
macro_rules! heavy_assert {
    ($cond:expr) => {
        if cfg!(feature = "heavy-assert") {
            assert!($cond, "heavy assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if cfg!(feature = "heavy-assert") {
            assert!($cond, $($arg)*);
        }
    };
}

/// Format a byte count the way log lines print them
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
