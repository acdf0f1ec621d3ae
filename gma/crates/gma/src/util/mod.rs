//! Util Module - Shared Utilities

pub mod alignment;
pub mod debug;

pub use alignment::Alignment;
pub use debug::format_bytes;
