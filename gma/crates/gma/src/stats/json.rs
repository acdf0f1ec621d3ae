//! Per-block JSON dump consumed by external statistics tooling.
//!
//! The key names (including the `UnusuedBytes` spelling) are what existing
//! consumers parse and must not change:
//!
//! ```json
//! {
//!   "TotalBytes": 1024,
//!   "UnusuedBytes": 824,
//!   "Allocations": 2,
//!   "UnusedRanges": 2,
//!   "Suballocations": [
//!     { "Offset": 0, "Type": "BUFFER", "Size": 100 },
//!     { "Offset": 100, "Type": "FREE", "Size": 100 }
//!   ]
//! }
//! ```

use crate::metadata::{BlockMetadata, SuballocationState};
use serde_json::{json, Map, Value};

/// Fields the metadata owner knows about one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationJsonInfo {
    /// `"BUFFER"`, `"TEXTURE2D"`, `"UNKNOWN"`, ...
    pub resource_type: &'static str,
    pub name: Option<String>,
}

/// Describe one block; `describe` maps metadata user data to allocation details
pub fn block_info_json<F>(metadata: &BlockMetadata, mut describe: F) -> Value
where
    F: FnMut(u64) -> AllocationJsonInfo,
{
    let mut suballocations = Vec::new();
    let mut unused_ranges = 0u64;

    metadata.for_each_suballocation(|s| {
        let mut entry = Map::new();
        entry.insert("Offset".to_string(), json!(s.offset));
        match s.state {
            SuballocationState::Free => {
                unused_ranges += 1;
                entry.insert("Type".to_string(), json!("FREE"));
                entry.insert("Size".to_string(), json!(s.size));
            }
            SuballocationState::Allocated { user_data } => {
                let info = describe(user_data);
                entry.insert("Type".to_string(), json!(info.resource_type));
                entry.insert("Size".to_string(), json!(s.size));
                if let Some(name) = info.name {
                    entry.insert("Name".to_string(), json!(name));
                }
            }
        }
        suballocations.push(Value::Object(entry));
    });

    json!({
        "TotalBytes": metadata.size(),
        "UnusuedBytes": metadata.sum_free_size(),
        "Allocations": metadata.allocation_count(),
        "UnusedRanges": unused_ranges,
        "Suballocations": suballocations,
    })
}
