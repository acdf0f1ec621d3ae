//! Device Abstraction - Heap and Placed-Resource Creation
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! The engine never talks to a graphics API directly. It asks a [`HeapDevice`]
//! for one heap per block and, on request, for a resource placed at an offset
//! inside such a heap:
//!
//! ```text
//! BlockVector ──create_heap(size)──────────────► HeapDevice
//!      │                                            │
//!      └──create_placed_resource(heap, offset)──────┘
//! ```
//!
//! Handles are opaque integers; ownership of the heap lives in
//! [`crate::block::NormalBlock`], which returns it on drop.
//!
//! [`SimulatedDevice`] is a host-memory stand-in with optional capacity and
//! failure injection, used by tests and benchmarks.

use crate::budget::HeapType;
use crate::error::{GmaError, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Opaque heap handle issued by a [`HeapDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapHandle(pub u64);

/// Opaque resource handle issued by a [`HeapDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u64);

/// Kinds of resource a heap may host
///
/// Some devices cannot mix buffers and the two texture classes in one heap, so
/// a block vector is created per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    Unknown,
    Buffer,
    NonRtDsTexture,
    RtDsTexture,
}

/// Dimension of a placed resource, as reported in statistics JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceType {
    #[default]
    Unknown,
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

impl ResourceType {
    /// Name written to the `Type` key of a suballocation
    pub fn json_name(self) -> &'static str {
        match self {
            ResourceType::Unknown => "UNKNOWN",
            ResourceType::Buffer => "BUFFER",
            ResourceType::Texture1D => "TEXTURE1D",
            ResourceType::Texture2D => "TEXTURE2D",
            ResourceType::Texture3D => "TEXTURE3D",
        }
    }
}

/// Heap creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDesc {
    pub size: u64,
    pub heap_type: HeapType,
    pub resource_class: ResourceClass,
}

/// Placed resource creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDesc {
    pub resource_type: ResourceType,
    pub size: u64,
    pub alignment: u64,
}

/// Native heap and resource primitives
pub trait HeapDevice: Send + Sync {
    fn create_heap(&self, desc: &HeapDesc) -> Result<HeapHandle>;
    fn destroy_heap(&self, heap: HeapHandle);
    fn create_placed_resource(
        &self,
        heap: HeapHandle,
        offset: u64,
        desc: &ResourceDesc,
    ) -> Result<ResourceHandle>;
    fn destroy_resource(&self, resource: ResourceHandle);
}

#[derive(Debug, Default)]
struct SimulatedState {
    heaps: FxHashMap<u64, HeapDesc>,
    resources: FxHashMap<u64, (u64, u64, u64)>,
    heap_bytes: u64,
}

/// In-process [`HeapDevice`] that only does bookkeeping
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<SimulatedState>,
    capacity: Option<u64>,
    next_handle: AtomicU64,
    fail_next_heap: AtomicBool,
    fail_next_resource: AtomicBool,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState::default()),
            capacity: None,
            next_handle: AtomicU64::new(1),
            fail_next_heap: AtomicBool::new(false),
            fail_next_resource: AtomicBool::new(false),
        }
    }

    /// Device whose heaps may not exceed `bytes` in total
    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::new()
        }
    }

    /// Make the next `create_heap` fail
    pub fn fail_next_heap(&self) {
        self.fail_next_heap.store(true, Ordering::SeqCst);
    }

    /// Make the next `create_placed_resource` fail
    pub fn fail_next_resource(&self) {
        self.fail_next_resource.store(true, Ordering::SeqCst);
    }

    pub fn live_heaps(&self) -> usize {
        self.state.lock().heaps.len()
    }

    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn heap_bytes(&self) -> u64 {
        self.state.lock().heap_bytes
    }

    /// Sizes of live heaps, smallest first
    pub fn heap_sizes(&self) -> Vec<u64> {
        let mut sizes: Vec<u64> = self.state.lock().heaps.values().map(|d| d.size).collect();
        sizes.sort_unstable();
        sizes
    }

    /// (heap, offset, size) of a live resource
    pub fn resource_placement(&self, resource: ResourceHandle) -> Option<(HeapHandle, u64, u64)> {
        self.state
            .lock()
            .resources
            .get(&resource.0)
            .map(|&(heap, offset, size)| (HeapHandle(heap), offset, size))
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapDevice for SimulatedDevice {
    fn create_heap(&self, desc: &HeapDesc) -> Result<HeapHandle> {
        if self.fail_next_heap.swap(false, Ordering::SeqCst) {
            return Err(GmaError::Device("injected heap creation failure".to_string()));
        }

        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity {
            if state.heap_bytes + desc.size > capacity {
                return Err(GmaError::Device(format!(
                    "heap of {} bytes exceeds device capacity ({} of {} bytes in use)",
                    desc.size, state.heap_bytes, capacity
                )));
            }
        }

        let handle = self.next();
        state.heap_bytes += desc.size;
        state.heaps.insert(handle, *desc);
        Ok(HeapHandle(handle))
    }

    fn destroy_heap(&self, heap: HeapHandle) {
        let mut state = self.state.lock();
        match state.heaps.remove(&heap.0) {
            Some(desc) => state.heap_bytes -= desc.size,
            None => log::error!("destroy_heap: unknown heap {}", heap.0),
        }
    }

    fn create_placed_resource(
        &self,
        heap: HeapHandle,
        offset: u64,
        desc: &ResourceDesc,
    ) -> Result<ResourceHandle> {
        if self.fail_next_resource.swap(false, Ordering::SeqCst) {
            return Err(GmaError::Device("injected resource creation failure".to_string()));
        }

        let mut state = self.state.lock();
        let heap_desc = state
            .heaps
            .get(&heap.0)
            .ok_or_else(|| GmaError::Device(format!("unknown heap {}", heap.0)))?;
        if offset + desc.size > heap_desc.size {
            return Err(GmaError::Device(format!(
                "resource [{}, {}) outside heap of {} bytes",
                offset,
                offset + desc.size,
                heap_desc.size
            )));
        }
        if offset % desc.alignment.max(1) != 0 {
            return Err(GmaError::Device(format!(
                "offset {} not aligned to {}",
                offset, desc.alignment
            )));
        }

        let handle = self.next();
        state.resources.insert(handle, (heap.0, offset, desc.size));
        Ok(ResourceHandle(handle))
    }

    fn destroy_resource(&self, resource: ResourceHandle) {
        if self.state.lock().resources.remove(&resource.0).is_none() {
            log::error!("destroy_resource: unknown resource {}", resource.0);
        }
    }
}
