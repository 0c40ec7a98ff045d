//! Memory handle bridge
//!
//! Translates between process-shareable buffer names and GPU-addressable
//! memory. Two strategies sit behind [`MemoryDevice`]:
//!
//! - [`SecureIdDevice`]: kernel-refcounted integer secure ids
//! - [`FdDevice`]: buffers owned by file descriptors, named through a
//!   flink-style global name table
//!
//! # Ownership
//!
//! ```text
//!   BufferName ──create_handle_from_name──▶ MemoryHandle (Arc, closes once)
//!                                               │
//!                              create_gpu_memory│
//!                                               ▼
//!                                           GpuMemory ──▶ Region (mmap)
//!                                               │
//!                 get_handle_from_gpu_memory ◀──┘
//! ```
//!
//! A [`MemoryHandle`] releases its native object exactly once, when the last
//! clone drops. Every error path therefore releases by simply returning.

mod fd;
mod secure_id;

pub use fd::FdDevice;
pub use secure_id::SecureIdDevice;

use crate::error::{Result, SwapchainError};
use log::debug;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::sync::Arc;

/// Process-shareable identifier of a kernel memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferName(pub u32);

impl fmt::Display for BufferName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which handle strategy the platform provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryStrategy {
    SecureId,
    Fd,
}

/// An imported native memory object.
#[derive(Debug)]
pub enum NativeObject {
    SecureId(BufferName),
    File(File),
}

/// Kernel side of a handle strategy.
pub trait MemoryDevice: Send + Sync {
    fn strategy(&self) -> MemoryStrategy;

    /// Create a new shareable object. The returned object holds one reference.
    fn allocate(&self, size: usize) -> io::Result<NativeObject>;

    /// Import an object by name, taking a reference.
    fn open(&self, name: BufferName) -> io::Result<NativeObject>;

    /// Resolve the global name of an imported object.
    fn name_of(&self, object: &NativeObject) -> io::Result<BufferName>;

    /// Map the whole object into the process.
    fn map(&self, object: &NativeObject) -> io::Result<Arc<Region>>;

    /// Drop the reference taken by `open` or `allocate`.
    fn close(&self, object: &NativeObject);
}

/// A mapped memory region. Mappings never move, so raw pointers into a
/// region stay valid for as long as the region is alive.
pub struct Region {
    map: Mutex<MmapMut>,
    len: usize,
}

impl Region {
    pub fn anonymous(len: usize) -> io::Result<Arc<Self>> {
        let map = MmapOptions::new().len(len.max(1)).map_anon()?;
        Ok(Self::from_map(map))
    }

    pub fn from_map(map: MmapMut) -> Arc<Self> {
        let len = map.len();
        Arc::new(Self {
            map: Mutex::new(map),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.map.lock().as_mut_ptr()
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut map = self.map.lock();
        f(&mut map[..])
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region").field("len", &self.len).finish()
    }
}

struct HandleInner {
    object: NativeObject,
    device: Arc<dyn MemoryDevice>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.device.close(&self.object);
    }
}

/// Reference-counted owner of an imported native object.
#[derive(Clone)]
pub struct MemoryHandle {
    inner: Arc<HandleInner>,
}

impl MemoryHandle {
    pub fn object(&self) -> &NativeObject {
        &self.inner.object
    }

    /// True when both handles own the same import.
    pub fn same_import(&self, other: &MemoryHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Live clones of this handle.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("object", &self.inner.object)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// GPU-visible view of a region at an offset.
#[derive(Clone, Debug)]
pub struct GpuMemory {
    region: Arc<Region>,
    offset: usize,
    len: usize,
    handle: Option<MemoryHandle>,
}

impl GpuMemory {
    /// View into memory that has no shareable name, such as scanout pages.
    pub fn from_region(region: Arc<Region>, offset: usize, len: usize) -> Result<Self> {
        if offset + len > region.len() {
            return Err(SwapchainError::AllocationFailure(format!(
                "view {}+{} exceeds region of {} bytes",
                offset,
                len,
                region.len()
            )));
        }
        Ok(Self {
            region,
            offset,
            len,
            handle: None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        // offset + len was checked against the region at construction
        self.region.base_ptr().wrapping_add(self.offset)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let (offset, len) = (self.offset, self.len);
        self.region.with_bytes(|all| f(&mut all[offset..offset + len]))
    }

    /// True when both views alias the same bytes.
    pub fn aliases(&self, other: &GpuMemory) -> bool {
        self.as_mut_ptr() == other.as_mut_ptr()
    }
}

/// Bridge between native names and GPU memory.
pub struct MemoryBridge {
    device: Arc<dyn MemoryDevice>,
}

impl MemoryBridge {
    pub fn new(device: Arc<dyn MemoryDevice>) -> Self {
        Self { device }
    }

    pub fn with_strategy(strategy: MemoryStrategy) -> Self {
        match strategy {
            MemoryStrategy::SecureId => Self::new(Arc::new(SecureIdDevice::new())),
            MemoryStrategy::Fd => Self::new(Arc::new(FdDevice::new())),
        }
    }

    pub fn strategy(&self) -> MemoryStrategy {
        self.device.strategy()
    }

    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    fn wrap(&self, object: NativeObject) -> MemoryHandle {
        MemoryHandle {
            inner: Arc::new(HandleInner {
                object,
                device: Arc::clone(&self.device),
            }),
        }
    }

    /// Allocate a new shareable buffer, as a native allocator would.
    pub fn allocate_shared(&self, size: usize) -> Result<MemoryHandle> {
        let object = self
            .device
            .allocate(size)
            .map_err(|e| SwapchainError::AllocationFailure(format!("allocate {} bytes: {}", size, e)))?;
        Ok(self.wrap(object))
    }

    /// Allocate memory only this process can see.
    pub fn allocate_private(&self, size: usize) -> Result<GpuMemory> {
        let region = Region::anonymous(size)
            .map_err(|e| SwapchainError::AllocationFailure(format!("private {} bytes: {}", size, e)))?;
        GpuMemory::from_region(region, 0, size)
    }

    pub fn create_handle_from_name(&self, name: BufferName) -> Result<MemoryHandle> {
        let object = self
            .device
            .open(name)
            .map_err(|e| SwapchainError::AllocationFailure(format!("import name {}: {}", name, e)))?;
        debug!("imported buffer name {}", name);
        Ok(self.wrap(object))
    }

    pub fn create_gpu_memory(&self, handle: &MemoryHandle, offset: usize) -> Result<GpuMemory> {
        let region = self
            .device
            .map(handle.object())
            .map_err(|e| SwapchainError::AllocationFailure(format!("map: {}", e)))?;
        if offset >= region.len() {
            return Err(SwapchainError::AllocationFailure(format!(
                "offset {} outside buffer of {} bytes",
                offset,
                region.len()
            )));
        }
        let len = region.len() - offset;
        Ok(GpuMemory {
            region,
            offset,
            len,
            handle: Some(handle.clone()),
        })
    }

    /// Reverse lookup. Private memory has no handle.
    pub fn get_handle_from_gpu_memory(&self, memory: &GpuMemory) -> Option<MemoryHandle> {
        memory.handle.clone()
    }

    pub fn get_name_from_handle(&self, handle: &MemoryHandle) -> Result<BufferName> {
        self.device
            .name_of(handle.object())
            .map_err(|e| SwapchainError::AllocationFailure(format!("name lookup: {}", e)))
    }

    /// Drop one reference. The native object closes with the last one.
    pub fn release(&self, handle: MemoryHandle) {
        drop(handle);
    }
}
