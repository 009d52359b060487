//! Device memory.
//!
//! All device-visible memory used by the core (control stream blocks, free list backing, RTD
//! tables, uploaded programs and state) goes through a [`DeviceMemory`] implementation supplied
//! by the embedder. [`HostMemory`] is a software implementation that backs every allocation with
//! host memory; it is what the tests run on.
use crate::{debug::Diagnostics, Error, Result};
use slotmap::SlotMap;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{trace, warn};

slotmap::new_key_type! {
    /// Identifies an allocation made through a [`DeviceMemory`].
    pub struct AllocationId;
}

/// A GPU virtual address.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DevAddr(pub u64);

impl DevAddr {
    pub const INVALID: DevAddr = DevAddr(0);

    pub const fn offset(self, bytes: u64) -> DevAddr {
        DevAddr(self.0 + bytes)
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Low 32 bits.
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits.
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device heaps. Each heap is a separate range of the GPU address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Heap {
    General,
    Pds,
    Usc,
    RegionHeader,
    VisTest,
    Transfer,
}

impl Heap {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        match self {
            Heap::General => 0,
            Heap::Pds => 1,
            Heap::Usc => 2,
            Heap::RegionHeader => 3,
            Heap::VisTest => 4,
            Heap::Transfer => 5,
        }
    }
}

/// An allocation returned by [`DeviceMemory::alloc`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceAllocation {
    pub id: AllocationId,
    pub heap: Heap,
    pub addr: DevAddr,
    pub size: u64,
}

/// Device memory sub-allocator.
pub trait DeviceMemory: Send + Sync {
    /// Allocates `size` bytes aligned to `align` in `heap`.
    fn alloc(&self, heap: Heap, size: u64, align: u64) -> Result<DeviceAllocation>;
    /// Frees an allocation.
    fn free(&self, allocation: &DeviceAllocation);
    /// Writes words into a CPU-mapped allocation at a byte offset.
    fn write(&self, allocation: &DeviceAllocation, offset: u64, words: &[u32]);
}

/// An owned device allocation, freed on drop.
pub struct Bo {
    memory: Arc<dyn DeviceMemory>,
    allocation: DeviceAllocation,
}

impl Bo {
    pub(crate) fn new(
        memory: &Arc<dyn DeviceMemory>,
        diagnostics: Diagnostics,
        heap: Heap,
        size: u64,
        align: u64,
    ) -> Result<Bo> {
        let allocation = memory.alloc(heap, size, align)?;
        if diagnostics.contains(Diagnostics::TRACK_ALLOCATIONS) {
            trace!(?heap, size, addr = ?allocation.addr, "device allocation");
        }
        let bo = Bo {
            memory: memory.clone(),
            allocation,
        };
        if diagnostics.contains(Diagnostics::ZERO_ALLOCATIONS) {
            bo.write(0, &vec![0; (size / 4) as usize]);
        }
        Ok(bo)
    }

    pub fn addr(&self) -> DevAddr {
        self.allocation.addr
    }

    pub fn size(&self) -> u64 {
        self.allocation.size
    }

    pub fn allocation(&self) -> &DeviceAllocation {
        &self.allocation
    }

    /// Writes words at the given byte offset.
    pub(crate) fn write(&self, offset: u64, words: &[u32]) {
        debug_assert!(offset + words.len() as u64 * 4 <= self.allocation.size);
        self.memory.write(&self.allocation, offset, words);
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        self.memory.free(&self.allocation);
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Bo")
            .field("heap", &self.allocation.heap)
            .field("addr", &self.allocation.addr)
            .field("size", &self.allocation.size)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------

struct HostAllocation {
    heap: Heap,
    addr: DevAddr,
    data: Vec<u32>,
}

struct HostMemoryInner {
    allocations: SlotMap<AllocationId, HostAllocation>,
    next_addr: [u64; Heap::COUNT],
    used: u64,
    budget: Option<u64>,
    total_allocations: u64,
}

/// Device memory backed by host memory.
///
/// Addresses are handed out linearly in a separate 4 GiB range per heap and never reused.
/// An optional budget makes allocations fail with [`Error::OutOfDeviceMemory`] once the live
/// byte count would exceed it.
pub struct HostMemory {
    inner: Mutex<HostMemoryInner>,
}

impl HostMemory {
    pub fn new() -> HostMemory {
        let mut next_addr = [0; Heap::COUNT];
        for (i, base) in next_addr.iter_mut().enumerate() {
            *base = (i as u64 + 1) << 32;
        }
        HostMemory {
            inner: Mutex::new(HostMemoryInner {
                allocations: SlotMap::with_key(),
                next_addr,
                used: 0,
                budget: None,
                total_allocations: 0,
            }),
        }
    }

    /// Creates an allocator that fails once more than `bytes` are live.
    pub fn with_budget(bytes: u64) -> HostMemory {
        let m = HostMemory::new();
        m.set_budget(Some(bytes));
        m
    }

    pub fn set_budget(&self, budget: Option<u64>) {
        self.lock().budget = budget;
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    /// Number of bytes not yet freed.
    pub fn live_bytes(&self) -> u64 {
        self.lock().used
    }

    /// Number of allocations made since creation.
    pub fn total_allocations(&self) -> u64 {
        self.lock().total_allocations
    }

    /// Reads back the contents of an allocation.
    pub fn read(&self, addr: DevAddr, words: usize) -> Option<Vec<u32>> {
        let inner = self.lock();
        inner.allocations.values().find_map(|a| {
            let end = a.addr.0 + a.data.len() as u64 * 4;
            if addr.0 >= a.addr.0 && addr.0 + words as u64 * 4 <= end {
                let start = ((addr.0 - a.addr.0) / 4) as usize;
                Some(a.data[start..start + words].to_vec())
            } else {
                None
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<HostMemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        HostMemory::new()
    }
}

impl DeviceMemory for HostMemory {
    fn alloc(&self, heap: Heap, size: u64, align: u64) -> Result<DeviceAllocation> {
        let mut inner = self.lock();
        let size = crate::util::align(size.max(4), 4);
        if let Some(budget) = inner.budget {
            if inner.used + size > budget {
                warn!(?heap, size, budget, "host memory budget exhausted");
                return Err(Error::OutOfDeviceMemory);
            }
        }
        let align = align.max(4);
        let addr = crate::util::align(inner.next_addr[heap.index()], align);
        inner.next_addr[heap.index()] = addr + size;
        inner.used += size;
        inner.total_allocations += 1;
        let id = inner.allocations.insert(HostAllocation {
            heap,
            addr: DevAddr(addr),
            data: vec![0; (size / 4) as usize],
        });
        Ok(DeviceAllocation {
            id,
            heap,
            addr: DevAddr(addr),
            size,
        })
    }

    fn free(&self, allocation: &DeviceAllocation) {
        let mut inner = self.lock();
        if let Some(a) = inner.allocations.remove(allocation.id) {
            debug_assert_eq!(a.heap, allocation.heap);
            inner.used -= a.data.len() as u64 * 4;
        }
    }

    fn write(&self, allocation: &DeviceAllocation, offset: u64, words: &[u32]) {
        let mut inner = self.lock();
        if let Some(a) = inner.allocations.get_mut(allocation.id) {
            let start = (offset / 4) as usize;
            a.data[start..start + words.len()].copy_from_slice(words);
        }
    }
}
