//! Parameter buffer free lists.
//!
//! A free list is the pool of physical pages the tiling engine writes the parameter buffer into.
//! Lists start at an initial size and grow on demand, one `grow_size` step at a time, up to their
//! maximum. A list created with a parent (an RTD-local list) falls back to the parent once its own
//! pages are exhausted; the parent grows transparently to satisfy it.
use crate::{
    debug::Diagnostics,
    device::DeviceInfo,
    hw::{FREE_LIST_ENTRY_SIZE, PM_PAGE_SHIFT, PM_PAGE_SIZE},
    memory::{Bo, DevAddr, DeviceMemory, Heap},
    util::align,
    Error, Result,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, trace_span, warn};

/// Base address alignment of the PM free list, in bytes.
pub const PM_FREELIST_BASE_ADDR_ALIGN: u64 = 16;

/// Creation parameters of a free list. Sizes are in bytes.
#[derive(Clone, Debug)]
pub struct FreeListCreateInfo {
    pub initial_size: u64,
    pub max_size: u64,
    pub grow_size: u64,
    /// Percentage of the list in use above which it grows ahead of demand.
    pub grow_threshold: u32,
    pub parent: Option<Arc<FreeList>>,
}

#[derive(Debug)]
struct FreeListState {
    /// Current size in bytes, page aligned.
    size: u64,
    /// Bytes handed out to renders.
    used: u64,
    /// Bytes lent to child lists.
    lent: u64,
    /// Bytes borrowed from the parent.
    borrowed: u64,
}

/// A growable page pool.
///
/// A child list first grows its own pages (up to its `max_size`) and only borrows from the
/// parent for what it cannot cover itself. Its own growth is not charged to the parent, so
/// `used` on a child may exceed its `max_size` by what it borrowed.
#[derive(Debug)]
pub struct FreeList {
    entries: Bo,
    initial_size: u64,
    max_size: u64,
    grow_size: u64,
    grow_threshold: u32,
    parent: Option<Arc<FreeList>>,
    state: Mutex<FreeListState>,
}

/// Size granularity of free lists on the given device.
///
/// Free list entries are cached by the SLC, so the entry array must cover whole cache lines as
/// well as honour the PM base alignment.
pub fn size_alignment(info: &DeviceInfo) -> u64 {
    let entry_align = info.pm_freelist_base_align.max(info.slc_cache_line_size) as u64;
    (entry_align / FREE_LIST_ENTRY_SIZE) * PM_PAGE_SIZE
}

impl FreeList {
    pub(crate) fn new(
        info: &DeviceInfo,
        memory: &Arc<dyn DeviceMemory>,
        diagnostics: Diagnostics,
        create_info: FreeListCreateInfo,
    ) -> Result<Arc<FreeList>> {
        let _span = trace_span!("free_list_create").entered();

        let alignment = size_alignment(info);
        let max_size = align(create_info.max_size.min(info.max_free_list_size), alignment);
        // an empty list starts with a single page and grows from there
        let initial_size = if create_info.initial_size == 0 {
            PM_PAGE_SIZE
        } else {
            align(create_info.initial_size.min(max_size), alignment)
        };
        let grow_size = align(create_info.grow_size, alignment);

        let max_pages = max_size >> PM_PAGE_SHIFT;
        let entries = Bo::new(
            memory,
            diagnostics,
            Heap::General,
            align(max_pages * FREE_LIST_ENTRY_SIZE, PM_PAGE_SIZE),
            PM_FREELIST_BASE_ADDR_ALIGN.max(info.pm_freelist_base_align as u64),
        )?;

        debug!(
            initial_size,
            max_size,
            grow_size,
            grow_threshold = create_info.grow_threshold,
            has_parent = create_info.parent.is_some(),
            "created free list"
        );

        Ok(Arc::new(FreeList {
            entries,
            initial_size,
            max_size,
            grow_size,
            grow_threshold: create_info.grow_threshold,
            parent: create_info.parent,
            state: Mutex::new(FreeListState {
                size: initial_size,
                used: 0,
                lent: 0,
                borrowed: 0,
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<FreeListState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn initial_size(&self) -> u64 {
        self.initial_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn grow_size(&self) -> u64 {
        self.grow_size
    }

    pub fn grow_threshold(&self) -> u32 {
        self.grow_threshold
    }

    pub fn parent(&self) -> Option<&Arc<FreeList>> {
        self.parent.as_ref()
    }

    /// Address of the page entry array.
    pub fn entries_addr(&self) -> DevAddr {
        self.entries.addr()
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn max_pages(&self) -> u64 {
        self.max_size >> PM_PAGE_SHIFT
    }

    /// Bytes currently handed out, including what was borrowed from the parent.
    pub fn used(&self) -> u64 {
        let state = self.lock();
        state.used
    }

    /// Bytes currently borrowed from the parent list.
    pub fn borrowed(&self) -> u64 {
        self.lock().borrowed
    }

    /// Grows the list by one step. Returns the new size.
    ///
    /// Fails with [`Error::OutOfDeviceMemory`] if the list is already at its maximum size or
    /// cannot grow.
    pub fn grow(&self) -> Result<u64> {
        let mut state = self.lock();
        self.grow_locked(&mut state)
    }

    fn grow_locked(&self, state: &mut FreeListState) -> Result<u64> {
        let step = self.grow_size.min(self.max_size.saturating_sub(state.size));
        if step == 0 {
            return Err(Error::OutOfDeviceMemory);
        }
        state.size += step;
        debug!(size = state.size, step, max_size = self.max_size, "free list grown");
        Ok(state.size)
    }

    /// Hands out `bytes` of parameter buffer memory, growing the list (or drawing from the
    /// parent) as needed.
    pub fn acquire(&self, bytes: u64) -> Result<()> {
        let bytes = align(bytes, PM_PAGE_SIZE);
        let mut state = self.lock();

        // own pages first, growing as far as allowed
        while state.used + state.lent + bytes > state.size && state.size < self.max_size && self.grow_size != 0 {
            self.grow_locked(&mut state)?;
        }

        let available = state.size.saturating_sub(state.used + state.lent);
        if available < bytes {
            let missing = bytes - available;
            match self.parent {
                Some(ref parent) => {
                    parent.lend(missing)?;
                    state.borrowed += missing;
                }
                None => {
                    warn!(bytes, size = state.size, max_size = self.max_size, "free list exhausted");
                    return Err(Error::OutOfDeviceMemory);
                }
            }
        }
        state.used += bytes;

        if self.grow_threshold != 0
            && state.size < self.max_size
            && (state.used + state.lent) * 100 >= state.size * self.grow_threshold as u64
        {
            // ahead-of-demand growth: nothing waits on it
            if let Err(err) = self.grow_locked(&mut state) {
                trace!(?err, size = state.size, "free list growth ahead of demand failed");
            }
        }
        Ok(())
    }

    /// Returns `bytes` previously obtained with [`acquire`](Self::acquire). Borrowed pages go
    /// back to the parent first.
    pub fn release(&self, bytes: u64) {
        let bytes = align(bytes, PM_PAGE_SIZE);
        let mut state = self.lock();
        debug_assert!(bytes <= state.used, "releasing more than was acquired");
        let bytes = bytes.min(state.used);
        let to_parent = bytes.min(state.borrowed);
        if to_parent != 0 {
            if let Some(ref parent) = self.parent {
                parent.take_back(to_parent);
            }
            state.borrowed -= to_parent;
        }
        state.used -= bytes;
    }

    fn lend(&self, bytes: u64) -> Result<()> {
        let mut state = self.lock();
        while state.used + state.lent + bytes > state.size {
            self.grow_locked(&mut state)?;
        }
        state.lent += bytes;
        Ok(())
    }

    fn take_back(&self, bytes: u64) {
        let mut state = self.lock();
        state.lent -= bytes.min(state.lent);
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.borrowed != 0 {
            if let Some(ref parent) = self.parent {
                parent.take_back(state.borrowed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostMemory;

    fn create(info: &DeviceInfo, memory: &Arc<dyn DeviceMemory>, ci: FreeListCreateInfo) -> Arc<FreeList> {
        FreeList::new(info, memory, Diagnostics::empty(), ci).unwrap()
    }

    #[test]
    fn sizes_are_aligned_and_clamped() {
        let info = DeviceInfo::default();
        let memory: Arc<dyn DeviceMemory> = Arc::new(HostMemory::new());
        let alignment = size_alignment(&info);
        assert_eq!(alignment, 16 * PM_PAGE_SIZE);

        let fl = create(
            &info,
            &memory,
            FreeListCreateInfo {
                initial_size: 5 * PM_PAGE_SIZE,
                max_size: 3 * PM_PAGE_SIZE,
                grow_size: 1,
                grow_threshold: 0,
                parent: None,
            },
        );
        assert_eq!(fl.max_size(), alignment);
        assert_eq!(fl.size(), alignment);
        assert_eq!(fl.grow_size(), alignment);
        assert_eq!(fl.grow(), Err(Error::OutOfDeviceMemory));
    }

    #[test]
    fn growth_is_bounded_by_max() {
        let info = DeviceInfo::default();
        let memory: Arc<dyn DeviceMemory> = Arc::new(HostMemory::new());
        let alignment = size_alignment(&info);
        let fl = create(
            &info,
            &memory,
            FreeListCreateInfo {
                initial_size: alignment,
                max_size: 5 * alignment,
                grow_size: 2 * alignment,
                grow_threshold: 0,
                parent: None,
            },
        );
        let mut sizes = vec![fl.size()];
        while let Ok(size) = fl.grow() {
            sizes.push(size);
        }
        assert_eq!(sizes, vec![alignment, 3 * alignment, 5 * alignment]);
        for w in sizes.windows(2) {
            assert!(w[1] - w[0] <= fl.grow_size());
            assert_eq!(w[1] % PM_PAGE_SIZE, 0);
        }
    }

    #[test]
    fn failed_growth_ahead_of_demand_is_not_an_error() {
        let info = DeviceInfo::default();
        let memory: Arc<dyn DeviceMemory> = Arc::new(HostMemory::new());
        let alignment = size_alignment(&info);
        let fl = create(
            &info,
            &memory,
            FreeListCreateInfo {
                initial_size: alignment,
                max_size: 2 * alignment,
                grow_size: 0,
                grow_threshold: 50,
                parent: None,
            },
        );
        // crosses the threshold, but a list without a grow step cannot grow
        fl.acquire(alignment / 2).unwrap();
        assert_eq!(fl.size(), alignment);
        assert_eq!(fl.used(), alignment / 2);
        assert_eq!(fl.acquire(alignment), Err(Error::OutOfDeviceMemory));
        assert_eq!(fl.used(), alignment / 2);
    }

    #[test]
    fn child_borrows_from_parent() {
        let info = DeviceInfo::default();
        let memory: Arc<dyn DeviceMemory> = Arc::new(HostMemory::new());
        let alignment = size_alignment(&info);
        let parent = create(
            &info,
            &memory,
            FreeListCreateInfo {
                initial_size: alignment,
                max_size: 2 * alignment,
                grow_size: alignment,
                grow_threshold: 0,
                parent: None,
            },
        );
        let child = create(
            &info,
            &memory,
            FreeListCreateInfo {
                initial_size: alignment,
                max_size: alignment,
                grow_size: 0,
                grow_threshold: 0,
                parent: Some(parent.clone()),
            },
        );

        child.acquire(alignment).unwrap();
        assert_eq!(child.borrowed(), 0);
        // the parent must grow to cover this one
        child.acquire(2 * PM_PAGE_SIZE).unwrap();
        assert_eq!(child.borrowed(), 2 * PM_PAGE_SIZE);
        assert_eq!(parent.size(), alignment);
        child.acquire(alignment).unwrap();
        assert_eq!(parent.size(), 2 * alignment);
        assert_eq!(child.acquire(alignment), Err(Error::OutOfDeviceMemory));

        child.release(alignment + 2 * PM_PAGE_SIZE);
        drop(child);
        parent.acquire(2 * alignment).unwrap();
    }
}
