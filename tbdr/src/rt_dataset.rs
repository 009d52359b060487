//! Render target datasets.
//!
//! An RTD describes the parameter buffer layout of one framebuffer size and sample count to the
//! tiling engine: a local free list, the macrotile array and multi-list, region headers and the
//! tail pointer cache. Per-render data is double buffered ([`NUM_RTDATAS`] slots) so that the
//! geometry phase of the next render can overlap the fragment phase of the previous one.
use crate::{
    device::{Device, DeviceInfo},
    free_list::{size_alignment, FreeList, FreeListCreateInfo},
    hw::{
        MLIST_ENTRY_SIZE, MTA_ENTRY_SIZE, NUM_MACROTILES_XY, NUM_RTDATAS, PM_PAGE_SIZE, PM_VHEAP_TABLE_SIZE,
        REGION_HEADER_SIZE, RTC_SIZE, TPC_ENTRY_SIZE,
    },
    memory::{Bo, DevAddr, Heap},
    util::{align, align32, div_ceil32},
    Result,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tracing::{debug, trace, trace_span};

/// Minimum number of pages each macrotile gets from the local free list, per layer.
const LOCAL_FREE_LIST_PAGES_PER_MACROTILE: u64 = 4;

/// Number of ISP samples per pixel in each direction for a sample count.
pub fn isp_samples_per_tile(samples: u32) -> (u32, u32) {
    match samples {
        0 | 1 => (1, 1),
        2 => (2, 1),
        4 => (2, 2),
        8 => (4, 2),
        _ => panic!("unsupported number of samples: {}", samples),
    }
}

/// Macrotile geometry of a render target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MacrotileInfo {
    pub tile_size_x: u32,
    pub tile_size_y: u32,
    pub num_tiles_x: u32,
    pub num_tiles_y: u32,
    pub mtiles_x: u32,
    pub mtiles_y: u32,
    /// Macrotile boundaries, in tiles.
    pub mtile_x: [u32; 3],
    pub mtile_y: [u32; 3],
    pub x_tile_max: u32,
    pub y_tile_max: u32,
    pub tiles_per_mtile_x: u32,
    pub tiles_per_mtile_y: u32,
}

impl MacrotileInfo {
    pub fn new(info: &DeviceInfo, width: u32, height: u32, samples: u32) -> MacrotileInfo {
        let (samples_x, samples_y) = isp_samples_per_tile(samples);
        let num_tiles_x = div_ceil32(width, info.tile_size_x);
        let num_tiles_y = div_ceil32(height, info.tile_size_y);

        let (mtile_x, mtile_y, x_tile_max, y_tile_max);
        if info.simple_internal_parameter_format {
            // 16 macrotiles of a multiple of 2x2 tiles, aligned to tile groups
            mtile_x = [div_ceil32(num_tiles_x, 8) * 2, 0, 0];
            mtile_y = [div_ceil32(num_tiles_y, 8) * 2, 0, 0];
            x_tile_max = align32(num_tiles_x, 2) - 1;
            y_tile_max = align32(num_tiles_y, 2) - 1;
        } else {
            // 16 macrotiles of a multiple of 4x4 tiles
            let x1 = align32(div_ceil32(num_tiles_x, 4), 4);
            let y1 = align32(div_ceil32(num_tiles_y, 4), 4);
            mtile_x = [x1, x1 * 2, x1 * 3];
            mtile_y = [y1, y1 * 2, y1 * 3];
            x_tile_max = num_tiles_x.max(1) - 1;
            y_tile_max = num_tiles_y.max(1) - 1;
        }

        MacrotileInfo {
            tile_size_x: info.tile_size_x,
            tile_size_y: info.tile_size_y,
            num_tiles_x,
            num_tiles_y,
            mtiles_x: NUM_MACROTILES_XY,
            mtiles_y: NUM_MACROTILES_XY,
            mtile_x,
            mtile_y,
            x_tile_max,
            y_tile_max,
            tiles_per_mtile_x: mtile_x[0] * samples_x,
            tiles_per_mtile_y: mtile_y[0] * samples_y,
        }
    }

    pub fn num_macrotiles(&self) -> u32 {
        self.mtiles_x * self.mtiles_y
    }
}

/// Addresses of one render target data slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RtDataAddrs {
    pub mta: DevAddr,
    pub mlist: DevAddr,
    pub rgn_headers: DevAddr,
    pub rtc: DevAddr,
}

#[derive(Debug)]
struct RtData {
    mta_mlist: Bo,
    mlist_offset: u64,
    rgn_headers: Bo,
}

/// A render target dataset.
#[derive(Debug)]
pub struct RenderTargetDataset {
    width: u32,
    height: u32,
    samples: u32,
    layers: u32,
    mtile_info: MacrotileInfo,
    global_free_list: Arc<FreeList>,
    local_free_list: Arc<FreeList>,
    vheap_rtc: Bo,
    tpc: Bo,
    rt_datas: Vec<RtData>,
    rt_data_idx: AtomicUsize,
    need_frag: AtomicBool,
}

impl RenderTargetDataset {
    pub fn new(device: &Arc<Device>, width: u32, height: u32, samples: u32, layers: u32) -> Result<RenderTargetDataset> {
        let _span = trace_span!("rt_dataset_create", width, height, samples, layers).entered();
        let info = device.info();
        let layers = layers.max(1);
        let mtile_info = MacrotileInfo::new(info, width, height, samples);

        let global_free_list = device.global_free_list().clone();
        let local_size = align(
            mtile_info.num_macrotiles() as u64 * LOCAL_FREE_LIST_PAGES_PER_MACROTILE * layers as u64 * PM_PAGE_SIZE,
            size_alignment(info),
        );
        let local_free_list = device.create_free_list(FreeListCreateInfo {
            initial_size: local_size,
            max_size: local_size,
            grow_size: 0,
            grow_threshold: 0,
            parent: Some(global_free_list.clone()),
        })?;

        // vertex heap table followed by one render target cache per slot
        let vheap_rtc = device.alloc(
            Heap::General,
            PM_VHEAP_TABLE_SIZE + RTC_SIZE * NUM_RTDATAS as u64,
            PM_PAGE_SIZE,
        )?;

        let tiles_x = mtile_info.x_tile_max as u64 + 1;
        let tiles_y = mtile_info.y_tile_max as u64 + 1;
        let tpc = device.alloc(
            Heap::General,
            align(tiles_x * tiles_y * TPC_ENTRY_SIZE * layers as u64, PM_PAGE_SIZE),
            PM_PAGE_SIZE,
        )?;

        let (samples_x, samples_y) = isp_samples_per_tile(samples);
        let mta_size = MTA_ENTRY_SIZE * mtile_info.num_macrotiles() as u64 * layers as u64;
        let mlist_offset = align(mta_size, 64);
        let mlist_size = (global_free_list.max_pages() + local_free_list.max_pages()) * MLIST_ENTRY_SIZE;
        let rgn_headers_size = align(
            tiles_x * tiles_y * (samples_x * samples_y) as u64 * REGION_HEADER_SIZE * layers as u64,
            64,
        );

        let mut rt_datas = Vec::with_capacity(NUM_RTDATAS);
        for _ in 0..NUM_RTDATAS {
            rt_datas.push(RtData {
                mta_mlist: device.alloc(Heap::General, mlist_offset + mlist_size, PM_PAGE_SIZE)?,
                mlist_offset,
                rgn_headers: device.alloc(Heap::RegionHeader, rgn_headers_size, 64)?,
            });
        }

        debug!(
            ?mtile_info,
            local_free_list_size = local_size,
            rgn_headers_size,
            mlist_size,
            "created render target dataset"
        );

        Ok(RenderTargetDataset {
            width,
            height,
            samples,
            layers,
            mtile_info,
            global_free_list,
            local_free_list,
            vheap_rtc,
            tpc,
            rt_datas,
            rt_data_idx: AtomicUsize::new(0),
            need_frag: AtomicBool::new(false),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn mtile_info(&self) -> &MacrotileInfo {
        &self.mtile_info
    }

    pub fn global_free_list(&self) -> &Arc<FreeList> {
        &self.global_free_list
    }

    pub fn local_free_list(&self) -> &Arc<FreeList> {
        &self.local_free_list
    }

    pub fn vheap_table_addr(&self) -> DevAddr {
        self.vheap_rtc.addr()
    }

    pub fn tpc_addr(&self) -> DevAddr {
        self.tpc.addr()
    }

    /// Slot the next job will use.
    pub fn rt_data_idx(&self) -> usize {
        self.rt_data_idx.load(Ordering::Acquire)
    }

    /// Whether a geometry-only job was submitted and its fragment job is still pending.
    pub fn need_frag(&self) -> bool {
        self.need_frag.load(Ordering::Acquire)
    }

    pub fn rt_data_addrs(&self, idx: usize) -> RtDataAddrs {
        let data = &self.rt_datas[idx];
        RtDataAddrs {
            mta: data.mta_mlist.addr(),
            mlist: data.mta_mlist.addr().offset(data.mlist_offset),
            rgn_headers: data.rgn_headers.addr(),
            rtc: self.vheap_rtc.addr().offset(PM_VHEAP_TABLE_SIZE + RTC_SIZE * idx as u64),
        }
    }

    /// Records the submission of a job on this dataset. The slot only advances once the fragment
    /// phase has been submitted.
    pub(crate) fn job_submitted(&self, run_frag: bool) {
        if run_frag {
            let prev = self
                .rt_data_idx
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idx| Some((idx + 1) % NUM_RTDATAS))
                .unwrap_or_else(|idx| idx);
            let next = (prev + 1) % NUM_RTDATAS;
            self.need_frag.store(false, Ordering::Release);
            trace!(prev, next, "render target data slot advanced");
        } else {
            self.need_frag.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn simple_format_macrotiles() {
        let info = DeviceInfo::default();
        let m = MacrotileInfo::new(&info, 1920, 1080, 4);
        assert_eq!(m.num_tiles_x, 60);
        assert_eq!(m.num_tiles_y, 34);
        assert_eq!(m.mtile_x[0], 16);
        assert_eq!(m.mtile_y[0], 10);
        assert_eq!(m.x_tile_max, 59);
        assert_eq!(m.y_tile_max, 33);
        assert_eq!(m.tiles_per_mtile_x, 32);
        assert_eq!(m.tiles_per_mtile_y, 20);
        assert_eq!(m.num_macrotiles(), 16);
    }

    #[test]
    fn legacy_format_macrotiles() {
        let info = DeviceInfo {
            simple_internal_parameter_format: false,
            ..Default::default()
        };
        let m = MacrotileInfo::new(&info, 100, 100, 1);
        assert_eq!(m.num_tiles_x, 4);
        assert_eq!(m.mtile_x, [4, 8, 12]);
        assert_eq!(m.x_tile_max, 3);
    }

    #[test]
    fn slot_advances_on_fragment_only() {
        let device = testing::device();
        let rtd = RenderTargetDataset::new(&device, 256, 256, 1, 1).unwrap();
        assert_eq!(rtd.rt_data_idx(), 0);
        rtd.job_submitted(false);
        assert_eq!(rtd.rt_data_idx(), 0);
        assert!(rtd.need_frag());
        rtd.job_submitted(true);
        assert_eq!(rtd.rt_data_idx(), 1);
        assert!(!rtd.need_frag());
        rtd.job_submitted(true);
        assert_eq!(rtd.rt_data_idx(), 0);

        let local = rtd.local_free_list();
        assert_eq!(local.size(), local.max_size());
        assert_eq!(local.grow_size(), 0);
        assert!(Arc::ptr_eq(local.parent().unwrap(), device.global_free_list()));
    }

    #[test]
    fn concurrent_fragment_jobs_advance_once_each() {
        let device = testing::device();
        let rtd = Arc::new(RenderTargetDataset::new(&device, 64, 64, 1, 1).unwrap());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let rtd = rtd.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        rtd.job_submitted(true);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(rtd.rt_data_idx(), 1000 % NUM_RTDATAS);
    }
}
