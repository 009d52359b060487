//! Hardware constants and word layouts.
//!
//! Only the fields the core writes are modelled. Multi-word blocks carry their block type in the
//! top bits of the first word; the remaining words are raw payload.
#![allow(clippy::identity_op)]
use crate::memory::DevAddr;

/// PM physical page size.
pub const PM_PAGE_SHIFT: u32 = 12;
pub const PM_PAGE_SIZE: u64 = 1 << PM_PAGE_SHIFT;
/// Size of one free list entry.
pub const FREE_LIST_ENTRY_SIZE: u64 = 4;

/// Number of render target data slots of an RTD.
pub const NUM_RTDATAS: usize = 2;
/// Macrotiles per axis (4x4 = 16 macrotiles).
pub const NUM_MACROTILES_XY: u32 = 4;
/// Size of one macrotile array entry, per layer.
pub const MTA_ENTRY_SIZE: u64 = 64;
/// Size of one multi-list entry.
pub const MLIST_ENTRY_SIZE: u64 = 8;
/// Size of one region header.
pub const REGION_HEADER_SIZE: u64 = 5;
/// Size of one tail pointer cache entry.
pub const TPC_ENTRY_SIZE: u64 = 4;
/// Size of the PM vertex heap table.
pub const PM_VHEAP_TABLE_SIZE: u64 = 0x180 * 8;
/// Size of the render target cache, per RT data slot.
pub const RTC_SIZE: u64 = 0x1000;

pub const MAX_INSTANCES_PER_TASK: u32 = 32;
pub const CDM_MAX_PACKED_WORKGROUPS_PER_TASK: u32 = 8;
pub const MAX_OVERLAPPED_PIXEL_TASK_INSTANCES: u32 = 7;
pub const USC_COMMON_SIZE_UNIT_SIZE: u32 = 64;
pub const USC_UNIFIED_SIZE_UNIT_SIZE: u32 = 16;
pub const PDS_DATA_SIZE_UNIT_SIZE: u32 = 16;
pub const PDS_TEMP_SIZE_UNIT_SIZE: u32 = 16;
pub const PIXEL_ALLOCATION_SIZE_MAX_IN_BLOCKS: u32 = 1024 / USC_COMMON_SIZE_UNIT_SIZE;
pub const COMPUTE_MAX_WORK_GROUP_SIZE: u32 = 1024;

/// The ISP user pass spawn field is 4 bits wide.
pub const ISP_UPASS_START_SIZE_MAX: u32 = 15;

pub const MAX_COLOR_ATTACHMENTS: usize = 8;
pub const MAX_VIEWPORTS: usize = 16;
pub const MAX_FRAMEBUFFER_SIZE: u32 = 8192;
pub const MAX_VERTEX_INPUT_BINDINGS: usize = 16;
pub const MAX_DESCRIPTOR_SETS: usize = 4;
pub const MAX_PUSH_CONSTANTS_SIZE: usize = 256;
pub const NUM_PBESTATE_STATE_WORDS: usize = 2;
pub const NUM_PBESTATE_REG_WORDS: usize = 3;
pub const NUM_PDS_BGND_WORDS: usize = 3;
/// The stride of a PBE render target must be a multiple of this many pixels.
pub const PBE_STRIDE_ALIGNMENT: u32 = 8;

/// Size in bytes of a control stream block.
pub const CSB_BLOCK_SIZE: u64 = 4096;

/// Video data master control stream (graphics).
pub mod vdm {
    use super::*;

    pub const BLOCK_TYPE_SHIFT: u32 = 29;
    pub const PPP_STATE_UPDATE: u32 = 0;
    pub const PDS_STATE_UPDATE: u32 = 1;
    pub const VDM_STATE_UPDATE: u32 = 2;
    pub const INDEX_LIST: u32 = 3;
    pub const STREAM_LINK: u32 = 4;
    pub const STREAM_RETURN: u32 = 5;
    pub const STREAM_TERMINATE: u32 = 6;

    pub const LINK_WORDS: u32 = 2;
    /// Guard space reserved at the end of each block, in words.
    pub const GUARD_WORDS: u32 = 16;

    pub const fn block_type(word: u32) -> u32 {
        word >> BLOCK_TYPE_SHIFT
    }

    const fn head(ty: u32) -> u32 {
        ty << BLOCK_TYPE_SHIFT
    }

    /// PPP_STATE0/1: pointer to a block of TA state words.
    pub fn ppp_state(addr: DevAddr, word_count: u32) -> [u32; 2] {
        debug_assert!(word_count < (1 << 16));
        [head(PPP_STATE_UPDATE) | (word_count << 8) | (addr.hi() & 0xff), addr.lo()]
    }

    /// STREAM_LINK0/1. With `with_return`, the stream returns here on STREAM_RETURN.
    pub fn stream_link(addr: DevAddr, with_return: bool) -> [u32; 2] {
        [
            head(STREAM_LINK) | ((with_return as u32) << 28) | (addr.hi() & 0xff),
            addr.lo(),
        ]
    }

    pub fn stream_return() -> [u32; 1] {
        [head(STREAM_RETURN)]
    }

    pub fn stream_terminate() -> [u32; 1] {
        [head(STREAM_TERMINATE)]
    }

    /// PDS_STATE0..2: vertex attribute DMA program.
    pub fn pds_state(data_addr: DevAddr, code_addr: DevAddr, data_size: u32, temp_size: u32) -> [u32; 3] {
        [
            head(PDS_STATE_UPDATE) | ((data_size & 0x3f) << 16) | (temp_size & 0x1f) << 8,
            data_addr.lo(),
            code_addr.lo(),
        ]
    }

    /// VDM_STATE0..5.
    pub struct VdmState {
        pub cam_size: u32,
        pub vs_max_instances: u32,
        pub vs_data_addr: DevAddr,
        pub vs_code_addr: DevAddr,
        pub vs_data_size: u32,
        pub vs_usc_temps: u32,
        pub cut_index: Option<u32>,
        pub flatshade_vertex: u32,
    }

    pub fn vdm_state(s: &VdmState) -> [u32; 6] {
        [
            head(VDM_STATE_UPDATE)
                | ((s.cut_index.is_some() as u32) << 28)
                | ((s.cam_size & 0x7f) << 16)
                | ((s.vs_max_instances & 0x1f) << 8)
                | (s.flatshade_vertex & 0x3),
            s.cut_index.unwrap_or(0),
            s.vs_data_addr.lo(),
            s.vs_code_addr.lo(),
            (s.vs_data_size & 0xffff) | ((s.vs_usc_temps & 0xff) << 16),
            0,
        ]
    }

    /// INDEX_LIST0..: one draw.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct IndexList {
        pub primitive_topology: u32,
        pub index_size: u32,
        pub index_addr: Option<DevAddr>,
        pub index_count: u32,
        pub instance_count: u32,
        pub index_offset: u32,
        pub indirect_addr: Option<DevAddr>,
        pub degen_cull: bool,
    }

    pub fn index_list(l: &IndexList) -> Vec<u32> {
        let mut w0 = head(INDEX_LIST) | ((l.primitive_topology & 0xf) << 20) | ((l.index_size & 0x3) << 18);
        w0 |= (l.index_addr.is_some() as u32) << 17;
        w0 |= (l.indirect_addr.is_some() as u32) << 16;
        w0 |= (l.degen_cull as u32) << 15;
        let mut words = vec![w0];
        if let Some(addr) = l.index_addr {
            words.push(addr.lo());
            words.push(addr.hi());
        }
        if let Some(addr) = l.indirect_addr {
            words.push(addr.lo());
            words.push(addr.hi());
        } else {
            words.push(l.index_count);
            words.push(l.instance_count.saturating_sub(1));
            words.push(l.index_offset);
        }
        words
    }
}

/// Compute data master control stream.
pub mod cdm {
    use super::*;

    pub const BLOCK_TYPE_SHIFT: u32 = 30;
    pub const KERNEL: u32 = 0;
    pub const STREAM_LINK: u32 = 1;
    pub const STREAM_TERMINATE: u32 = 2;

    pub const LINK_WORDS: u32 = 2;

    pub const SD_TYPE_NONE: u32 = 0;
    pub const SD_TYPE_PDS: u32 = 1;
    pub const SD_TYPE_USC: u32 = 2;

    pub const USC_TARGET_ALL: u32 = 0;
    pub const USC_TARGET_ANY: u32 = 1;

    pub const fn block_type(word: u32) -> u32 {
        word >> BLOCK_TYPE_SHIFT
    }

    /// Everything needed to emit one compute kernel.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct KernelInfo {
        pub indirect_buffer_addr: Option<DevAddr>,
        pub global_offsets_present: bool,
        pub usc_common_size: u32,
        pub usc_unified_size: u32,
        pub pds_temp_size: u32,
        pub pds_data_size: u32,
        pub usc_target: u32,
        pub is_fence: bool,
        pub pds_data_offset: u32,
        pub sd_type: u32,
        pub usc_common_shared: bool,
        pub pds_code_offset: u32,
        pub global_size: [u32; 3],
        pub local_size: [u32; 3],
        pub max_instances: u32,
    }

    pub fn kernel0(k: &KernelInfo) -> u32 {
        (KERNEL << BLOCK_TYPE_SHIFT)
            | ((k.indirect_buffer_addr.is_some() as u32) << 29)
            | ((k.global_offsets_present as u32) << 28)
            | ((k.is_fence as u32) << 27)
            | ((k.usc_target & 1) << 26)
            | ((k.usc_common_size & 0x1ff) << 17)
            | ((k.usc_unified_size & 0x3f) << 11)
            | ((k.pds_temp_size & 0x1f) << 6)
            | (k.pds_data_size & 0x3f)
    }

    pub fn kernel1(k: &KernelInfo) -> u32 {
        (k.pds_data_offset & !0xf) | ((k.sd_type & 0x3) << 1) | (k.usc_common_shared as u32)
    }

    pub fn kernel2(k: &KernelInfo) -> u32 {
        k.pds_code_offset & !0xf
    }

    pub fn kernel8(k: &KernelInfo) -> u32 {
        let max_instances = if k.max_instances == MAX_INSTANCES_PER_TASK {
            0
        } else {
            k.max_instances
        };
        ((max_instances & 0x1f) << 27)
            | ((k.local_size[0].saturating_sub(1) & 0x3ff) << 17)
            | ((k.local_size[1].saturating_sub(1) & 0x3ff) << 7)
            | (k.local_size[2].saturating_sub(1) & 0x7f)
    }

    /// All words of a kernel block: KERNEL0..2, then either the indirect address (KERNEL6/7) or
    /// the workgroup counts (KERNEL3..5), then KERNEL8.
    pub fn kernel(k: &KernelInfo) -> Vec<u32> {
        let mut words = vec![kernel0(k), kernel1(k), kernel2(k)];
        match k.indirect_buffer_addr {
            Some(addr) => {
                words.push(addr.hi() & 0xff);
                words.push(addr.lo() & !0x3);
            }
            None => {
                debug_assert!(k.global_size.iter().all(|&s| s > 0));
                words.extend(k.global_size.iter().map(|s| s - 1));
            }
        }
        words.push(kernel8(k));
        words
    }

    pub fn stream_link(addr: DevAddr) -> [u32; 2] {
        [(STREAM_LINK << BLOCK_TYPE_SHIFT) | (addr.hi() & 0xff), addr.lo()]
    }

    pub fn stream_terminate() -> [u32; 1] {
        [STREAM_TERMINATE << BLOCK_TYPE_SHIFT]
    }
}

/// Tile accelerator (PPP) state words.
pub mod ta {
    use bitflags::bitflags;

    bitflags! {
        /// Presence bits of the TA state header. Each bit announces that the corresponding
        /// register group follows the header.
        #[derive(Default)]
        pub struct StateHeader: u32 {
            const PRES_ISPCTL          = 1 << 0;
            const PRES_ISPCTL_FA       = 1 << 1;
            const PRES_ISPCTL_FB       = 1 << 2;
            const PRES_ISPCTL_BA       = 1 << 3;
            const PRES_ISPCTL_BB       = 1 << 4;
            const PRES_ISPCTL_DBSC     = 1 << 5;
            const PRES_PDS_STATE_PTR0  = 1 << 6;
            const PRES_PDS_STATE_PTR1  = 1 << 7;
            const PRES_PDS_STATE_PTR2  = 1 << 8;
            const PRES_PDS_STATE_PTR3  = 1 << 9;
            const PRES_REGION_CLIP     = 1 << 10;
            const PRES_VIEWPORT        = 1 << 11;
            const PRES_WCLAMP          = 1 << 12;
            const PRES_OUTSELECTS      = 1 << 13;
            const PRES_VARYING_WORD0   = 1 << 14;
            const PRES_VARYING_WORD1   = 1 << 15;
            const PRES_VARYING_WORD2   = 1 << 16;
            const PRES_PPP_CTRL        = 1 << 17;
            const PRES_STREAM_OUT_SIZE = 1 << 18;
            const PRES_STREAM_OUT_PROGRAM = 1 << 19;
            const PRES_TERMINATE       = 1 << 20;
        }
    }

    const VIEWPORT_COUNT_SHIFT: u32 = 24;

    /// Packs the header word.
    pub fn header(pres: StateHeader, viewport_count: u32) -> u32 {
        pres.bits() | ((viewport_count.saturating_sub(1) & 0xf) << VIEWPORT_COUNT_SHIFT)
    }

    /// Extracts the presence bits from a packed header.
    pub fn header_presence(word: u32) -> StateHeader {
        StateHeader::from_bits_truncate(word)
    }

    pub fn ispctl(upass: u32, vis_test: bool, vis_reg: u32, two_sided: bool, bpres: bool) -> u32 {
        ((upass & 0xf) << 28)
            | ((vis_test as u32) << 27)
            | ((vis_reg & 0x3fff) << 13)
            | ((two_sided as u32) << 12)
            | ((bpres as u32) << 11)
    }

    /// ISPA: depth compare mode, depth write disable, point/line width, stencil reference.
    pub fn ispa(depth_compare: u32, depth_write: bool, line_width: u32, stencil_ref: u32, objtype: u32) -> u32 {
        ((depth_compare & 0x7) << 28)
            | ((!depth_write as u32) << 27)
            | ((objtype & 0x7) << 24)
            | ((line_width & 0xff) << 8)
            | (stencil_ref & 0xff)
    }

    /// ISPB: stencil compare and write masks.
    pub fn ispb(compare_mask: u32, write_mask: u32) -> u32 {
        ((compare_mask & 0xff) << 8) | (write_mask & 0xff)
    }

    pub fn ispdbsc(depthbias_index: u32, scissor_index: u32) -> u32 {
        (depthbias_index & 0xffff) | ((scissor_index & 0xffff) << 16)
    }

    pub fn region_clip(left: u32, right: u32, top: u32, bottom: u32) -> [u32; 2] {
        [(left & 0x1ff) << 16 | (right & 0x1ff), (top & 0x1ff) << 16 | (bottom & 0x1ff)]
    }

    pub fn ppp_ctrl(cull: u32, front_face_ccw: bool, viewport_enable: bool, wclamp: bool, flatshade_vtx: u32) -> u32 {
        ((cull & 0x3) << 8)
            | ((front_face_ccw as u32) << 7)
            | ((viewport_enable as u32) << 6)
            | ((wclamp as u32) << 5)
            | (flatshade_vtx & 0x3)
    }

    pub fn outselects(vs_output_count: u32, has_point_size: bool, rt_array_index: bool) -> u32 {
        ((vs_output_count & 0xff) << 8) | ((has_point_size as u32) << 1) | (rt_array_index as u32)
    }

    /// TERMINATE0/1: clip rectangle of the final state block, in tiles (inclusive).
    pub fn terminate(clip_right: u32, clip_bottom: u32, render_target_index: u32) -> [u32; 2] {
        [
            ((clip_right & 0x1ff) << 16) | (clip_bottom & 0x1ff),
            render_target_index & 0x7ff,
        ]
    }

    /// Maximum coefficient storage left to fragment shaders when compute work overlaps them, in
    /// dwords.
    pub const USC_VARYING_SIZE_MAX: u32 = 256;

    /// ISPA object types.
    pub const OBJTYPE_TRIANGLE: u32 = 0;
    pub const OBJTYPE_LINE: u32 = 1;
    pub const OBJTYPE_POINT: u32 = 2;

    /// ISPA depth compare modes, in `vk::CompareOp` order.
    pub const DCMPMODE_ALWAYS: u32 = 7;

    pub fn varying_word0(f32_linear: u32, f32_flat: u32) -> u32 {
        (f32_linear & 0xff) | ((f32_flat & 0xff) << 8)
    }
}

/// Pixel back end state.
pub mod pbe {
    use super::*;

    /// State words for one PBE emit writing `dwords_per_pixel` dwords per pixel to `addr`.
    pub fn state_words(addr: DevAddr, dwords_per_pixel: u32, source_start: u32) -> [u32; NUM_PBESTATE_STATE_WORDS] {
        [
            addr.lo() & !0xf,
            (addr.hi() & 0xff) | ((dwords_per_pixel & 0x7) << 8) | ((source_start & 0xff) << 16),
        ]
    }

    /// Register words: stride in pixels, surface size and sample configuration.
    pub fn reg_words(stride: u32, width: u32, height: u32, samples: u32, down_scale: bool) -> [u32; NUM_PBESTATE_REG_WORDS] {
        [
            stride.saturating_sub(1) & 0xffff,
            (width.saturating_sub(1) & 0xffff) | ((height.saturating_sub(1) & 0xffff) << 16),
            (crate::util::sample_count_log2(samples) as u32 & 0x3) | ((down_scale as u32) << 2),
        ]
    }
}

/// Pixel data sequencer background object words.
pub mod pds {
    use super::*;

    /// Packs the three background object register words.
    pub fn bgnd_words(
        usc_program: DevAddr,
        pds_data: DevAddr,
        pds_code: DevAddr,
        usc_shared_size: u32,
        pds_data_size: u32,
        pds_temp_size: u32,
    ) -> [u32; NUM_PDS_BGND_WORDS] {
        [
            (pds_code.lo() & !0xf) | (usc_program.lo() >> 28),
            pds_data.lo() & !0xf,
            ((usc_shared_size & 0x3ff) << 16) | ((pds_data_size & 0x3f) << 8) | (pds_temp_size & 0x1f),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_types_round_trip() {
        let link = vdm::stream_link(DevAddr(0x1_2345_6780), true);
        assert_eq!(vdm::block_type(link[0]), vdm::STREAM_LINK);
        assert_eq!(link[1], 0x2345_6780);
        assert_eq!(vdm::block_type(vdm::stream_terminate()[0]), vdm::STREAM_TERMINATE);
        assert_eq!(cdm::block_type(cdm::stream_terminate()[0]), cdm::STREAM_TERMINATE);
    }

    #[test]
    fn header_keeps_presence_and_viewport_count_apart() {
        let pres = ta::StateHeader::PRES_VIEWPORT | ta::StateHeader::PRES_STREAM_OUT_PROGRAM;
        let word = ta::header(pres, 16);
        assert_eq!(ta::header_presence(word), pres);
        assert_eq!(word >> 24, 15);
        assert_eq!(ta::header(ta::StateHeader::empty(), 0), 0);
    }
}
