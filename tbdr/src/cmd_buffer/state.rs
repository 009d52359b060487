//! Recording state of a command buffer.
use crate::{
    cmd_buffer::ClearValue,
    hw::{ta::StateHeader, MAX_DESCRIPTOR_SETS, MAX_PUSH_CONSTANTS_SIZE, MAX_VERTEX_INPUT_BINDINGS, MAX_VIEWPORTS},
    memory::DevAddr,
    pass::{Framebuffer, RenderPass},
    pipeline::{ComputePipeline, DepthBias, DescriptorSet, GraphicsPipeline, StencilState},
    query::QueryPool,
    stage::{PipelineStage, NUM_SYNC_STAGES},
    vk,
};
use bitflags::bitflags;
use fixedbitset::FixedBitSet;
use std::sync::Arc;

pub(crate) const MAX_PUSH_CONSTANTS_DW: usize = MAX_PUSH_CONSTANTS_SIZE / 4;

bitflags! {
    /// State that changed since it was last turned into hardware words.
    #[derive(Default)]
    pub(crate) struct DirtyFlags: u32 {
        const GFX_PIPELINE         = 1 << 0;
        const COMPUTE_PIPELINE     = 1 << 1;
        const VERTEX_BINDINGS      = 1 << 2;
        const GFX_DESC_SETS        = 1 << 3;
        const COMPUTE_DESC_SETS    = 1 << 4;
        const VIEWPORT             = 1 << 5;
        const SCISSOR              = 1 << 6;
        const DEPTH_BIAS           = 1 << 7;
        const STENCIL_COMPARE_MASK = 1 << 8;
        const STENCIL_WRITE_MASK   = 1 << 9;
        const STENCIL_REFERENCE    = 1 << 10;
        const LINE_WIDTH           = 1 << 11;
        const ISP_USERPASS         = 1 << 12;
        const VIS_TEST             = 1 << 13;
        const DRAW_VARIANT         = 1 << 14;
        const BASE_INSTANCE        = 1 << 15;
        const STENCIL = Self::STENCIL_COMPARE_MASK.bits
            | Self::STENCIL_WRITE_MASK.bits
            | Self::STENCIL_REFERENCE.bits;
    }
}

/// Render pass being recorded.
#[derive(Clone, Debug)]
pub(crate) struct RenderPassInfo {
    pub(crate) pass: Option<Arc<RenderPass>>,
    /// Unknown for secondaries inheriting a render pass without a framebuffer.
    pub(crate) framebuffer: Option<Arc<Framebuffer>>,
    pub(crate) subpass_idx: usize,
    pub(crate) current_hw_render: usize,
    pub(crate) isp_userpass: u32,
    pub(crate) enable_bg_tag: bool,
    pub(crate) process_empty_tiles: bool,
    pub(crate) render_area: vk::Rect2D,
    pub(crate) clear_values: Vec<ClearValue>,
}

impl Default for RenderPassInfo {
    fn default() -> Self {
        RenderPassInfo {
            pass: None,
            framebuffer: None,
            subpass_idx: 0,
            current_hw_render: 0,
            isp_userpass: 0,
            enable_bg_tag: false,
            process_empty_tiles: false,
            render_area: vk::Rect2D::default(),
            clear_values: Vec::new(),
        }
    }
}

/// Descriptor sets bound to one bind point.
#[derive(Clone, Debug)]
pub(crate) struct DescriptorState {
    pub(crate) sets: [Option<Arc<DescriptorSet>>; MAX_DESCRIPTOR_SETS],
    pub(crate) valid: FixedBitSet,
    /// Dynamic offsets of each set, in binding order.
    pub(crate) dynamic_offsets: [Vec<u32>; MAX_DESCRIPTOR_SETS],
}

impl DescriptorState {
    pub(crate) fn new() -> DescriptorState {
        DescriptorState {
            sets: Default::default(),
            valid: FixedBitSet::with_capacity(MAX_DESCRIPTOR_SETS),
            dynamic_offsets: Default::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PushConstants {
    pub(crate) data: [u32; MAX_PUSH_CONSTANTS_DW],
    /// Stages that have not seen the latest values yet.
    pub(crate) dirty_stages: vk::ShaderStageFlags,
    /// Upload of the latest values, shared by every stage.
    pub(crate) uploaded: Option<DevAddr>,
}

impl Default for PushConstants {
    fn default() -> Self {
        PushConstants {
            data: [0; MAX_PUSH_CONSTANTS_DW],
            dirty_stages: vk::ShaderStageFlags::empty(),
            uploaded: None,
        }
    }
}

/// Dynamic state, seeded from the bound pipeline.
#[derive(Clone, Debug)]
pub(crate) struct DynamicState {
    pub(crate) viewports: Vec<vk::Viewport>,
    pub(crate) scissors: Vec<vk::Rect2D>,
    pub(crate) depth_bias: DepthBias,
    pub(crate) stencil_front: StencilState,
    pub(crate) stencil_back: StencilState,
    pub(crate) line_width: f32,
}

impl Default for DynamicState {
    fn default() -> Self {
        DynamicState {
            viewports: Vec::new(),
            scissors: Vec::new(),
            depth_bias: DepthBias {
                constant_factor: 0.0,
                clamp: 0.0,
                slope_factor: 0.0,
            },
            stencil_front: StencilState::default(),
            stencil_back: StencilState::default(),
            line_width: 1.0,
        }
    }
}

/// Fragment PDS pointers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct PdsPointers {
    pub(crate) pixel_shader_base: u32,
    pub(crate) texture_uniform_code_base: u32,
    pub(crate) size_info1: u32,
    pub(crate) size_info2: u32,
    pub(crate) uniform_state_data_base: u32,
}

/// Last TA state words sent (or about to be sent) to the hardware.
#[derive(Clone, Debug)]
pub(crate) struct PppState {
    pub(crate) ispctl: u32,
    pub(crate) front_a: u32,
    pub(crate) front_b: u32,
    pub(crate) back_a: u32,
    pub(crate) back_b: u32,
    /// Depth bias enabled for the bound pipeline.
    pub(crate) dbenable: bool,
    /// Scissoring enabled (always, when a scissor is set).
    pub(crate) scenable: bool,
    pub(crate) depthbias_index: u32,
    pub(crate) scissor_index: u32,
    pub(crate) pds: PdsPointers,
    pub(crate) region_clip: [u32; 2],
    pub(crate) viewports: [[u32; 6]; MAX_VIEWPORTS],
    pub(crate) viewport_count: u32,
    pub(crate) output_selects: u32,
    pub(crate) varying_word0: u32,
    pub(crate) ppp_control: u32,
}

impl Default for PppState {
    fn default() -> Self {
        PppState {
            ispctl: 0,
            front_a: 0,
            front_b: 0,
            back_a: 0,
            back_b: 0,
            dbenable: false,
            scenable: false,
            depthbias_index: 0,
            scissor_index: 0,
            pds: PdsPointers::default(),
            region_clip: [0; 2],
            viewports: [[0; 6]; MAX_VIEWPORTS],
            viewport_count: 0,
            output_selects: 0,
            varying_word0: 0,
            ppp_control: 0,
        }
    }
}

/// Parameters of the last draw, deciding which vertex state has to be re-sent.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct DrawState {
    pub(crate) indexed: bool,
    pub(crate) indirect: bool,
    pub(crate) base_instance: u32,
}

/// Everything a command buffer remembers between recording calls.
#[derive(Debug)]
pub(crate) struct CmdState {
    /// Stages each stage would have to wait for if a barrier were recorded now.
    pub(crate) barriers_needed: [PipelineStage; NUM_SYNC_STAGES],
    pub(crate) render_pass_info: RenderPassInfo,

    pub(crate) gfx_pipeline: Option<Arc<GraphicsPipeline>>,
    pub(crate) compute_pipeline: Option<Arc<ComputePipeline>>,
    pub(crate) vertex_buffers: [DevAddr; MAX_VERTEX_INPUT_BINDINGS],
    pub(crate) index_buffer: Option<(DevAddr, vk::IndexType)>,
    pub(crate) gfx_desc: DescriptorState,
    pub(crate) compute_desc: DescriptorState,
    pub(crate) push_constants: PushConstants,
    pub(crate) dynamic: DynamicState,
    pub(crate) dirty: DirtyFlags,

    pub(crate) ppp: PppState,
    /// TA state groups to send with the next state update.
    pub(crate) emit_header: StateHeader,
    pub(crate) draw: DrawState,
    /// Vertex PDS data uploaded for the current vertex state.
    pub(crate) vertex_pds_data: DevAddr,
    /// Compute kernel PDS data uploaded for the current descriptors.
    pub(crate) compute_pds_data: DevAddr,

    pub(crate) vis_test_enabled: bool,
    pub(crate) vis_reg: u32,
    pub(crate) query_pool: Option<Arc<QueryPool>>,
    /// Queries begun in the open graphics sub-command.
    pub(crate) query_indices: FixedBitSet,
    pub(crate) max_shared_regs: u32,
}

impl CmdState {
    pub(crate) fn new() -> CmdState {
        CmdState {
            barriers_needed: [PipelineStage::ALL; NUM_SYNC_STAGES],
            render_pass_info: RenderPassInfo::default(),
            gfx_pipeline: None,
            compute_pipeline: None,
            vertex_buffers: [DevAddr::INVALID; MAX_VERTEX_INPUT_BINDINGS],
            index_buffer: None,
            gfx_desc: DescriptorState::new(),
            compute_desc: DescriptorState::new(),
            push_constants: PushConstants::default(),
            dynamic: DynamicState::default(),
            dirty: DirtyFlags::empty(),
            ppp: PppState::default(),
            emit_header: StateHeader::empty(),
            draw: DrawState::default(),
            vertex_pds_data: DevAddr::INVALID,
            compute_pds_data: DevAddr::INVALID,
            vis_test_enabled: false,
            vis_reg: 0,
            query_pool: None,
            query_indices: FixedBitSet::with_capacity(0),
            max_shared_regs: 0,
        }
    }

    pub(crate) fn in_render_pass(&self) -> bool {
        self.render_pass_info.pass.is_some()
    }

    /// Forces the next draw to send a full set of TA state.
    ///
    /// `start_geom` is set at the start of a graphics sub-command, where the hardware state is
    /// unknown; otherwise only the groups clobbered by a full-screen object are re-sent.
    pub(crate) fn reset_graphics_dirty_state(&mut self, start_geom: bool) {
        let clobbered = StateHeader::PRES_PPP_CTRL
            | StateHeader::PRES_VARYING_WORD1
            | StateHeader::PRES_VARYING_WORD0
            | StateHeader::PRES_OUTSELECTS
            | StateHeader::PRES_VIEWPORT
            | StateHeader::PRES_REGION_CLIP
            | StateHeader::PRES_PDS_STATE_PTR0
            | StateHeader::PRES_ISPCTL_FB
            | StateHeader::PRES_ISPCTL;
        if start_geom {
            self.emit_header = clobbered
                | StateHeader::PRES_STREAM_OUT_SIZE
                | StateHeader::PRES_VARYING_WORD2
                | StateHeader::PRES_WCLAMP;
        } else {
            self.emit_header |= clobbered;
        }

        self.dirty |= DirtyFlags::VERTEX_BINDINGS | DirtyFlags::GFX_PIPELINE | DirtyFlags::VIEWPORT;
    }

    /// Records that a sub-command of a type touching `stages` was started: every stage now has
    /// to wait for those stages at the next barrier.
    pub(crate) fn update_barriers(&mut self, stages: PipelineStage) {
        for needed in self.barriers_needed.iter_mut() {
            *needed |= stages;
        }
    }

    pub(crate) fn take_query_indices(&mut self) -> Vec<u32> {
        let indices = self.query_indices.ones().map(|i| i as u32).collect();
        self.query_indices.clear();
        indices
    }

    pub(crate) fn add_query_index(&mut self, index: u32) {
        let index = index as usize;
        if index >= self.query_indices.len() {
            self.query_indices.grow(index + 1);
        }
        self.query_indices.insert(index);
    }
}
