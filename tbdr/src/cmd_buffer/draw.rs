//! Graphics state binding, draws and TA state emission.
use crate::{
    cmd_buffer::{
        state::{DescriptorState, DirtyFlags},
        CommandBuffer, DeferredPatch, DepthStencilUsage, GraphicsSubCmd, SubCmdType,
    },
    csb::StreamType,
    hw::{
        self,
        ta::{self, StateHeader},
        vdm, MAX_DESCRIPTOR_SETS,
    },
    memory::{DevAddr, Heap},
    pipeline::{DescriptorSet, GraphicsPipeline, StageDescriptorMapping},
    util::div_ceil32,
    vk, Result,
};
use std::sync::Arc;
use tracing::{trace, trace_span};

/// Dirty state that requires the vertex PDS program to be re-sent.
const VERTEX_STATE_DIRTY: DirtyFlags = DirtyFlags::from_bits_truncate(
    DirtyFlags::GFX_PIPELINE.bits()
        | DirtyFlags::VERTEX_BINDINGS.bits()
        | DirtyFlags::BASE_INSTANCE.bits()
        | DirtyFlags::DRAW_VARIANT.bits()
        | DirtyFlags::GFX_DESC_SETS.bits(),
);

/// Dirty state that requires a TA state update.
const PPP_STATE_DIRTY: DirtyFlags = DirtyFlags::from_bits_truncate(
    DirtyFlags::GFX_DESC_SETS.bits()
        | DirtyFlags::VIS_TEST.bits()
        | DirtyFlags::GFX_PIPELINE.bits()
        | DirtyFlags::ISP_USERPASS.bits()
        | DirtyFlags::STENCIL.bits()
        | DirtyFlags::DEPTH_BIAS.bits()
        | DirtyFlags::LINE_WIDTH.bits()
        | DirtyFlags::SCISSOR.bits()
        | DirtyFlags::VIEWPORT.bits(),
);

const GRAPHICS_DIRTY: DirtyFlags = DirtyFlags::from_bits_truncate(
    DirtyFlags::all().bits() & !(DirtyFlags::COMPUTE_PIPELINE.bits() | DirtyFlags::COMPUTE_DESC_SETS.bits()),
);

fn fui(f: f32) -> u32 {
    f.to_bits()
}

/// VDM primitive topology.
fn primitive_topology(topology: vk::PrimitiveTopology) -> u32 {
    match topology {
        vk::PrimitiveTopology::POINT_LIST => 0,
        vk::PrimitiveTopology::LINE_LIST => 1,
        vk::PrimitiveTopology::LINE_STRIP => 2,
        vk::PrimitiveTopology::TRIANGLE_LIST => 3,
        vk::PrimitiveTopology::TRIANGLE_STRIP => 4,
        vk::PrimitiveTopology::TRIANGLE_FAN => 5,
        vk::PrimitiveTopology::LINE_LIST_WITH_ADJACENCY => 6,
        vk::PrimitiveTopology::LINE_STRIP_WITH_ADJACENCY => 7,
        vk::PrimitiveTopology::TRIANGLE_LIST_WITH_ADJACENCY => 8,
        vk::PrimitiveTopology::TRIANGLE_STRIP_WITH_ADJACENCY => 9,
        vk::PrimitiveTopology::PATCH_LIST => 10,
        other => panic!("unsupported primitive topology: {:?}", other),
    }
}

/// ISP object type rasterizing a topology.
fn object_type(topology: vk::PrimitiveTopology) -> u32 {
    match topology {
        vk::PrimitiveTopology::POINT_LIST => ta::OBJTYPE_POINT,
        vk::PrimitiveTopology::LINE_LIST
        | vk::PrimitiveTopology::LINE_STRIP
        | vk::PrimitiveTopology::LINE_LIST_WITH_ADJACENCY
        | vk::PrimitiveTopology::LINE_STRIP_WITH_ADJACENCY => ta::OBJTYPE_LINE,
        _ => ta::OBJTYPE_TRIANGLE,
    }
}

fn index_size(index_type: vk::IndexType) -> (u32, u64) {
    match index_type {
        vk::IndexType::UINT8_EXT => (0, 1),
        vk::IndexType::UINT16 => (1, 2),
        vk::IndexType::UINT32 => (2, 4),
        other => panic!("unsupported index type: {:?}", other),
    }
}

/// Line width in 4.4 fixed point, minus one.
fn line_width_fixed(width: f32) -> u32 {
    ((width.max(0.0).min(16.0) * 16.0) as u32).saturating_sub(1).min(0xff)
}

/// Depth compare mode of the ISP, equal to the Vulkan compare op numbering.
fn compare_mode(op: vk::CompareOp) -> u32 {
    op.as_raw() as u32 & 0x7
}

/// Scissor table entry: inclusive pixel ranges, min in the high half.
fn scissor_words(rect: &vk::Rect2D) -> [u32; 2] {
    let x = rect.offset.x.max(0) as u32;
    let y = rect.offset.y.max(0) as u32;
    let xmax = (x + rect.extent.width).saturating_sub(1);
    let ymax = (y + rect.extent.height).saturating_sub(1);
    [((x & 0xffff) << 16) | (xmax & 0xffff), ((y & 0xffff) << 16) | (ymax & 0xffff)]
}

/// Writes a 64-bit address into two consecutive dwords of a PDS data segment.
fn patch_addr(data: &mut [u32], offset_dw: u32, addr: DevAddr) {
    let offset = offset_dw as usize;
    if offset + 1 < data.len() {
        data[offset] = addr.lo();
        data[offset + 1] = addr.hi();
    } else {
        debug_assert!(false, "PDS data offset {} out of range", offset_dw);
    }
}

/// Copy of a PDS data template with the descriptor table and push constant addresses filled in.
pub(crate) fn patch_descriptor_data(
    template: &[u32],
    mapping: &StageDescriptorMapping,
    descriptor_table: DevAddr,
    push_constants: DevAddr,
) -> Vec<u32> {
    let mut data = template.to_vec();
    if let Some(offset) = mapping.descriptor_table_offset_dw {
        patch_addr(&mut data, offset, descriptor_table);
    }
    if let Some(offset) = mapping.push_constants_offset_dw {
        patch_addr(&mut data, offset, push_constants);
    }
    data
}

impl CommandBuffer {
    pub fn bind_graphics_pipeline(&mut self, pipeline: &Arc<GraphicsPipeline>) {
        self.state.gfx_pipeline = Some(pipeline.clone());
        let dynamic = &mut self.state.dynamic;
        dynamic.stencil_front = pipeline.stencil_front;
        dynamic.stencil_back = pipeline.stencil_back;
        if let Some(bias) = pipeline.depth_bias {
            dynamic.depth_bias = bias;
        }
        dynamic.line_width = pipeline.line_width;
        self.state.dirty |=
            DirtyFlags::GFX_PIPELINE | DirtyFlags::STENCIL | DirtyFlags::DEPTH_BIAS | DirtyFlags::LINE_WIDTH;
    }

    /// Binds descriptor sets starting at `first_set`. `dynamic_offsets` holds one offset per
    /// dynamic buffer of the bound sets, in order.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
        dynamic_offsets: &[u32],
    ) {
        let (desc, flag) = match bind_point {
            vk::PipelineBindPoint::GRAPHICS => (&mut self.state.gfx_desc, DirtyFlags::GFX_DESC_SETS),
            vk::PipelineBindPoint::COMPUTE => (&mut self.state.compute_desc, DirtyFlags::COMPUTE_DESC_SETS),
            other => panic!("unsupported bind point: {:?}", other),
        };
        let mut offsets = dynamic_offsets.iter().copied();
        for (i, set) in sets.iter().enumerate() {
            let index = first_set as usize + i;
            debug_assert!(index < MAX_DESCRIPTOR_SETS);
            let count = set.layout().dynamic_buffer_count as usize;
            desc.dynamic_offsets[index] = offsets.by_ref().take(count).collect();
            debug_assert_eq!(desc.dynamic_offsets[index].len(), count, "missing dynamic offsets");
            desc.sets[index] = Some(set.clone());
            desc.valid.insert(index);
        }
        self.state.dirty |= flag;
    }

    /// Binds vertex buffers, given as the address of their first vertex.
    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[DevAddr]) {
        for (i, &addr) in buffers.iter().enumerate() {
            self.state.vertex_buffers[first_binding as usize + i] = addr;
        }
        self.state.dirty |= DirtyFlags::VERTEX_BINDINGS;
    }

    pub fn bind_index_buffer(&mut self, addr: DevAddr, index_type: vk::IndexType) {
        self.state.index_buffer = Some((addr, index_type));
    }

    /// Updates push constants. `offset` is in bytes.
    pub fn push_constants(&mut self, stages: vk::ShaderStageFlags, offset: u32, values: &[u32]) {
        debug_assert_eq!(offset % 4, 0);
        let start = (offset / 4) as usize;
        let pc = &mut self.state.push_constants;
        pc.data[start..start + values.len()].copy_from_slice(values);
        pc.dirty_stages |= stages;
        pc.uploaded = None;
    }

    pub fn set_viewport(&mut self, first_viewport: u32, viewports: &[vk::Viewport]) {
        let first = first_viewport as usize;
        debug_assert!(first + viewports.len() <= hw::MAX_VIEWPORTS);
        let dynamic = &mut self.state.dynamic;
        if dynamic.viewports.len() < first + viewports.len() {
            dynamic.viewports.resize(first + viewports.len(), vk::Viewport::default());
        }
        dynamic.viewports[first..first + viewports.len()].copy_from_slice(viewports);
        self.state.dirty |= DirtyFlags::VIEWPORT;
    }

    pub fn set_scissor(&mut self, first_scissor: u32, scissors: &[vk::Rect2D]) {
        let first = first_scissor as usize;
        let dynamic = &mut self.state.dynamic;
        if dynamic.scissors.len() < first + scissors.len() {
            dynamic.scissors.resize(first + scissors.len(), vk::Rect2D::default());
        }
        dynamic.scissors[first..first + scissors.len()].copy_from_slice(scissors);
        self.state.dirty |= DirtyFlags::SCISSOR;
    }

    pub fn set_depth_bias(&mut self, constant_factor: f32, clamp: f32, slope_factor: f32) {
        let bias = &mut self.state.dynamic.depth_bias;
        bias.constant_factor = constant_factor;
        bias.clamp = clamp;
        bias.slope_factor = slope_factor;
        self.state.dirty |= DirtyFlags::DEPTH_BIAS;
    }

    pub fn set_stencil_compare_mask(&mut self, faces: vk::StencilFaceFlags, mask: u32) {
        if faces.contains(vk::StencilFaceFlags::FRONT) {
            self.state.dynamic.stencil_front.compare_mask = mask;
        }
        if faces.contains(vk::StencilFaceFlags::BACK) {
            self.state.dynamic.stencil_back.compare_mask = mask;
        }
        self.state.dirty |= DirtyFlags::STENCIL_COMPARE_MASK;
    }

    pub fn set_stencil_write_mask(&mut self, faces: vk::StencilFaceFlags, mask: u32) {
        if faces.contains(vk::StencilFaceFlags::FRONT) {
            self.state.dynamic.stencil_front.write_mask = mask;
        }
        if faces.contains(vk::StencilFaceFlags::BACK) {
            self.state.dynamic.stencil_back.write_mask = mask;
        }
        self.state.dirty |= DirtyFlags::STENCIL_WRITE_MASK;
    }

    pub fn set_stencil_reference(&mut self, faces: vk::StencilFaceFlags, reference: u32) {
        if faces.contains(vk::StencilFaceFlags::FRONT) {
            self.state.dynamic.stencil_front.reference = reference;
        }
        if faces.contains(vk::StencilFaceFlags::BACK) {
            self.state.dynamic.stencil_back.reference = reference;
        }
        self.state.dirty |= DirtyFlags::STENCIL_REFERENCE;
    }

    pub fn set_line_width(&mut self, width: f32) {
        self.state.dynamic.line_width = width;
        self.state.dirty |= DirtyFlags::LINE_WIDTH;
    }

    //----------------------------------------------------------------------------------------------

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()> {
        let _span = trace_span!("draw").entered();
        self.record(|cb| {
            cb.record_draw(
                false,
                false,
                first_instance,
                vdm::IndexList {
                    index_count: vertex_count,
                    instance_count,
                    index_offset: first_vertex,
                    ..Default::default()
                },
            )
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        let _span = trace_span!("draw_indexed").entered();
        let (index_addr, index_type) = match self.state.index_buffer {
            Some(index_buffer) => index_buffer,
            None => panic!("indexed draw without an index buffer"),
        };
        let (size_code, size) = index_size(index_type);
        self.record(|cb| {
            cb.record_draw(
                true,
                false,
                first_instance,
                vdm::IndexList {
                    index_size: size_code,
                    index_addr: Some(index_addr.offset(first_index as u64 * size)),
                    index_count,
                    instance_count,
                    index_offset: vertex_offset as u32,
                    ..Default::default()
                },
            )
        })
    }

    /// Draws with parameters read from `draw_count` records of `stride` bytes at `addr`.
    pub fn draw_indirect(&mut self, addr: DevAddr, draw_count: u32, stride: u32) -> Result<()> {
        let _span = trace_span!("draw_indirect").entered();
        self.record(|cb| {
            for i in 0..draw_count {
                cb.record_draw(
                    false,
                    true,
                    0,
                    vdm::IndexList {
                        indirect_addr: Some(addr.offset(i as u64 * stride as u64)),
                        ..Default::default()
                    },
                )?;
            }
            Ok(())
        })
    }

    pub fn draw_indexed_indirect(&mut self, addr: DevAddr, draw_count: u32, stride: u32) -> Result<()> {
        let _span = trace_span!("draw_indexed_indirect").entered();
        let (index_addr, index_type) = match self.state.index_buffer {
            Some(index_buffer) => index_buffer,
            None => panic!("indexed draw without an index buffer"),
        };
        let (size_code, _) = index_size(index_type);
        self.record(|cb| {
            for i in 0..draw_count {
                cb.record_draw(
                    true,
                    true,
                    0,
                    vdm::IndexList {
                        index_size: size_code,
                        index_addr: Some(index_addr),
                        indirect_addr: Some(addr.offset(i as u64 * stride as u64)),
                        ..Default::default()
                    },
                )?;
            }
            Ok(())
        })
    }

    fn record_draw(
        &mut self,
        indexed: bool,
        indirect: bool,
        base_instance: u32,
        mut index_list: vdm::IndexList,
    ) -> Result<()> {
        let pipeline = match self.state.gfx_pipeline.clone() {
            Some(pipeline) => pipeline,
            None => panic!("draw without a graphics pipeline"),
        };
        if !indirect && (index_list.index_count == 0 || index_list.instance_count == 0) {
            return Ok(());
        }

        self.start_sub_cmd(SubCmdType::Graphics)?;

        let draw = &mut self.state.draw;
        if draw.indexed != indexed || draw.indirect != indirect {
            draw.indexed = indexed;
            draw.indirect = indirect;
            self.state.dirty |= DirtyFlags::DRAW_VARIANT;
        }
        if self.state.draw.base_instance != base_instance {
            self.state.draw.base_instance = base_instance;
            self.state.dirty |= DirtyFlags::BASE_INSTANCE;
        }
        index_list.primitive_topology = primitive_topology(pipeline.topology);

        self.with_current_gfx(|cb, gfx| {
            cb.validate_draw_state(gfx, &pipeline)?;
            gfx.csb.set_relocation_mark();
            gfx.csb.emit(&vdm::index_list(&index_list))?;
            gfx.csb.clear_relocation_mark();
            Ok(())
        })?;
        self.state.dirty &= !GRAPHICS_DIRTY;
        Ok(())
    }

    fn validate_draw_state(&mut self, gfx: &mut GraphicsSubCmd, pipeline: &Arc<GraphicsPipeline>) -> Result<()> {
        gfx.empty_cmd = false;

        let depth_compare = if pipeline.depth_test {
            pipeline.depth_compare
        } else {
            vk::CompareOp::ALWAYS
        };
        if gfx.depth_usage == DepthStencilUsage::Undefined && depth_compare != vk::CompareOp::ALWAYS {
            gfx.depth_usage = DepthStencilUsage::Needed;
        }
        if pipeline.stencil_test
            && gfx.stencil_usage == DepthStencilUsage::Undefined
            && pipeline.stencil_compare != vk::CompareOp::ALWAYS
        {
            gfx.stencil_usage = DepthStencilUsage::Needed;
        }
        let dynamic = &self.state.dynamic;
        if pipeline.stencil_test && (dynamic.stencil_front.write_mask != 0 || dynamic.stencil_back.write_mask != 0) {
            gfx.modifies_stencil = true;
        }
        if pipeline.depth_test && pipeline.depth_write {
            gfx.modifies_depth = true;
        }
        if self.device.info().compute_overlap && pipeline.fragment_coeff_size > ta::USC_VARYING_SIZE_MAX {
            gfx.disable_compute_overlap = true;
        }

        let graphics_stages = vk::ShaderStageFlags::ALL_GRAPHICS;
        if self.state.push_constants.dirty_stages.intersects(graphics_stages) {
            self.upload_push_constants()?;
            self.state.push_constants.dirty_stages &= !graphics_stages;
            self.state.dirty |= DirtyFlags::GFX_DESC_SETS;
        }

        let dirty = self.state.dirty;
        let descriptors_dirty = dirty.intersects(DirtyFlags::GFX_PIPELINE | DirtyFlags::GFX_DESC_SETS);
        let descriptor_table = if descriptors_dirty {
            self.upload_descriptor_table(false)?
        } else {
            DevAddr::INVALID
        };

        if dirty.intersects(VERTEX_STATE_DIRTY) {
            self.emit_vertex_state(gfx, pipeline, descriptor_table)?;
        }

        if descriptors_dirty {
            let push_constants = self.state.push_constants.uploaded.unwrap_or(DevAddr::INVALID);
            let data = patch_descriptor_data(
                &pipeline.fragment_pds_data,
                &pipeline.fragment_descriptors,
                descriptor_table,
                push_constants,
            );
            let data_addr = self.upload(Heap::Pds, &data)?;
            let pds = &mut self.state.ppp.pds;
            pds.pixel_shader_base = pipeline.fragment_pds.code_addr().lo();
            pds.texture_uniform_code_base = 0;
            pds.size_info1 = div_ceil32(data.len() as u32 * 4, hw::PDS_DATA_SIZE_UNIT_SIZE)
                | (div_ceil32(pipeline.fragment_coeff_size * 4, 64) << 16);
            pds.size_info2 = div_ceil32(pipeline.fragment_shader.temps * 4, hw::USC_UNIFIED_SIZE_UNIT_SIZE);
            pds.uniform_state_data_base = data_addr.lo();
            self.state.emit_header |= StateHeader::PRES_PDS_STATE_PTR0 | StateHeader::PRES_PDS_STATE_PTR3;
        }

        self.emit_ppp_state(gfx)
    }

    pub(crate) fn upload_push_constants(&mut self) -> Result<DevAddr> {
        if let Some(addr) = self.state.push_constants.uploaded {
            return Ok(addr);
        }
        let data = self.state.push_constants.data;
        let addr = self.upload(Heap::General, &data)?;
        self.state.push_constants.uploaded = Some(addr);
        Ok(addr)
    }

    /// Uploads the table of bound descriptor set addresses, followed by the addresses of the
    /// dynamic buffers with their offsets applied.
    pub(crate) fn upload_descriptor_table(&mut self, compute: bool) -> Result<DevAddr> {
        let desc: &DescriptorState = if compute {
            &self.state.compute_desc
        } else {
            &self.state.gfx_desc
        };
        let mut words = Vec::with_capacity(MAX_DESCRIPTOR_SETS * 2);
        for (index, set) in desc.sets.iter().enumerate() {
            let addr = match set {
                Some(set) if desc.valid.contains(index) => set.addr(),
                _ => DevAddr::INVALID,
            };
            words.push(addr.lo());
            words.push(addr.hi());
        }
        for (index, set) in desc.sets.iter().enumerate() {
            if let Some(set) = set {
                for (buffer, offset) in set.dynamic_buffers().iter().zip(desc.dynamic_offsets[index].iter()) {
                    let addr = buffer.offset(*offset as u64);
                    words.push(addr.lo());
                    words.push(addr.hi());
                }
            }
        }
        self.upload(Heap::General, &words)
    }

    fn emit_vertex_state(
        &mut self,
        gfx: &mut GraphicsSubCmd,
        pipeline: &GraphicsPipeline,
        descriptor_table: DevAddr,
    ) -> Result<()> {
        let mut data = if descriptor_table.is_valid() {
            let push_constants = self.state.push_constants.uploaded.unwrap_or(DevAddr::INVALID);
            patch_descriptor_data(
                &pipeline.vertex_pds_data,
                &pipeline.vertex_descriptors,
                descriptor_table,
                push_constants,
            )
        } else {
            pipeline.vertex_pds_data.clone()
        };
        for attribute in pipeline.vertex_attributes.iter() {
            let buffer = self.state.vertex_buffers[attribute.binding as usize];
            patch_addr(&mut data, attribute.data_offset_dw, buffer.offset(attribute.offset as u64));
        }
        let data_addr = self.upload(Heap::Pds, &data)?;
        self.state.vertex_pds_data = data_addr;

        let data_size = div_ceil32(data.len() as u32 * 4, hw::PDS_DATA_SIZE_UNIT_SIZE);
        let mut words = vdm::pds_state(
            data_addr,
            pipeline.vertex_pds.code_addr(),
            data_size,
            div_ceil32(pipeline.vertex_pds.temps * 4, hw::PDS_TEMP_SIZE_UNIT_SIZE),
        )
        .to_vec();
        words.extend_from_slice(&vdm::vdm_state(&vdm::VdmState {
            cam_size: (pipeline.vs_output_count + 1).min(0x7f),
            vs_max_instances: 0,
            vs_data_addr: data_addr,
            vs_code_addr: pipeline.vertex_shader.code_addr(),
            vs_data_size: data_size,
            vs_usc_temps: pipeline.vertex_shader.temps,
            cut_index: None,
            flatshade_vertex: 0,
        }));
        gfx.csb.set_relocation_mark();
        gfx.csb.emit(&words)?;
        gfx.csb.clear_relocation_mark();
        Ok(())
    }

    //----------------------------------------------------------------------------------------------

    /// Computes the ISP control and face words, flagging the groups that changed.
    fn setup_isp_state(&mut self, pipeline: &GraphicsPipeline, full: bool) {
        let dynamic = &self.state.dynamic;
        let bpres = pipeline.stencil_test;
        let two_sided = bpres && dynamic.stencil_front != dynamic.stencil_back;
        let depth_compare = if pipeline.depth_test {
            compare_mode(pipeline.depth_compare)
        } else {
            ta::DCMPMODE_ALWAYS
        };
        let objtype = object_type(pipeline.topology);
        let line_width = line_width_fixed(dynamic.line_width);
        let depth_write = pipeline.depth_test && pipeline.depth_write;

        let ispctl = ta::ispctl(
            self.state.render_pass_info.isp_userpass,
            self.state.vis_test_enabled,
            self.state.vis_reg,
            two_sided,
            bpres,
        );
        let front_a = ta::ispa(
            depth_compare,
            depth_write,
            line_width,
            dynamic.stencil_front.reference,
            objtype,
        );
        let front_b = ta::ispb(dynamic.stencil_front.compare_mask, dynamic.stencil_front.write_mask);
        let back_a = ta::ispa(depth_compare, depth_write, line_width, dynamic.stencil_back.reference, objtype);
        let back_b = ta::ispb(dynamic.stencil_back.compare_mask, dynamic.stencil_back.write_mask);

        let ppp = &mut self.state.ppp;
        let mut header = StateHeader::empty();
        if ispctl != ppp.ispctl || front_a != ppp.front_a {
            header |= StateHeader::PRES_ISPCTL | StateHeader::PRES_ISPCTL_FA;
        }
        if bpres && front_b != ppp.front_b {
            header |= StateHeader::PRES_ISPCTL | StateHeader::PRES_ISPCTL_FA | StateHeader::PRES_ISPCTL_FB;
        }
        if two_sided && (back_a != ppp.back_a || back_b != ppp.back_b) {
            header |= StateHeader::PRES_ISPCTL | StateHeader::PRES_ISPCTL_FA | StateHeader::PRES_ISPCTL_BA;
            if bpres {
                header |= StateHeader::PRES_ISPCTL_BB;
            }
        }
        ppp.ispctl = ispctl;
        ppp.front_a = front_a;
        ppp.front_b = front_b;
        ppp.back_a = back_a;
        ppp.back_b = back_b;

        if full {
            let output_selects = ta::outselects(pipeline.vs_output_count, pipeline.has_point_size, false);
            if output_selects != ppp.output_selects {
                ppp.output_selects = output_selects;
                header |= StateHeader::PRES_OUTSELECTS;
            }
            let varying_word0 = ta::varying_word0(pipeline.vs_output_count.saturating_sub(1), 0);
            if varying_word0 != ppp.varying_word0 {
                ppp.varying_word0 = varying_word0;
                header |= StateHeader::PRES_VARYING_WORD0;
            }
        }
        self.state.emit_header |= header;
    }

    /// Records depth bias and scissor table entries for the next draw.
    fn setup_depth_bias_scissor(&mut self, pipeline: &GraphicsPipeline) {
        let dirty = self.state.dirty;
        let dbenable = pipeline.depth_bias.is_some();
        self.state.ppp.dbenable = dbenable;
        if dbenable && (dirty.contains(DirtyFlags::DEPTH_BIAS) || self.depth_bias_array.is_empty()) {
            let bias = self.state.dynamic.depth_bias;
            self.state.ppp.depthbias_index = self.depth_bias_array.len() as u32;
            self.depth_bias_array
                .push([fui(bias.constant_factor), fui(bias.slope_factor), fui(bias.clamp)]);
            self.state.emit_header |= StateHeader::PRES_ISPCTL_DBSC;
        }

        let scissor = match self.state.dynamic.scissors.first() {
            Some(scissor) => *scissor,
            None => {
                self.state.ppp.scenable = false;
                return;
            }
        };
        self.state.ppp.scenable = true;
        let words = scissor_words(&scissor);

        let info = self.device.info();
        let x = scissor.offset.x.max(0) as u32;
        let y = scissor.offset.y.max(0) as u32;
        let left = x / info.tile_size_x;
        let top = y / info.tile_size_y;
        let right = div_ceil32(x + scissor.extent.width, info.tile_size_x).max(1) - 1;
        let bottom = div_ceil32(y + scissor.extent.height, info.tile_size_y).max(1) - 1;
        let region_clip = ta::region_clip(left, right, top, bottom);
        if self.state.ppp.region_clip != region_clip {
            self.state.ppp.region_clip = region_clip;
            self.state.emit_header |= StateHeader::PRES_REGION_CLIP;
        }

        // the last entry may also have been appended by an executed secondary
        let pushed = self.scissor_array.last() != Some(&words);
        if pushed {
            self.scissor_array.push(words);
        }
        let index = self.scissor_array.len() as u32 - 1;
        if pushed || self.state.ppp.scissor_index != index {
            self.state.ppp.scissor_index = index;
            self.state.emit_header |= StateHeader::PRES_ISPCTL_DBSC;
        }
    }

    fn setup_viewports(&mut self, pipeline: &GraphicsPipeline) {
        let dirty = self.state.dirty;
        let ppp = &mut self.state.ppp;
        if dirty.contains(DirtyFlags::VIEWPORT) {
            let viewports = &self.state.dynamic.viewports;
            for (i, vp) in viewports.iter().enumerate() {
                let half_w = vp.width * 0.5;
                let half_h = vp.height * 0.5;
                ppp.viewports[i] = [
                    fui(vp.x + half_w),
                    fui(half_w),
                    fui(vp.y + half_h),
                    fui(half_h),
                    fui(vp.min_depth),
                    fui(vp.max_depth - vp.min_depth),
                ];
            }
            ppp.viewport_count = viewports.len().max(1) as u32;
            self.state.emit_header |= StateHeader::PRES_VIEWPORT;
        }

        let cull = pipeline.cull_mode.as_raw() & 0x3;
        let ppp_control = ta::ppp_ctrl(
            cull,
            pipeline.front_face == vk::FrontFace::COUNTER_CLOCKWISE,
            true,
            true,
            0,
        );
        if ppp_control != ppp.ppp_control {
            ppp.ppp_control = ppp_control;
            self.state.emit_header |= StateHeader::PRES_PPP_CTRL;
        }

        // everything is culled: move the geometry outside of the clip volume
        if pipeline.cull_mode == vk::CullModeFlags::FRONT_AND_BACK {
            let outside = fui(-2.0);
            ppp.viewports[0] = [outside, 0, outside, 0, outside, 0];
            ppp.viewport_count = 1;
            self.state.emit_header |= StateHeader::PRES_VIEWPORT;
        }
    }

    /// Sends the TA state groups that changed since the last update.
    pub(crate) fn emit_ppp_state(&mut self, gfx: &mut GraphicsSubCmd) -> Result<()> {
        let pipeline = match self.state.gfx_pipeline.clone() {
            Some(pipeline) => pipeline,
            None => return Ok(()),
        };
        let dirty = self.state.dirty;
        if self.state.emit_header.is_empty() && !dirty.intersects(PPP_STATE_DIRTY) {
            return Ok(());
        }

        let full = dirty.contains(DirtyFlags::GFX_PIPELINE);
        if full
            || dirty.intersects(
                DirtyFlags::STENCIL | DirtyFlags::LINE_WIDTH | DirtyFlags::ISP_USERPASS | DirtyFlags::VIS_TEST,
            )
            || self.state.emit_header.contains(StateHeader::PRES_ISPCTL)
        {
            self.setup_isp_state(&pipeline, full);
        }
        self.setup_depth_bias_scissor(&pipeline);
        self.setup_viewports(&pipeline);

        let mut header = self.state.emit_header;
        if header.contains(StateHeader::PRES_REGION_CLIP) && !self.state.ppp.scenable {
            // no scissor: clip to the framebuffer
            let info = self.device.info();
            let (width, height) = match gfx.framebuffer {
                Some(ref fb) => (fb.width(), fb.height()),
                None => (hw::MAX_FRAMEBUFFER_SIZE, hw::MAX_FRAMEBUFFER_SIZE),
            };
            self.state.ppp.region_clip = ta::region_clip(
                0,
                div_ceil32(width, info.tile_size_x).max(1) - 1,
                0,
                div_ceil32(height, info.tile_size_y).max(1) - 1,
            );
        }
        if header.contains(StateHeader::PRES_ISPCTL) {
            header |= StateHeader::PRES_ISPCTL_FA;
        }
        if header.is_empty() {
            return Ok(());
        }

        let is_secondary = self.is_secondary();
        let deferred = gfx.csb.ty() == StreamType::GraphicsDeferred;
        let dbsc_present = header.contains(StateHeader::PRES_ISPCTL_DBSC);
        if dbsc_present && deferred {
            header.remove(StateHeader::PRES_ISPCTL_DBSC);
        }

        let ppp = &self.state.ppp;
        let mut words = Vec::with_capacity(64);
        words.push(ta::header(header, ppp.viewport_count));
        if header.contains(StateHeader::PRES_ISPCTL) {
            words.push(ppp.ispctl);
            words.push(ppp.front_a);
            if header.contains(StateHeader::PRES_ISPCTL_FB) {
                words.push(ppp.front_b);
            }
            if header.contains(StateHeader::PRES_ISPCTL_BA) {
                words.push(ppp.back_a);
            }
            if header.contains(StateHeader::PRES_ISPCTL_BB) {
                words.push(ppp.back_b);
            }
        }
        let mut dbsc_patching_offset = None;
        if header.contains(StateHeader::PRES_ISPCTL_DBSC) {
            dbsc_patching_offset = Some(words.len() as u32);
            words.push(ta::ispdbsc(ppp.depthbias_index, ppp.scissor_index));
        }
        if header.contains(StateHeader::PRES_PDS_STATE_PTR0) {
            words.extend_from_slice(&[
                ppp.pds.pixel_shader_base,
                ppp.pds.texture_uniform_code_base,
                ppp.pds.size_info1,
                ppp.pds.size_info2,
            ]);
        }
        if header.contains(StateHeader::PRES_PDS_STATE_PTR3) {
            words.push(ppp.pds.uniform_state_data_base);
        }
        if header.contains(StateHeader::PRES_REGION_CLIP) {
            words.extend_from_slice(&ppp.region_clip);
        }
        if header.contains(StateHeader::PRES_VIEWPORT) {
            for vp in ppp.viewports[..ppp.viewport_count as usize].iter() {
                words.extend_from_slice(vp);
            }
        }
        if header.contains(StateHeader::PRES_WCLAMP) {
            words.push(fui(0.00001));
        }
        if header.contains(StateHeader::PRES_OUTSELECTS) {
            words.push(ppp.output_selects);
        }
        if header.contains(StateHeader::PRES_VARYING_WORD0) {
            words.push(ppp.varying_word0);
        }
        if header.contains(StateHeader::PRES_VARYING_WORD1) {
            words.push(0);
        }
        if header.contains(StateHeader::PRES_VARYING_WORD2) {
            words.push(0);
        }
        if header.contains(StateHeader::PRES_PPP_CTRL) {
            words.push(ppp.ppp_control);
        }
        if header.contains(StateHeader::PRES_STREAM_OUT_SIZE) {
            words.push(0);
        }
        let depthbias_index = ppp.depthbias_index;
        let scissor_index = ppp.scissor_index;

        let bo = self.upload_bo(Heap::General, &words)?;
        gfx.csb.set_relocation_mark();
        gfx.csb.emit(&vdm::ppp_state(bo.addr(), words.len() as u32))?;
        gfx.csb.clear_relocation_mark();
        trace!(?header, words = words.len(), "TA state update");

        match (is_secondary && dbsc_present, deferred, dbsc_patching_offset) {
            (true, true, _) => {
                // the table bases are only known when the secondary is executed
                gfx.csb.set_relocation_mark();
                let slot = gfx.csb.alloc_words(vdm::LINK_WORDS)?;
                gfx.csb.clear_relocation_mark();
                gfx.patches.push(DeferredPatch::Dbsc {
                    depthbias_index,
                    scissor_index,
                    slot,
                });
                self.keep_bo(bo);
            }
            (true, false, Some(offset_dw)) => {
                gfx.patches.push(DeferredPatch::Dbsc2 {
                    depthbias_index,
                    scissor_index,
                    bo: Arc::new(bo),
                    offset_dw,
                });
            }
            _ => self.keep_bo(bo),
        }

        self.state.emit_header = StateHeader::empty();
        Ok(())
    }
}
