//! Render pass recording and graphics job setup.
use crate::{
    cmd_buffer::{state::DirtyFlags, CommandBuffer, GraphicsSubCmd, SubCmdType},
    csb::{ControlStream, StreamType},
    hw::{
        self, pbe, pds,
        ta::{self, StateHeader},
        vdm, ISP_UPASS_START_SIZE_MAX,
    },
    job::{DepthStencilJobInfo, RenderJob},
    memory::{DevAddr, Heap},
    pass::{Framebuffer, HwRender, LoadOp, MrtResource, RenderPass},
    program::{EotProgramInfo, PbeEmit},
    util::{div_ceil32, format_bits_per_pixel, format_has_depth, format_has_stencil},
    vk, Result,
};
use std::sync::Arc;
use tracing::{debug, trace, trace_span};

/// Clear value of an attachment.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ClearValue {
    /// Clear color, as raw bits in the attachment's format.
    Color([u32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0; 4])
    }
}

#[derive(Clone, Debug)]
pub struct RenderPassBeginInfo {
    pub render_pass: Arc<RenderPass>,
    pub framebuffer: Arc<Framebuffer>,
    pub render_area: vk::Rect2D,
    /// Indexed by attachment.
    pub clear_values: Vec<ClearValue>,
}

/// Texture state words per attachment in the constants of a load op.
const LOAD_OP_CONST_WORDS: usize = 4;

/// Constants read by a load op program: clear colors for cleared attachments, surface state for
/// loaded ones.
fn load_op_consts(load_op: &LoadOp, fb: Option<&Framebuffer>, clear_values: &[ClearValue]) -> Vec<u32> {
    let mut consts = Vec::with_capacity(load_op.attachments.len() * LOAD_OP_CONST_WORDS);
    for (i, &attachment) in load_op.attachments.iter().enumerate() {
        if load_op.clear_mask & (1 << i) != 0 {
            match clear_values.get(attachment).copied().unwrap_or_default() {
                ClearValue::Color(color) => consts.extend_from_slice(&color),
                ClearValue::DepthStencil { depth, stencil } => {
                    consts.extend_from_slice(&[depth.to_bits(), stencil, 0, 0])
                }
            }
        } else if load_op.load_mask & (1 << i) != 0 {
            match fb.and_then(|fb| fb.attachments().get(attachment)) {
                Some(view) => consts.extend_from_slice(&[
                    view.addr().lo(),
                    view.addr().hi(),
                    view.stride(),
                    format_bits_per_pixel(view.format()),
                ]),
                None => consts.extend_from_slice(&[0; LOAD_OP_CONST_WORDS]),
            }
        } else {
            consts.extend_from_slice(&[0; LOAD_OP_CONST_WORDS]);
        }
    }
    consts
}

/// Whether the render area covers whole tiles, so that untouched tiles can keep their contents
/// in memory.
fn is_render_area_tile_aligned(tile_size: (u32, u32), fb: &Framebuffer, area: &vk::Rect2D) -> bool {
    let (tile_x, tile_y) = tile_size;
    let x = area.offset.x.max(0) as u32;
    let y = area.offset.y.max(0) as u32;
    let right = x + area.extent.width;
    let bottom = y + area.extent.height;
    x % tile_x == 0
        && y % tile_y == 0
        && (right % tile_x == 0 || right >= fb.width())
        && (bottom % tile_y == 0 || bottom >= fb.height())
}

impl CommandBuffer {
    /// Begins a render pass instance.
    pub fn begin_render_pass(&mut self, begin_info: &RenderPassBeginInfo) -> Result<()> {
        let _span = trace_span!("begin_render_pass").entered();
        debug_assert!(!self.is_secondary(), "secondaries inherit their render pass");
        self.record(|cb| cb.begin_render_pass_internal(begin_info))
    }

    fn begin_render_pass_internal(&mut self, begin_info: &RenderPassBeginInfo) -> Result<()> {
        let pass = begin_info.render_pass.clone();
        let fb = begin_info.framebuffer.clone();
        debug_assert!(Arc::ptr_eq(fb.render_pass(), &pass) || fb.attachments().len() == pass.attachments().len());

        {
            let info = &mut self.state.render_pass_info;
            info.pass = Some(pass.clone());
            info.framebuffer = Some(fb.clone());
            info.subpass_idx = 0;
            info.render_area = begin_info.render_area;
            info.current_hw_render = pass.hw_render_for_subpass(0).0;
            info.isp_userpass = pass.subpasses()[0].isp_userpass;
            info.clear_values = begin_info.clear_values.clone();
        }
        self.state.dirty |= DirtyFlags::ISP_USERPASS;

        for render in pass.hw_setup().renders() {
            fb.render_target(&self.device, render.sample_count)?;
        }

        self.start_sub_cmd(SubCmdType::Graphics)?;
        let (_, hw_render) = pass.hw_render_for_subpass(0);
        self.set_background_flags(hw_render);

        let hw_subpass = pass.hw_setup().subpass_map()[0];
        if let Some(ref load_op) = hw_render.subpasses[hw_subpass.subpass].load_op {
            let upass = pass.subpasses()[0].isp_userpass;
            self.with_current_gfx(|cb, gfx| cb.emit_load_op_obj(gfx, load_op, upass))?;
        }
        debug!(
            renders = pass.hw_setup().renders().len(),
            width = fb.width(),
            height = fb.height(),
            "render pass begun"
        );
        Ok(())
    }

    fn set_background_flags(&mut self, hw_render: &HwRender) {
        let info = &mut self.state.render_pass_info;
        info.enable_bg_tag = !hw_render.color_init.is_empty();
        info.process_empty_tiles = hw_render.has_clear();
    }

    /// Moves to the next subpass.
    pub fn next_subpass(&mut self) -> Result<()> {
        let _span = trace_span!("next_subpass").entered();
        self.record(|cb| cb.next_subpass_internal())
    }

    fn next_subpass_internal(&mut self) -> Result<()> {
        let pass = match self.state.render_pass_info.pass.clone() {
            Some(pass) => pass,
            None => {
                debug_assert!(false, "next_subpass outside of a render pass");
                return Ok(());
            }
        };
        let next = self.state.render_pass_info.subpass_idx + 1;
        debug_assert!(next < pass.subpasses().len());
        let mapping = pass.hw_setup().subpass_map()[next];
        let hw_render = &pass.hw_setup().renders()[mapping.render];

        if mapping.render != self.state.render_pass_info.current_hw_render {
            self.end_sub_cmd()?;
            self.state.render_pass_info.current_hw_render = mapping.render;
            self.start_sub_cmd(SubCmdType::Graphics)?;
            self.set_background_flags(hw_render);
            self.state.render_pass_info.isp_userpass = 0;
            trace!(render = mapping.render, "next hardware render");
        }

        let upass = pass.subpasses()[next].isp_userpass;
        let load_op = hw_render.subpasses[mapping.subpass].load_op.as_ref();
        if let Some(load_op) = load_op {
            self.with_current_gfx(|cb, gfx| cb.emit_load_op_obj(gfx, load_op, upass))?;
        }

        self.state.gfx_pipeline = None;

        // the user pass field wraps; a full-screen object resets the tags
        if upass == ISP_UPASS_START_SIZE_MAX && load_op.is_none() {
            self.with_current_gfx(|cb, gfx| cb.insert_transparent_obj(gfx))?;
        }

        let info = &mut self.state.render_pass_info;
        info.subpass_idx = next;
        info.isp_userpass = upass;
        self.state.dirty |= DirtyFlags::ISP_USERPASS;
        Ok(())
    }

    /// Ends the render pass instance.
    pub fn end_render_pass(&mut self) -> Result<()> {
        let _span = trace_span!("end_render_pass").entered();
        self.record(|cb| {
            cb.end_sub_cmd()?;
            cb.state.render_pass_info = Default::default();
            cb.state.gfx_pipeline = None;
            Ok(())
        })
    }

    //----------------------------------------------------------------------------------------------

    /// Emits a full-screen object with the given ISP state and PDS program words.
    fn emit_fullscreen_obj(&mut self, gfx: &mut GraphicsSubCmd, pres: StateHeader, words: &[u32]) -> Result<()> {
        let mut ppp = Vec::with_capacity(words.len() + 1);
        ppp.push(ta::header(pres, 1));
        ppp.extend_from_slice(words);
        let addr = self.upload(Heap::General, &ppp)?;

        let mut vdm_words = vdm::ppp_state(addr, ppp.len() as u32).to_vec();
        vdm_words.extend_from_slice(&self.device.clear_vdm_words);
        gfx.csb.set_relocation_mark();
        gfx.csb.emit(&vdm_words)?;
        gfx.csb.clear_relocation_mark();

        self.state.reset_graphics_dirty_state(false);
        Ok(())
    }

    /// Emits a full-screen object that draws nothing but resets the ISP user pass tags.
    pub(crate) fn insert_transparent_obj(&mut self, gfx: &mut GraphicsSubCmd) -> Result<()> {
        let nop = &self.device.helpers.nop;
        let words = [
            ta::ispctl(self.state.render_pass_info.isp_userpass, false, 0, false, false),
            ta::ispa(ta::DCMPMODE_ALWAYS, false, 0, 0, ta::OBJTYPE_TRIANGLE),
            nop.code_addr().lo(),
            0,
            div_ceil32(nop.data_size_dw * 4, hw::PDS_DATA_SIZE_UNIT_SIZE),
            div_ceil32(nop.temps * 4, hw::PDS_TEMP_SIZE_UNIT_SIZE),
        ];
        trace!("transparent object");
        self.emit_fullscreen_obj(
            gfx,
            StateHeader::PRES_ISPCTL | StateHeader::PRES_ISPCTL_FA | StateHeader::PRES_PDS_STATE_PTR0,
            &words,
        )
    }

    /// Emits a full-screen object applying `load_op` to the subpass with user pass `upass`.
    fn emit_load_op_obj(&mut self, gfx: &mut GraphicsSubCmd, load_op: &LoadOp, upass: u32) -> Result<()> {
        let consts = load_op_consts(
            load_op,
            gfx.framebuffer.as_deref(),
            &self.state.render_pass_info.clear_values,
        );
        let consts_addr = self.upload(Heap::General, &consts)?;
        let program =
            self.device
                .programs()
                .background_pds_program(load_op.program.code_addr(), consts_addr, consts.len() as u32)?;
        let bg = self.upload_program(Heap::Pds, &program)?;
        let words = [
            ta::ispctl(upass, false, 0, false, false),
            ta::ispa(ta::DCMPMODE_ALWAYS, false, 0, 0, ta::OBJTYPE_TRIANGLE),
            bg.code_addr().lo(),
            0,
            div_ceil32(bg.data_size_dw * 4, hw::PDS_DATA_SIZE_UNIT_SIZE),
            div_ceil32(bg.temps * 4, hw::PDS_TEMP_SIZE_UNIT_SIZE),
            bg.data_addr().lo(),
        ];
        trace!(upass, clear_mask = load_op.clear_mask, load_mask = load_op.load_mask, "load op object");
        self.emit_fullscreen_obj(
            gfx,
            StateHeader::PRES_ISPCTL
                | StateHeader::PRES_ISPCTL_FA
                | StateHeader::PRES_PDS_STATE_PTR0
                | StateHeader::PRES_PDS_STATE_PTR3,
            &words,
        )
    }

    //----------------------------------------------------------------------------------------------

    /// Closes the control stream of a primary's graphics sub-command and builds its job.
    pub(crate) fn finish_graphics(&mut self, gfx: &mut GraphicsSubCmd) -> Result<()> {
        self.upload_tables(gfx)?;
        self.emit_framebuffer_ppp_state(gfx)?;
        gfx.csb.emit_terminate()?;
        self.gfx_job_init(gfx)?;

        let layers = gfx.framebuffer.as_ref().map(|fb| fb.layers()).unwrap_or(1);
        if layers > 1 {
            let mut terminate = ControlStream::new(&self.device, StreamType::Graphics);
            terminate.emit_terminate()?;
            gfx.terminate_stream = Some(terminate);
        }
        Ok(())
    }

    fn upload_tables(&mut self, gfx: &mut GraphicsSubCmd) -> Result<()> {
        if !self.depth_bias_array.is_empty() {
            let words: Vec<u32> = self.depth_bias_array.iter().flatten().copied().collect();
            gfx.depth_bias_table = Some(self.upload_bo(Heap::General, &words)?);
        }
        if !self.scissor_array.is_empty() {
            let words: Vec<u32> = self.scissor_array.iter().flatten().copied().collect();
            gfx.scissor_table = Some(self.upload_bo(Heap::General, &words)?);
        }
        Ok(())
    }

    /// Final state block clipping the render to the framebuffer.
    fn emit_framebuffer_ppp_state(&mut self, gfx: &mut GraphicsSubCmd) -> Result<()> {
        let fb = match gfx.framebuffer {
            Some(ref fb) => fb.clone(),
            None => return Ok(()),
        };
        let info = self.device.info();
        let clip_right = div_ceil32(fb.width(), info.tile_size_x).max(1) - 1;
        let clip_bottom = div_ceil32(fb.height(), info.tile_size_y).max(1) - 1;
        let mut words = vec![ta::header(StateHeader::PRES_TERMINATE, 0)];
        words.extend_from_slice(&ta::terminate(clip_right, clip_bottom, 0));
        let addr = self.upload(Heap::General, &words)?;
        gfx.csb.set_relocation_mark();
        gfx.csb.emit(&vdm::ppp_state(addr, words.len() as u32))?;
        gfx.csb.clear_relocation_mark();
        Ok(())
    }

    fn gfx_job_init(&mut self, gfx: &mut GraphicsSubCmd) -> Result<()> {
        let fb = match gfx.framebuffer.clone() {
            Some(fb) => fb,
            None => {
                debug_assert!(false, "graphics sub-command without a framebuffer");
                return Ok(());
            }
        };
        let pass = fb.render_pass().clone();
        let hw_render = &pass.hw_setup().renders()[gfx.hw_render_idx];
        let spm_eot = fb.spm_eot_state(gfx.hw_render_idx);
        let spm_bgobj = fb.spm_bgobj_state(gfx.hw_render_idx);

        // end of render
        let (pbe_state_words, pbe_reg_words, pds_pixel_event_data) = if gfx.barrier_store {
            (
                spm_eot.pbe_state_words().to_vec(),
                spm_eot.pbe_reg_words().to_vec(),
                spm_eot.pixel_event_data_addr(),
            )
        } else {
            let mut emits = Vec::with_capacity(hw_render.eot_surfaces.len());
            let mut reg_words = Vec::with_capacity(hw_render.eot_surfaces.len());
            for surface in hw_render.eot_surfaces.iter() {
                let view = &fb.attachments()[surface.attachment];
                let (source_start, tile_buffer) = match surface.mrt {
                    MrtResource::OutputReg { offset } => (offset, None),
                    MrtResource::TileBuffer { index, offset } => (offset, Some(index)),
                };
                let dwords = div_ceil32(format_bits_per_pixel(view.format()), 32);
                emits.push(PbeEmit {
                    state_words: pbe::state_words(view.addr(), dwords, source_start),
                    source_start,
                    tile_buffer,
                });
                reg_words.push(pbe::reg_words(view.stride(), fb.width(), fb.height(), view.samples(), false));
            }
            let eot = self.device.programs().eot_program(&EotProgramInfo {
                emits: &emits,
                for_spm: false,
            })?;
            let eot_addr = self.upload_program(Heap::Usc, &eot)?.code_addr();
            let pixel_event = self.device.programs().pixel_event_program(eot_addr)?;
            let pixel_event_data = self.upload_program(Heap::Pds, &pixel_event)?.data_addr();
            (
                emits.iter().map(|e| e.state_words).collect(),
                reg_words,
                pixel_event_data,
            )
        };

        // background object
        let enable_bg_tag = self.state.render_pass_info.enable_bg_tag;
        let process_empty_tiles = self.state.render_pass_info.process_empty_tiles;
        let (pds_bgnd_reg_values, enable_bg_tag, process_empty_tiles) = if gfx.barrier_load {
            (spm_bgobj.pds_reg_values(), true, true)
        } else if let Some(ref load_op) = hw_render.load_op {
            let consts = load_op_consts(load_op, Some(&fb), &self.state.render_pass_info.clear_values);
            let consts_addr = self.upload(Heap::General, &consts)?;
            let program = self.device.programs().background_pds_program(
                load_op.program.code_addr(),
                consts_addr,
                consts.len() as u32,
            )?;
            let bg = self.upload_program(Heap::Pds, &program)?;
            let words = pds::bgnd_words(
                load_op.program.code_addr(),
                bg.data_addr(),
                bg.code_addr(),
                consts.len() as u32,
                div_ceil32(bg.data_size_dw * 4, hw::PDS_DATA_SIZE_UNIT_SIZE),
                div_ceil32(bg.temps * 4, hw::PDS_TEMP_SIZE_UNIT_SIZE),
            );
            (words, enable_bg_tag, process_empty_tiles)
        } else {
            ([0; hw::NUM_PDS_BGND_WORDS], enable_bg_tag, process_empty_tiles)
        };

        let ds = self.ds_job_info(gfx, &fb, hw_render);

        let samples = if let Some(ds_idx) = hw_render.ds_attachment {
            fb.attachments()[ds_idx].samples()
        } else if hw_render.output_regs_count > 0 {
            hw_render.sample_count
        } else if let Some(ref pipeline) = self.state.gfx_pipeline {
            pipeline.samples()
        } else {
            pass.max_sample_count().max(1)
        };

        let max_tiles_in_flight = if gfx.max_tiles_in_flight == self.device.info().isp_max_tiles_in_flight {
            0
        } else {
            gfx.max_tiles_in_flight
        };

        let job = RenderJob {
            rt_dataset: fb.render_target(&self.device, hw_render.sample_count)?,
            ctrl_stream_addr: gfx.csb.start_addr(),
            depth_bias_table_addr: gfx.depth_bias_table.as_ref().map(|t| t.addr()).unwrap_or(DevAddr::INVALID),
            scissor_table_addr: gfx.scissor_table.as_ref().map(|t| t.addr()).unwrap_or(DevAddr::INVALID),
            pbe_state_words,
            pbe_reg_words,
            pds_pixel_event_data,
            pr_pbe_state_words: spm_eot.pbe_state_words().to_vec(),
            pr_pbe_reg_words: spm_eot.pbe_reg_words().to_vec(),
            pr_pds_pixel_event_data: spm_eot.pixel_event_data_addr(),
            pds_bgnd_reg_values,
            pr_pds_bgnd_reg_values: spm_bgobj.pds_reg_values(),
            enable_bg_tag,
            process_empty_tiles,
            ds,
            samples,
            max_tiles_in_flight,
            max_shared_registers: self.state.max_shared_regs,
            disable_compute_overlap: gfx.disable_compute_overlap,
            requires_spm_scratch_buffer: true,
            get_vis_results: gfx.has_occlusion_query,
            run_frag: true,
            geometry_terminate: true,
        };
        trace!(
            ctrl_stream = ?job.ctrl_stream_addr,
            samples,
            barrier_store = gfx.barrier_store,
            barrier_load = gfx.barrier_load,
            "render job"
        );
        gfx.job = Some(job);
        Ok(())
    }

    fn ds_job_info(&self, gfx: &GraphicsSubCmd, fb: &Framebuffer, hw_render: &HwRender) -> DepthStencilJobInfo {
        let mut ds = DepthStencilJobInfo::default();
        let ds_idx = match hw_render.ds_attachment {
            Some(ds_idx) => ds_idx,
            None => return ds,
        };
        let view = &fb.attachments()[ds_idx];
        ds.addr = view.addr();
        ds.stride = view.stride();
        ds.has_depth = format_has_depth(view.format());
        ds.has_stencil = format_has_stencil(view.format());

        let info = self.device.info();
        let aligned = is_render_area_tile_aligned(
            (info.tile_size_x, info.tile_size_y),
            fb,
            &self.state.render_pass_info.render_area,
        );

        ds.depth_load = ds.has_depth && (hw_render.depth_init == vk::AttachmentLoadOp::LOAD || gfx.barrier_load);
        ds.stencil_load =
            ds.has_stencil && (hw_render.stencil_init == vk::AttachmentLoadOp::LOAD || gfx.barrier_load);

        let mut d_store = hw_render.depth_store;
        if d_store && aligned && !gfx.modifies_depth && hw_render.depth_init != vk::AttachmentLoadOp::CLEAR {
            // memory already holds these values
            d_store = false;
        }
        let mut s_store = hw_render.stencil_store;
        if s_store && aligned && !gfx.modifies_stencil && hw_render.stencil_init != vk::AttachmentLoadOp::CLEAR {
            s_store = false;
        }
        d_store |= gfx.barrier_store;
        s_store |= gfx.barrier_store;
        ds.depth_store = ds.has_depth && d_store;
        ds.stencil_store = ds.has_stencil && s_store;

        // packed formats are stored as a whole
        if ds.has_depth && ds.has_stencil && (ds.depth_store || ds.stencil_store) {
            ds.depth_store = true;
            ds.stencil_store = true;
        }

        match self.state.render_pass_info.clear_values.get(ds_idx) {
            Some(ClearValue::DepthStencil { depth, stencil }) => {
                if hw_render.depth_init == vk::AttachmentLoadOp::CLEAR {
                    ds.clear_depth = *depth;
                }
                if hw_render.stencil_init == vk::AttachmentLoadOp::CLEAR {
                    ds.clear_stencil = *stencil;
                }
            }
            _ => {}
        }
        ds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cmd_buffer::{BeginInfo, SubCommand},
        pass::{AttachmentDescription, FramebufferCreateInfo, RenderPassCreateInfo, SubpassDescription},
        testing,
    };

    fn full_area(width: u32, height: u32) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        }
    }

    fn graphics(cb: &CommandBuffer) -> Vec<Arc<SubCommand>> {
        cb.sub_commands().filter(|s| s.as_graphics().is_some()).collect()
    }

    #[test]
    fn cleared_render_builds_job() {
        let device = testing::device();
        let pass = testing::single_color_pass(&device, vk::Format::R8G8B8A8_UNORM, 1);
        let fb = testing::framebuffer(&device, &pass, 128, 64, 1);

        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.begin_render_pass(&RenderPassBeginInfo {
            render_pass: pass.clone(),
            framebuffer: fb.clone(),
            render_area: full_area(128, 64),
            clear_values: vec![ClearValue::Color([0xff; 4])],
        })
        .unwrap();
        cb.end_render_pass().unwrap();
        cb.end().unwrap();

        let sub_cmds = graphics(&cb);
        assert_eq!(sub_cmds.len(), 1);
        let gfx = sub_cmds[0].as_graphics().unwrap();
        let job = gfx.job().unwrap();
        assert!(job.enable_bg_tag);
        assert!(job.process_empty_tiles);
        assert!(job.run_frag && job.geometry_terminate);
        assert!(job.requires_spm_scratch_buffer);
        assert_eq!(job.pbe_state_words.len(), 1);
        assert_eq!(job.pr_pbe_state_words.len(), fb.spm_eot_state(0).emit_count());
        assert_eq!(job.max_tiles_in_flight, 0);
        assert_eq!(job.samples, 1);
        assert!(!job.ds.has_depth);
        assert!(!job.depth_bias_table_addr.is_valid());
        assert_eq!(job.ctrl_stream_addr, gfx.control_stream().start_addr());
        assert!(gfx.terminate_stream().is_none());

        let words = gfx.control_stream().words();
        assert_eq!(vdm::block_type(*words.last().unwrap()), vdm::STREAM_TERMINATE);
    }

    #[test]
    fn layered_framebuffer_gets_terminate_stream() {
        let device = testing::device();
        let pass = testing::single_color_pass(&device, vk::Format::R8G8B8A8_UNORM, 1);
        let fb = testing::framebuffer(&device, &pass, 64, 64, 3);

        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.begin_render_pass(&RenderPassBeginInfo {
            render_pass: pass,
            framebuffer: fb,
            render_area: full_area(64, 64),
            clear_values: vec![ClearValue::default()],
        })
        .unwrap();
        cb.end_render_pass().unwrap();
        cb.end().unwrap();

        let sub_cmds = graphics(&cb);
        let terminate = sub_cmds[0].as_graphics().unwrap().terminate_stream().unwrap();
        assert_eq!(terminate.len_words(), 1);
    }

    #[test]
    fn render_change_opens_new_sub_command() {
        let device = testing::device();
        let ds = AttachmentDescription {
            format: vk::Format::D24_UNORM_S8_UINT,
            samples: 1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::CLEAR,
            stencil_store_op: vk::AttachmentStoreOp::STORE,
        };
        let pass = RenderPass::new(
            &device,
            &RenderPassCreateInfo {
                attachments: vec![AttachmentDescription::color(vk::Format::R8G8B8A8_UNORM, 1), ds],
                subpasses: vec![
                    SubpassDescription {
                        color_attachments: vec![0],
                        depth_stencil_attachment: Some(1),
                        ..Default::default()
                    },
                    SubpassDescription {
                        color_attachments: vec![0],
                        input_attachments: vec![1],
                        depth_stencil_attachment: Some(1),
                    },
                ],
            },
        )
        .unwrap();
        let fb = Framebuffer::new(
            &device,
            FramebufferCreateInfo {
                render_pass: pass.clone(),
                attachments: vec![
                    testing::image_view(&device, vk::Format::R8G8B8A8_UNORM, 64, 64),
                    testing::image_view(&device, vk::Format::D24_UNORM_S8_UINT, 64, 64),
                ],
                width: 64,
                height: 64,
                layers: 1,
            },
        )
        .unwrap();

        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.begin_render_pass(&RenderPassBeginInfo {
            render_pass: pass,
            framebuffer: fb,
            render_area: full_area(64, 64),
            clear_values: vec![
                ClearValue::default(),
                ClearValue::DepthStencil {
                    depth: 0.5,
                    stencil: 3,
                },
            ],
        })
        .unwrap();
        cb.next_subpass().unwrap();
        cb.end_render_pass().unwrap();
        cb.end().unwrap();

        let sub_cmds = graphics(&cb);
        assert_eq!(sub_cmds.len(), 2);
        let first = sub_cmds[0].as_graphics().unwrap().job().unwrap();
        assert_eq!(first.ds.clear_depth, 0.5);
        assert_eq!(first.ds.clear_stencil, 3);
        assert!(first.ds.stencil_store && first.ds.depth_store);
        let second = sub_cmds[1].as_graphics().unwrap();
        assert_eq!(second.hw_render_idx(), 1);
        assert!(second.job().unwrap().ds.stencil_load);
    }
}
