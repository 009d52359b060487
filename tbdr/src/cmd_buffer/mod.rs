//! Command buffer recording.
//!
//! A command buffer splits the recorded commands into [`SubCommand`]s. Exactly one sub-command is
//! open at a time; recording a command of another type closes it and opens a new one. Closing a
//! sub-command finalizes its control stream and, for primaries, fills in its job descriptor.
//!
//! Register state is only turned into hardware words right before the draw or dispatch that
//! needs it, and only for the groups that changed (see [`state::DirtyFlags`]).
//!
//! # Errors
//!
//! The first allocation failure is latched: the failing call returns the error, every later
//! recording call does nothing, and [`CommandBuffer::end`] returns the error again.
use crate::{
    csb::{ControlStream, StreamType},
    device::Device,
    memory::{Bo, DevAddr, Heap},
    pass::ImageView,
    program::UploadedProgram,
    query::Event,
    stage::PipelineStage,
    util::format_has_stencil,
    vk, Error, Result,
};
use slotmap::SlotMap;
use std::sync::Arc;
use tracing::{debug, trace, trace_span, warn};

mod compute;
mod draw;
mod query;
mod render_pass;
mod secondary;
mod state;
mod sub_cmd;
mod transfer;

pub use self::{
    compute::{compute_flat_pad_workgroup_size, compute_flat_slot_size},
    render_pass::{ClearValue, RenderPassBeginInfo},
    transfer::MAX_UPDATE_BUFFER_SIZE,
    sub_cmd::{
        ComputeSubCmd, DepthStencilUsage, EventSubCmd, GraphicsSubCmd, SubCmdId, SubCmdType, SubCommand,
        TransferOp, TransferSubCmd,
    },
};
pub(crate) use self::sub_cmd::{DeferredPatch, SubCmdHandle};
use self::state::CmdState;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Status {
    Initial,
    Recording,
    Executable,
}

/// Render pass state inherited by a secondary command buffer.
#[derive(Clone, Debug, Default)]
pub struct InheritanceInfo {
    pub render_pass: Option<Arc<crate::pass::RenderPass>>,
    pub subpass: usize,
    pub framebuffer: Option<Arc<crate::pass::Framebuffer>>,
    pub occlusion_query_enable: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BeginInfo {
    pub usage: vk::CommandBufferUsageFlags,
    pub inheritance: Option<InheritanceInfo>,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

#[derive(Clone, Debug)]
pub struct ImageBarrier {
    pub image: Arc<ImageView>,
    pub aspect_mask: vk::ImageAspectFlags,
}

/// Parameters of [`CommandBuffer::pipeline_barrier`].
#[derive(Clone, Debug, Default)]
pub struct DependencyInfo<'a> {
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub memory_barriers: &'a [MemoryBarrier],
    pub image_barriers: &'a [ImageBarrier],
}

/// A command buffer.
pub struct CommandBuffer {
    device: Arc<Device>,
    level: vk::CommandBufferLevel,
    usage: vk::CommandBufferUsageFlags,
    status: Status,
    error: Option<Error>,
    sub_cmds: SlotMap<SubCmdId, Arc<SubCommand>>,
    order: Vec<SubCmdHandle>,
    current: Option<SubCommand>,
    pub(crate) state: CmdState,
    bos: Vec<Bo>,
    programs: Vec<UploadedProgram>,
    /// Depth bias table entries (constant factor, slope factor, clamp), shared by every graphics
    /// sub-command.
    pub(crate) depth_bias_array: Vec<[u32; 3]>,
    /// Scissor table entries (x range, y range).
    pub(crate) scissor_array: Vec<[u32; 2]>,
}

impl CommandBuffer {
    pub fn new(device: &Arc<Device>, level: vk::CommandBufferLevel) -> CommandBuffer {
        CommandBuffer {
            device: device.clone(),
            level,
            usage: vk::CommandBufferUsageFlags::empty(),
            status: Status::Initial,
            error: None,
            sub_cmds: SlotMap::with_key(),
            order: Vec::new(),
            current: None,
            state: CmdState::new(),
            bos: Vec::new(),
            programs: Vec::new(),
            depth_bias_array: Vec::new(),
            scissor_array: Vec::new(),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn usage(&self) -> vk::CommandBufferUsageFlags {
        self.usage
    }

    pub(crate) fn is_secondary(&self) -> bool {
        self.level == vk::CommandBufferLevel::SECONDARY
    }

    /// Secondary continuing a render pass of its primary.
    pub(crate) fn is_render_pass_continue(&self) -> bool {
        self.is_secondary() && self.usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
    }

    /// Whether graphics sub-commands are recorded to host-side streams copied on execution.
    pub(crate) fn uses_deferred_streams(&self) -> bool {
        self.is_secondary()
            && self.usage.contains(
                vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE | vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
            )
    }

    /// The latched error, if recording failed.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// Number of device allocations the command buffer owns directly.
    pub fn allocation_count(&self) -> usize {
        self.bos.len() + self.programs.len()
    }

    /// Closed sub-commands, in execution order.
    pub fn sub_commands(&self) -> impl Iterator<Item = Arc<SubCommand>> + '_ {
        self.order.iter().filter_map(move |handle| match handle {
            SubCmdHandle::Owned(id) => self.sub_cmds.get(*id).cloned(),
            SubCmdHandle::Borrowed(sub_cmd) => {
                let sub_cmd = sub_cmd.upgrade();
                if sub_cmd.is_none() {
                    warn!("secondary command buffer was reset while still referenced by a primary");
                }
                sub_cmd
            }
        })
    }

    pub fn sub_command_count(&self) -> usize {
        self.order.len()
    }

    //----------------------------------------------------------------------------------------------

    pub fn begin(&mut self, begin_info: &BeginInfo) -> Result<()> {
        let _span = trace_span!("begin_command_buffer").entered();
        if self.status != Status::Initial {
            self.reset();
        }
        self.status = Status::Recording;
        self.usage = begin_info.usage;
        if !self.is_secondary() {
            self.usage &= !vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }

        if self.is_secondary() {
            if self.usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE) {
                let inheritance = begin_info.inheritance.clone().unwrap_or_default();
                debug_assert!(inheritance.render_pass.is_some(), "render pass continue without a render pass");
                if let Some(ref pass) = inheritance.render_pass {
                    let info = &mut self.state.render_pass_info;
                    info.subpass_idx = inheritance.subpass;
                    info.current_hw_render = pass.hw_render_for_subpass(inheritance.subpass).0;
                    info.isp_userpass = pass.subpasses()[inheritance.subpass].isp_userpass;
                    info.pass = Some(pass.clone());
                    info.framebuffer = inheritance.framebuffer.clone();
                }
                self.state.vis_test_enabled = inheritance.occlusion_query_enable;
                let result = self.start_sub_cmd(SubCmdType::Graphics);
                self.latch(result)?;
            }
            self.state.dirty |= state::DirtyFlags::ISP_USERPASS;
        }

        self.state.query_indices.clear();
        self.state.barriers_needed = [PipelineStage::ALL; crate::stage::NUM_SYNC_STAGES];
        Ok(())
    }

    /// Finishes recording. Returns the error latched during recording, if any.
    pub fn end(&mut self) -> Result<()> {
        let _span = trace_span!("end_command_buffer").entered();
        debug_assert_eq!(self.status, Status::Recording);
        if self.error.is_none() {
            let result = self.end_sub_cmd();
            // the error is reported below
            let _ = self.latch(result);
        }
        self.status = Status::Executable;
        match self.error {
            Some(err) => Err(err),
            None => {
                debug!(sub_cmds = self.order.len(), allocations = self.allocation_count(), "command buffer recorded");
                Ok(())
            }
        }
    }

    /// Discards everything recorded and every allocation made for it.
    pub fn reset(&mut self) {
        trace!(sub_cmds = self.order.len(), "command buffer reset");
        self.current = None;
        self.order.clear();
        self.sub_cmds.clear();
        self.bos.clear();
        self.programs.clear();
        self.depth_bias_array.clear();
        self.scissor_array.clear();
        self.state = CmdState::new();
        self.error = None;
        self.usage = vk::CommandBufferUsageFlags::empty();
        self.status = Status::Initial;
    }

    //----------------------------------------------------------------------------------------------

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = result {
            if self.error.is_none() {
                warn!(%err, "recording failed");
                self.error = Some(err);
            }
        }
        result
    }

    /// Runs a recording operation, latching its error. Does nothing once an error was latched.
    pub(crate) fn record(&mut self, f: impl FnOnce(&mut CommandBuffer) -> Result<()>) -> Result<()> {
        debug_assert_eq!(self.status, Status::Recording, "command buffer is not recording");
        if self.error.is_some() {
            return Ok(());
        }
        let result = f(self);
        self.latch(result)
    }

    /// Uploads words to a buffer owned by the command buffer.
    pub(crate) fn upload(&mut self, heap: Heap, words: &[u32]) -> Result<DevAddr> {
        let bo = self.device.upload(heap, words)?;
        let addr = bo.addr();
        self.bos.push(bo);
        Ok(addr)
    }

    /// Uploads words to a buffer the caller keeps (deferred patches write into it later).
    pub(crate) fn upload_bo(&self, heap: Heap, words: &[u32]) -> Result<Bo> {
        self.device.upload(heap, words)
    }

    pub(crate) fn keep_bo(&mut self, bo: Bo) {
        self.bos.push(bo);
    }

    pub(crate) fn upload_program(
        &mut self,
        heap: Heap,
        program: &crate::program::CompiledProgram,
    ) -> Result<&UploadedProgram> {
        let uploaded = self.device.upload_program(heap, program)?;
        self.programs.push(uploaded);
        let index = self.programs.len() - 1;
        Ok(&self.programs[index])
    }

    //----------------------------------------------------------------------------------------------

    pub(crate) fn current_type(&self) -> Option<SubCmdType> {
        self.current.as_ref().map(SubCommand::ty)
    }

    pub(crate) fn current_gfx_mut(&mut self) -> Option<&mut GraphicsSubCmd> {
        self.current.as_mut().and_then(SubCommand::as_graphics_mut)
    }

    /// Runs `f` on the open graphics sub-command, which is detached from the command buffer for
    /// the duration of the call.
    pub(crate) fn with_current_gfx<R>(
        &mut self,
        f: impl FnOnce(&mut CommandBuffer, &mut GraphicsSubCmd) -> Result<R>,
    ) -> Result<R> {
        let mut sub_cmd = match self.current.take() {
            Some(sub_cmd) => sub_cmd,
            None => unreachable!("no open sub-command"),
        };
        let result = match sub_cmd {
            SubCommand::Graphics(ref mut gfx) => f(self, gfx),
            _ => unreachable!("open sub-command is not a graphics sub-command"),
        };
        self.current = Some(sub_cmd);
        result
    }

    /// Same as [`CommandBuffer::with_current_gfx`] for compute and occlusion query sub-commands.
    pub(crate) fn with_current_compute<R>(
        &mut self,
        f: impl FnOnce(&mut CommandBuffer, &mut ComputeSubCmd) -> Result<R>,
    ) -> Result<R> {
        let mut sub_cmd = match self.current.take() {
            Some(sub_cmd) => sub_cmd,
            None => unreachable!("no open sub-command"),
        };
        let result = match sub_cmd.as_compute_mut() {
            Some(compute) => f(self, compute),
            None => unreachable!("open sub-command is not a compute sub-command"),
        };
        self.current = Some(sub_cmd);
        result
    }

    fn push_sub_cmd(&mut self, sub_cmd: SubCommand) {
        let id = self.sub_cmds.insert(Arc::new(sub_cmd));
        self.order.push(SubCmdHandle::Owned(id));
    }

    pub(crate) fn push_borrowed(&mut self, sub_cmd: &Arc<SubCommand>) {
        self.order.push(SubCmdHandle::Borrowed(Arc::downgrade(sub_cmd)));
    }

    /// Opens a sub-command of type `ty`, unless one is already open.
    pub(crate) fn start_sub_cmd(&mut self, ty: SubCmdType) -> Result<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.state.update_barriers(ty.barrier_stages());

        match self.current_type() {
            Some(current) if current == ty => return Ok(()),
            Some(_) => self.end_sub_cmd()?,
            None => {}
        }

        let sub_cmd = match ty {
            SubCmdType::Graphics => {
                let stream_type = if self.uses_deferred_streams() {
                    StreamType::GraphicsDeferred
                } else {
                    StreamType::Graphics
                };
                let info = &self.state.render_pass_info;
                let gfx = GraphicsSubCmd {
                    csb: ControlStream::new(&self.device, stream_type),
                    terminate_stream: None,
                    framebuffer: info.framebuffer.clone(),
                    hw_render_idx: info.current_hw_render,
                    depth_bias_table: None,
                    scissor_table: None,
                    query_pool: if self.state.vis_test_enabled {
                        self.state.query_pool.clone()
                    } else {
                        None
                    },
                    sec_query_indices: Vec::new(),
                    has_occlusion_query: false,
                    barrier_store: false,
                    barrier_load: false,
                    empty_cmd: true,
                    modifies_depth: false,
                    modifies_stencil: false,
                    depth_usage: DepthStencilUsage::Undefined,
                    stencil_usage: DepthStencilUsage::Undefined,
                    max_tiles_in_flight: self.device.info().isp_max_tiles_in_flight,
                    disable_compute_overlap: false,
                    patches: Vec::new(),
                    job: None,
                };
                self.state.reset_graphics_dirty_state(true);
                SubCommand::Graphics(gfx)
            }
            SubCmdType::Compute | SubCmdType::OcclusionQuery => {
                let compute = ComputeSubCmd {
                    csb: ControlStream::new(&self.device, StreamType::Compute),
                    num_shared_regs: 0,
                    uses_barrier: false,
                    job: None,
                };
                if ty == SubCmdType::Compute {
                    SubCommand::Compute(compute)
                } else {
                    SubCommand::OcclusionQuery(compute)
                }
            }
            SubCmdType::Transfer => SubCommand::Transfer(TransferSubCmd {
                ops: Vec::new(),
                serialize_with_frag: false,
            }),
            SubCmdType::Event => unreachable!("event sub-commands are recorded with add_event"),
        };
        trace!(?ty, "sub-command opened");
        self.current = Some(sub_cmd);
        Ok(())
    }

    /// Closes the open sub-command, if any.
    pub(crate) fn end_sub_cmd(&mut self) -> Result<()> {
        let mut sub_cmd = match self.current.take() {
            Some(sub_cmd) => sub_cmd,
            None => return Ok(()),
        };
        let ty = sub_cmd.ty();
        let mut query_availability = None;

        match sub_cmd {
            SubCommand::Graphics(ref mut gfx) => {
                let indices = self.state.take_query_indices();
                if !indices.is_empty() {
                    if self.is_render_pass_continue() {
                        gfx.sec_query_indices.extend_from_slice(&indices);
                    } else if let Some(pool) = gfx.query_pool.clone() {
                        query_availability = Some((pool, indices));
                    }
                    gfx.has_occlusion_query = true;
                }

                if self.is_secondary() {
                    // deferred streams are copied into the primary, without a return
                    if gfx.csb.ty() != StreamType::GraphicsDeferred {
                        gfx.csb.emit_return()?;
                    }
                } else {
                    self.finish_graphics(gfx)?;
                }
            }
            SubCommand::Compute(ref mut compute) | SubCommand::OcclusionQuery(ref mut compute) => {
                self.emit_compute_fence(compute, true)?;
                compute.csb.emit_terminate()?;
                self.compute_job_init(compute);
            }
            SubCommand::Transfer(_) | SubCommand::Event(_) => {}
        }

        if self.device.diagnostics().contains(crate::debug::Diagnostics::DUMP_CONTROL_STREAM) {
            match sub_cmd {
                SubCommand::Graphics(ref gfx) => gfx.csb.dump(),
                SubCommand::Compute(ref c) | SubCommand::OcclusionQuery(ref c) => c.csb.dump(),
                _ => {}
            }
        }

        self.push_sub_cmd(sub_cmd);
        trace!(?ty, index = self.order.len() - 1, "sub-command closed");

        if let Some((pool, indices)) = query_availability {
            self.add_query_availability(&pool, &indices)?;
        }
        Ok(())
    }

    /// Records a closed event sub-command.
    pub(crate) fn add_event(&mut self, event: EventSubCmd) -> Result<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.end_sub_cmd()?;
        trace!(?event, "event sub-command");
        self.push_sub_cmd(SubCommand::Event(event));
        Ok(())
    }

    //----------------------------------------------------------------------------------------------

    /// Records a pipeline barrier.
    pub fn pipeline_barrier(&mut self, info: &DependencyInfo) -> Result<()> {
        let _span = trace_span!("pipeline_barrier").entered();
        self.record(|cb| cb.pipeline_barrier_internal(info))
    }

    fn pipeline_barrier_internal(&mut self, info: &DependencyInfo) -> Result<()> {
        let src_stages = PipelineStage::from_vk_src(info.src_stage_mask);
        let dst_stages = PipelineStage::from_vk_dst(info.dst_stage_mask);

        let mut required = PipelineStage::empty();
        for stage in dst_stages.iter() {
            required |= self.state.barriers_needed[stage.index()];
        }
        let src_stages = src_stages & required;
        for stage in dst_stages.iter() {
            self.state.barriers_needed[stage.index()] &= !src_stages;
        }

        let is_barrier_needed = if src_stages.is_empty() || dst_stages.is_empty() {
            false
        } else if src_stages == PipelineStage::GEOM && dst_stages == PipelineStage::FRAG {
            // the fragment phase of a render always follows its geometry phase
            false
        } else if src_stages == dst_stages && src_stages.bits().count_ones() == 1 {
            if src_stages == PipelineStage::FRAG {
                if !self.state.in_render_pass() {
                    true
                } else {
                    if self.current_type() == Some(SubCmdType::Graphics) {
                        self.with_current_gfx(|cb, gfx| cb.insert_transparent_obj(gfx))?;
                    }
                    false
                }
            } else if src_stages == PipelineStage::COMPUTE {
                if self.current_type() == Some(SubCmdType::Compute) {
                    self.with_current_compute(|cb, compute| {
                        cb.emit_idfwdf(compute)?;
                        cb.emit_compute_fence(compute, false)
                    })?;
                }
                false
            } else {
                false
            }
        } else {
            true
        };

        let is_stencil_store_load_needed = self.is_stencil_store_load_needed(info);
        trace!(
            ?src_stages,
            ?dst_stages,
            is_barrier_needed,
            is_stencil_store_load_needed,
            "pipeline barrier"
        );

        if is_stencil_store_load_needed {
            self.insert_mid_frag_barrier(src_stages, dst_stages)
        } else if is_barrier_needed {
            self.add_event(EventSubCmd::Barrier {
                in_render_pass: false,
                wait_for: src_stages,
                wait_at: dst_stages,
            })
        } else {
            Ok(())
        }
    }

    /// Whether the barrier makes the current subpass read stencil values it wrote itself, which
    /// requires storing the tiles to memory and reloading them.
    fn is_stencil_store_load_needed(&self, info: &DependencyInfo) -> bool {
        let rp = &self.state.render_pass_info;
        let pass = match rp.pass {
            Some(ref pass) => pass,
            None => return false,
        };
        let hw_render = &pass.hw_setup().renders()[rp.current_hw_render];
        let ds_attachment = match hw_render.ds_attachment {
            Some(ds) => ds,
            None => return false,
        };

        let fragment_test_stages =
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        if !info.src_stage_mask.intersects(fragment_test_stages)
            && info.dst_stage_mask.contains(vk::PipelineStageFlags::FRAGMENT_SHADER)
        {
            return false;
        }

        let self_dependency = pass.subpasses()[rp.subpass_idx].reads_own_depth_stencil();

        for barrier in info.memory_barriers {
            if barrier
                .src_access
                .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
                && barrier.dst_access.contains(vk::AccessFlags::INPUT_ATTACHMENT_READ)
            {
                return self_dependency;
            }
        }

        for barrier in info.image_barriers {
            if !barrier.aspect_mask.contains(vk::ImageAspectFlags::STENCIL) {
                continue;
            }
            // secondaries do not know the framebuffer; trust the image
            if !self.is_secondary() {
                let is_ds_attachment = rp
                    .framebuffer
                    .as_ref()
                    .and_then(|fb| fb.attachments().get(ds_attachment))
                    .map(|view| Arc::ptr_eq(view, &barrier.image))
                    .unwrap_or(false);
                if !is_ds_attachment {
                    continue;
                }
            }
            if !format_has_stencil(barrier.image.format()) {
                continue;
            }
            return self_dependency;
        }

        false
    }

    /// Splits the current render: the tiles are stored to the SPM scratch buffer, and reloaded by
    /// the next graphics sub-command.
    fn insert_mid_frag_barrier(&mut self, src_stages: PipelineStage, dst_stages: PipelineStage) -> Result<()> {
        match self.current_gfx_mut() {
            Some(gfx) => {
                gfx.empty_cmd = false;
                gfx.barrier_store = true;
            }
            None => debug_assert!(false, "mid-render barrier outside of a graphics sub-command"),
        }
        self.end_sub_cmd()?;
        self.add_event(EventSubCmd::Barrier {
            in_render_pass: true,
            wait_for: src_stages,
            wait_at: dst_stages,
        })?;
        self.start_sub_cmd(SubCmdType::Graphics)?;
        if let Some(gfx) = self.current_gfx_mut() {
            gfx.barrier_load = true;
            gfx.barrier_store = false;
        }
        debug!("render split by stencil self-dependency");
        Ok(())
    }

    //----------------------------------------------------------------------------------------------

    /// Signals `event` once the stages in `src_stage_mask` are done.
    pub fn set_event(&mut self, event: &Arc<Event>, src_stage_mask: vk::PipelineStageFlags) -> Result<()> {
        let _span = trace_span!("set_event").entered();
        self.record(|cb| {
            cb.add_event(EventSubCmd::Set {
                event: event.clone(),
                wait_for: PipelineStage::from_vk_src(src_stage_mask),
            })
        })
    }

    /// Unsignals `event` once the stages in `src_stage_mask` are done.
    pub fn reset_event(&mut self, event: &Arc<Event>, src_stage_mask: vk::PipelineStageFlags) -> Result<()> {
        let _span = trace_span!("reset_event").entered();
        self.record(|cb| {
            cb.add_event(EventSubCmd::Reset {
                event: event.clone(),
                wait_for: PipelineStage::from_vk_src(src_stage_mask),
            })
        })
    }

    /// Blocks the stages in `dst_stage_mask` until every event is signalled.
    pub fn wait_events(&mut self, events: &[Arc<Event>], dst_stage_mask: vk::PipelineStageFlags) -> Result<()> {
        let _span = trace_span!("wait_events").entered();
        self.record(|cb| {
            cb.add_event(EventSubCmd::Wait {
                events: events.to_vec(),
                wait_at: PipelineStage::from_vk_dst(dst_stage_mask),
            })
        })
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("level", &self.level)
            .field("status", &self.status)
            .field("error", &self.error)
            .field("sub_cmds", &self.order.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn recording(device: &Arc<Device>) -> CommandBuffer {
        let mut cb = CommandBuffer::new(device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb
    }

    #[test]
    fn same_type_continues_open_sub_command() {
        let device = testing::device();
        let mut cb = recording(&device);
        cb.record(|cb| {
            cb.start_sub_cmd(SubCmdType::Transfer)?;
            cb.start_sub_cmd(SubCmdType::Transfer)?;
            cb.start_sub_cmd(SubCmdType::Compute)
        })
        .unwrap();
        cb.end().unwrap();
        let types: Vec<_> = cb.sub_commands().map(|s| s.ty()).collect();
        assert_eq!(types, vec![SubCmdType::Transfer, SubCmdType::Compute]);
    }

    #[test]
    fn primary_ignores_render_pass_continue() {
        let device = testing::device();
        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo {
            usage: vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE | vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cb.usage(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    }

    #[test]
    fn geometry_to_fragment_barrier_is_implicit() {
        let device = testing::device();
        let mut cb = recording(&device);
        cb.pipeline_barrier(&DependencyInfo {
            src_stage_mask: vk::PipelineStageFlags::VERTEX_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            ..Default::default()
        })
        .unwrap();
        cb.end().unwrap();
        assert_eq!(cb.sub_command_count(), 0);
    }

    #[test]
    fn barrier_consumes_needed_stages() {
        let device = testing::device();
        let mut cb = recording(&device);
        let barrier = DependencyInfo {
            src_stage_mask: vk::PipelineStageFlags::TRANSFER,
            dst_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            ..Default::default()
        };
        cb.pipeline_barrier(&barrier).unwrap();
        // nothing was recorded since the first barrier
        cb.pipeline_barrier(&barrier).unwrap();
        cb.end().unwrap();

        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        assert_eq!(sub_cmds.len(), 1);
        match sub_cmds[0].as_event() {
            Some(EventSubCmd::Barrier { wait_for, wait_at, .. }) => {
                assert_eq!(*wait_for, PipelineStage::TRANSFER);
                assert_eq!(*wait_at, PipelineStage::COMPUTE);
            }
            other => panic!("unexpected sub-command: {:?}", other),
        }
    }

    #[test]
    fn compute_to_compute_barrier_emits_fences_in_place() {
        let device = testing::device();
        let mut cb = recording(&device);
        cb.record(|cb| cb.start_sub_cmd(SubCmdType::Compute)).unwrap();
        cb.pipeline_barrier(&DependencyInfo {
            src_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            ..Default::default()
        })
        .unwrap();
        cb.end().unwrap();

        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        assert_eq!(sub_cmds.len(), 1);
        let compute = sub_cmds[0].as_compute().unwrap();
        let words = compute.control_stream().words();
        let kernel_len = crate::hw::cdm::kernel(&crate::hw::cdm::KernelInfo {
            global_size: [1, 1, 1],
            ..Default::default()
        })
        .len();
        // idfwdf and fence in place of the barrier, then the closing fence and terminate
        assert_eq!(words.len(), 3 * kernel_len + 1);
        assert_eq!(
            crate::hw::cdm::block_type(*words.last().unwrap()),
            crate::hw::cdm::STREAM_TERMINATE
        );
    }

    #[test]
    fn events_are_recorded_in_order() {
        let device = testing::device();
        let event = Event::new(&device).unwrap();
        let mut cb = recording(&device);
        cb.set_event(&event, vk::PipelineStageFlags::TRANSFER).unwrap();
        cb.wait_events(&[event.clone()], vk::PipelineStageFlags::FRAGMENT_SHADER)
            .unwrap();
        cb.reset_event(&event, vk::PipelineStageFlags::BOTTOM_OF_PIPE).unwrap();
        cb.end().unwrap();
        let events: Vec<_> = cb.sub_commands().collect();
        assert!(matches!(events[0].as_event(), Some(EventSubCmd::Set { .. })));
        assert!(matches!(
            events[1].as_event(),
            Some(EventSubCmd::Wait { wait_at, .. }) if *wait_at == PipelineStage::FRAG
        ));
        assert!(matches!(
            events[2].as_event(),
            Some(EventSubCmd::Reset { wait_for, .. }) if *wait_for == PipelineStage::ALL
        ));
    }

    fn begin_pass(cb: &mut CommandBuffer, device: &Arc<Device>) -> Arc<crate::pass::Framebuffer> {
        let pass = testing::single_color_pass(device, vk::Format::R8G8B8A8_UNORM, 1);
        let fb = testing::framebuffer(device, &pass, 64, 64, 1);
        cb.begin_render_pass(&RenderPassBeginInfo {
            render_pass: pass,
            framebuffer: fb.clone(),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width: 64, height: 64 },
            },
            clear_values: vec![ClearValue::default()],
        })
        .unwrap();
        fb
    }

    #[test]
    fn fragment_to_fragment_barrier_flushes_in_place() {
        let device = testing::device();
        let pipeline = testing::graphics_pipeline(&device);
        let mut cb = recording(&device);
        begin_pass(&mut cb, &device);
        cb.bind_graphics_pipeline(&pipeline);
        cb.draw(3, 1, 0, 0).unwrap();
        let stream_len = |cb: &CommandBuffer| cb.current.as_ref().unwrap().as_graphics().unwrap().control_stream().len_words();
        let before = stream_len(&cb);

        cb.pipeline_barrier(&DependencyInfo {
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            ..Default::default()
        })
        .unwrap();
        // a transparent object instead of a barrier sub-command
        assert_eq!(cb.sub_command_count(), 0);
        assert!(stream_len(&cb) > before);
        cb.end_render_pass().unwrap();
        cb.end().unwrap();
        assert_eq!(cb.sub_command_count(), 1);
    }

    #[test]
    fn stencil_read_back_splits_the_render() {
        use crate::pass::{AttachmentDescription, RenderPass, RenderPassCreateInfo, SubpassDescription};

        let device = testing::device();
        let pass = RenderPass::new(
            &device,
            &RenderPassCreateInfo {
                attachments: vec![
                    AttachmentDescription::color(vk::Format::R8G8B8A8_UNORM, 1),
                    AttachmentDescription {
                        format: vk::Format::D24_UNORM_S8_UINT,
                        samples: 1,
                        load_op: vk::AttachmentLoadOp::CLEAR,
                        store_op: vk::AttachmentStoreOp::DONT_CARE,
                        stencil_load_op: vk::AttachmentLoadOp::CLEAR,
                        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                    },
                ],
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
        let fb = testing::framebuffer(&device, &pass, 64, 64, 1);
        let pipeline = testing::graphics_pipeline(&device);

        let mut cb = recording(&device);
        cb.begin_render_pass(&RenderPassBeginInfo {
            render_pass: pass,
            framebuffer: fb,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width: 64, height: 64 },
            },
            clear_values: vec![
                ClearValue::default(),
                ClearValue::DepthStencil { depth: 1.0, stencil: 0 },
            ],
        })
        .unwrap();
        cb.bind_graphics_pipeline(&pipeline);
        cb.draw(3, 1, 0, 0).unwrap();
        cb.next_subpass().unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.pipeline_barrier(&DependencyInfo {
            src_stage_mask: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            memory_barriers: &[MemoryBarrier {
                src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::INPUT_ATTACHMENT_READ,
            }],
            ..Default::default()
        })
        .unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end_render_pass().unwrap();
        cb.end().unwrap();

        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        let types: Vec<_> = sub_cmds.iter().map(|s| s.ty()).collect();
        assert_eq!(
            types,
            vec![
                SubCmdType::Graphics,
                SubCmdType::Graphics,
                SubCmdType::Event,
                SubCmdType::Graphics
            ]
        );
        let first = sub_cmds[0].as_graphics().unwrap();
        assert!(!first.barrier_store() && !first.barrier_load());

        // tiles of subpass 1 are stored mid-render and reloaded after the barrier
        let stored = sub_cmds[1].as_graphics().unwrap();
        assert!(stored.barrier_store());
        assert!(!stored.barrier_load());
        assert!(matches!(
            sub_cmds[2].as_event(),
            Some(EventSubCmd::Barrier { in_render_pass: true, .. })
        ));
        let loaded = sub_cmds[3].as_graphics().unwrap();
        assert!(loaded.barrier_load());
        assert!(!loaded.barrier_store());

        assert!(stored.job().unwrap().requires_spm_scratch_buffer);
        assert!(loaded.job().unwrap().requires_spm_scratch_buffer);
    }

    #[test]
    fn reset_releases_everything() {
        let host = Arc::new(crate::memory::HostMemory::new());
        let device = testing::device_on(host.clone());
        let pipeline = testing::graphics_pipeline(&device);
        let mut cb = recording(&device);
        let fb = begin_pass(&mut cb, &device);
        cb.bind_graphics_pipeline(&pipeline);
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end_render_pass().unwrap();
        cb.update_buffer(DevAddr(0x1_0000_0000), &[1, 2]).unwrap();
        cb.end().unwrap();
        assert!(fb.existing_render_target(1).is_some());
        assert!(cb.allocation_count() > 0);

        let live = host.live_allocations();
        let recorded = cb.allocation_count();
        cb.reset();
        assert_eq!(cb.sub_command_count(), 0);
        assert_eq!(cb.allocation_count(), 0);
        // control stream blocks go too
        assert!(host.live_allocations() + recorded < live);
    }
}
