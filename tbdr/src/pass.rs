//! Render passes, hardware render setup and framebuffers.
//!
//! A render pass is split into *hardware renders*: runs of consecutive subpasses that can share
//! on-chip tile storage. Each hardware render is one fragment job (more if the recorder has to
//! split it). Color attachments are assigned to output registers, spilling to tile buffers when
//! the output registers are exhausted.
use crate::{
    device::Device,
    hw::{self, ISP_UPASS_START_SIZE_MAX, MAX_COLOR_ATTACHMENTS, PBE_STRIDE_ALIGNMENT},
    memory::{Bo, DevAddr, Heap},
    program::{LoadProgramInfo, UploadedProgram},
    rt_dataset::RenderTargetDataset,
    spm::{scratch_buffer_size, ScratchBuffer, SpmBgobjState, SpmEotState},
    util::{align32, div_ceil32, format_bits_per_pixel, format_has_depth, format_has_stencil, sample_count_log2},
    vk, Result,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, trace_span};

/// Description of a render pass attachment.
#[derive(Copy, Clone, Debug)]
pub struct AttachmentDescription {
    pub format: vk::Format,
    pub samples: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
}

impl AttachmentDescription {
    /// Color attachment cleared on load and stored at the end of the pass.
    pub fn color(format: vk::Format, samples: u32) -> AttachmentDescription {
        AttachmentDescription {
            format,
            samples,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        }
    }

    pub fn has_depth(&self) -> bool {
        format_has_depth(self.format)
    }

    pub fn has_stencil(&self) -> bool {
        format_has_stencil(self.format)
    }
}

/// Description of a subpass. Attachments are referenced by index.
#[derive(Clone, Debug, Default)]
pub struct SubpassDescription {
    pub color_attachments: Vec<usize>,
    pub input_attachments: Vec<usize>,
    pub depth_stencil_attachment: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassCreateInfo {
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
}

/// Where the tile data of a color attachment lives during a render.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MrtResource {
    /// On-chip output registers starting at `offset`.
    OutputReg { offset: u32 },
    /// Tile buffer memory.
    TileBuffer { index: u32, offset: u32 },
}

/// Initial contents of an attachment at the start of a hardware render.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ColorInit {
    pub attachment: usize,
    pub op: vk::AttachmentLoadOp,
}

/// An attachment written back to memory at the end of a hardware render.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EotSurface {
    pub attachment: usize,
    pub mrt: MrtResource,
}

/// Clears and loads applied by a full-screen object at the start of a render or subpass.
///
/// The USC program is specific to the pass; the constants it reads (clear colors and attachment
/// addresses) are uploaded when the op is recorded.
#[derive(Debug)]
pub struct LoadOp {
    /// Attachments, in the order of the bits of the masks below.
    pub attachments: Vec<usize>,
    pub clear_mask: u32,
    pub load_mask: u32,
    pub program: UploadedProgram,
}

impl LoadOp {
    fn new(
        device: &Device,
        attachments: Vec<usize>,
        ops: &[vk::AttachmentLoadOp],
        output_regs: u32,
        samples: u32,
    ) -> Result<Option<LoadOp>> {
        let mut clear_mask = 0;
        let mut load_mask = 0;
        for (i, op) in ops.iter().enumerate() {
            match *op {
                vk::AttachmentLoadOp::CLEAR => clear_mask |= 1 << i,
                vk::AttachmentLoadOp::LOAD => load_mask |= 1 << i,
                _ => {}
            }
        }
        if clear_mask == 0 && load_mask == 0 {
            return Ok(None);
        }
        let program = device.programs().load_program(&LoadProgramInfo::LoadOps {
            clear_mask,
            load_mask,
            output_regs,
            samples,
        })?;
        Ok(Some(LoadOp {
            attachments,
            clear_mask,
            load_mask,
            program: device.upload_program(Heap::Usc, &program)?,
        }))
    }
}

/// A subpass as placed in a hardware render.
#[derive(Debug)]
pub struct HwSubpass {
    pub index: usize,
    /// Clears of attachments first used by this subpass (never set on the first subpass of a
    /// render, whose clears are part of the render's own load op).
    pub load_op: Option<LoadOp>,
}

/// A hardware render.
#[derive(Debug)]
pub struct HwRender {
    pub sample_count: u32,
    pub ds_attachment: Option<usize>,
    pub depth_init: vk::AttachmentLoadOp,
    pub stencil_init: vk::AttachmentLoadOp,
    pub depth_store: bool,
    pub stencil_store: bool,
    pub output_regs_count: u32,
    pub tile_buffers_count: u32,
    pub color_init: Vec<ColorInit>,
    pub eot_surfaces: Vec<EotSurface>,
    pub load_op: Option<LoadOp>,
    pub subpasses: Vec<HwSubpass>,
}

impl HwRender {
    /// Whether the background object has to run on empty tiles (any attachment is cleared).
    pub fn has_clear(&self) -> bool {
        self.color_init.iter().any(|c| c.op == vk::AttachmentLoadOp::CLEAR)
    }
}

/// Location of a subpass in the hardware setup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubpassMapping {
    pub render: usize,
    /// Index within the render's subpasses.
    pub subpass: usize,
}

/// Hardware renders of a render pass.
#[derive(Debug)]
pub struct HwSetup {
    renders: Vec<HwRender>,
    subpass_map: Vec<SubpassMapping>,
}

impl HwSetup {
    pub fn renders(&self) -> &[HwRender] {
        &self.renders
    }

    pub fn subpass_map(&self) -> &[SubpassMapping] {
        &self.subpass_map
    }
}

/// A subpass with the properties derived at pass creation.
#[derive(Clone, Debug)]
pub struct Subpass {
    pub color_attachments: Vec<usize>,
    pub input_attachments: Vec<usize>,
    pub depth_stencil_attachment: Option<usize>,
    pub sample_count: u32,
    /// ISP user pass of the subpass within its hardware render.
    pub isp_userpass: u32,
}

impl Subpass {
    /// Whether the subpass reads its own depth/stencil attachment as an input attachment.
    pub fn reads_own_depth_stencil(&self) -> bool {
        match self.depth_stencil_attachment {
            Some(ds) => self.input_attachments.contains(&ds),
            None => false,
        }
    }
}

/// A render pass.
#[derive(Debug)]
pub struct RenderPass {
    attachments: Vec<AttachmentDescription>,
    subpasses: Vec<Subpass>,
    hw_setup: HwSetup,
    max_sample_count: u32,
}

impl RenderPass {
    pub fn new(device: &Arc<Device>, create_info: &RenderPassCreateInfo) -> Result<Arc<RenderPass>> {
        let _span = trace_span!("render_pass_create").entered();
        let (subpasses, hw_setup) = HwSetupBuilder::new(device, create_info).build()?;
        let max_sample_count = create_info
            .attachments
            .iter()
            .map(|a| a.samples)
            .chain(subpasses.iter().map(|s| s.sample_count))
            .max()
            .unwrap_or(1)
            .max(1);
        debug!(
            subpasses = subpasses.len(),
            renders = hw_setup.renders.len(),
            max_sample_count,
            "created render pass"
        );
        Ok(Arc::new(RenderPass {
            attachments: create_info.attachments.clone(),
            subpasses,
            hw_setup,
            max_sample_count,
        }))
    }

    pub fn attachments(&self) -> &[AttachmentDescription] {
        &self.attachments
    }

    pub fn subpasses(&self) -> &[Subpass] {
        &self.subpasses
    }

    pub fn hw_setup(&self) -> &HwSetup {
        &self.hw_setup
    }

    pub fn max_sample_count(&self) -> u32 {
        self.max_sample_count
    }

    /// Hardware render a subpass belongs to.
    pub fn hw_render_for_subpass(&self, subpass: usize) -> (usize, &HwRender) {
        let render = self.hw_setup.subpass_map[subpass].render;
        (render, &self.hw_setup.renders[render])
    }
}

//--------------------------------------------------------------------------------------------------

/// Attachment state while building the hardware setup.
#[derive(Copy, Clone, Debug, Default)]
struct AttachmentState {
    /// Storage in the open render.
    resource: Option<MrtResource>,
    /// Whether the attachment has already been written by a closed render.
    stored: bool,
    last_use: usize,
}

struct OpenRender {
    render: HwRender,
    first_subpass: usize,
    output_regs_used: u32,
    /// Dwords used in each tile buffer.
    tile_buffers: Vec<u32>,
    /// Attachments allocated in this render, in allocation order.
    allocated: Vec<usize>,
}

struct HwSetupBuilder<'a> {
    device: &'a Arc<Device>,
    create_info: &'a RenderPassCreateInfo,
    attachments: Vec<AttachmentState>,
    renders: Vec<HwRender>,
    subpasses: Vec<Subpass>,
    subpass_map: Vec<SubpassMapping>,
    open: Option<OpenRender>,
}

impl<'a> HwSetupBuilder<'a> {
    fn new(device: &'a Arc<Device>, create_info: &'a RenderPassCreateInfo) -> HwSetupBuilder<'a> {
        let mut attachments = vec![AttachmentState::default(); create_info.attachments.len()];
        for (i, sp) in create_info.subpasses.iter().enumerate() {
            for &a in sp
                .color_attachments
                .iter()
                .chain(sp.input_attachments.iter())
                .chain(sp.depth_stencil_attachment.iter())
            {
                attachments[a].last_use = i;
            }
        }
        HwSetupBuilder {
            device,
            create_info,
            attachments,
            renders: Vec::new(),
            subpasses: Vec::new(),
            subpass_map: Vec::new(),
            open: None,
        }
    }

    fn subpass_sample_count(&self, sp: &SubpassDescription) -> u32 {
        sp.color_attachments
            .iter()
            .chain(sp.depth_stencil_attachment.iter())
            .map(|&a| self.create_info.attachments[a].samples)
            .next()
            .unwrap_or(1)
            .max(1)
    }

    fn color_dwords(&self, attachment: usize) -> u32 {
        div_ceil32(format_bits_per_pixel(self.create_info.attachments[attachment].format), 32)
    }

    /// Whether a subpass can join the open render.
    fn can_merge(&self, index: usize, sp: &SubpassDescription, sample_count: u32) -> bool {
        let open = match self.open {
            Some(ref open) => open,
            None => return false,
        };
        if open.render.sample_count != sample_count {
            return false;
        }
        if open.render.ds_attachment.is_some()
            && sp.depth_stencil_attachment.is_some()
            && open.render.ds_attachment != sp.depth_stencil_attachment
        {
            return false;
        }
        // stencil cannot be replicated to an input attachment on chip, it has to round-trip
        // through memory
        let ds = sp.depth_stencil_attachment.or(open.render.ds_attachment);
        if let Some(ds) = ds {
            let stencil = self.create_info.attachments[ds].has_stencil();
            if stencil && sp.input_attachments.contains(&ds) {
                return false;
            }
            if stencil
                && self.create_info.subpasses[open.first_subpass..index]
                    .iter()
                    .any(|prev| prev.input_attachments.contains(&ds))
            {
                return false;
            }
        }
        let new_colors: u32 = sp
            .color_attachments
            .iter()
            .filter(|&&a| self.attachments[a].resource.is_none())
            .count() as u32;
        open.allocated.len() as u32 + new_colors <= MAX_COLOR_ATTACHMENTS as u32
    }

    fn open_render(&mut self, index: usize, sample_count: u32) {
        self.open = Some(OpenRender {
            render: HwRender {
                sample_count,
                ds_attachment: None,
                depth_init: vk::AttachmentLoadOp::DONT_CARE,
                stencil_init: vk::AttachmentLoadOp::DONT_CARE,
                depth_store: false,
                stencil_store: false,
                output_regs_count: 0,
                tile_buffers_count: 0,
                color_init: Vec::new(),
                eot_surfaces: Vec::new(),
                load_op: None,
                subpasses: Vec::new(),
            },
            first_subpass: index,
            output_regs_used: 0,
            tile_buffers: Vec::new(),
            allocated: Vec::new(),
        });
    }

    fn alloc_color(&mut self, attachment: usize) -> MrtResource {
        let dwords = self.color_dwords(attachment);
        let max_output_regs = self.device.info().max_output_regs;
        let open = match self.open {
            Some(ref mut open) => open,
            None => unreachable!("color allocation outside of a render"),
        };
        if open.output_regs_used + dwords <= max_output_regs {
            let offset = open.output_regs_used;
            open.output_regs_used += dwords;
            return MrtResource::OutputReg { offset };
        }
        for (index, used) in open.tile_buffers.iter_mut().enumerate() {
            if *used + dwords <= max_output_regs {
                let offset = *used;
                *used += dwords;
                return MrtResource::TileBuffer {
                    index: index as u32,
                    offset,
                };
            }
        }
        open.tile_buffers.push(dwords);
        MrtResource::TileBuffer {
            index: open.tile_buffers.len() as u32 - 1,
            offset: 0,
        }
    }

    fn add_subpass(&mut self, index: usize) -> Result<()> {
        let create_info = self.create_info;
        let sp = &create_info.subpasses[index];
        let sample_count = self.subpass_sample_count(sp);
        if !self.can_merge(index, sp, sample_count) {
            self.close_render()?;
            self.open_render(index, sample_count);
        }

        let mut new_colors = Vec::new();
        let mut new_ops = Vec::new();
        for &a in sp.color_attachments.iter() {
            if self.attachments[a].resource.is_some() {
                continue;
            }
            let mrt = self.alloc_color(a);
            self.attachments[a].resource = Some(mrt);
            let desc = &create_info.attachments[a];
            let op = if self.attachments[a].stored {
                vk::AttachmentLoadOp::LOAD
            } else {
                desc.load_op
            };
            new_colors.push(a);
            new_ops.push(op);
        }

        let render_index = self.renders.len();
        let device = self.device;
        let open = match self.open {
            Some(ref mut open) => open,
            None => unreachable!("subpass outside of a render"),
        };
        open.allocated.extend(new_colors.iter().copied());

        if let Some(ds) = sp.depth_stencil_attachment {
            if open.render.ds_attachment.is_none() {
                open.render.ds_attachment = Some(ds);
                let desc = &create_info.attachments[ds];
                let stored = self.attachments[ds].stored;
                open.render.depth_init = if stored { vk::AttachmentLoadOp::LOAD } else { desc.load_op };
                open.render.stencil_init = if stored {
                    vk::AttachmentLoadOp::LOAD
                } else {
                    desc.stencil_load_op
                };
            }
        }

        let position = open.render.subpasses.len();
        let load_op = if position == 0 {
            for (&attachment, &op) in new_colors.iter().zip(new_ops.iter()) {
                if op != vk::AttachmentLoadOp::DONT_CARE {
                    open.render.color_init.push(ColorInit { attachment, op });
                }
            }
            None
        } else {
            let output_regs = open.output_regs_used.max(1);
            LoadOp::new(device, new_colors, &new_ops, output_regs, sample_count)?
        };
        open.render.subpasses.push(HwSubpass { index, load_op });

        self.subpass_map.push(SubpassMapping {
            render: render_index,
            subpass: position,
        });
        self.subpasses.push(Subpass {
            color_attachments: sp.color_attachments.clone(),
            input_attachments: sp.input_attachments.clone(),
            depth_stencil_attachment: sp.depth_stencil_attachment,
            sample_count,
            isp_userpass: position as u32 & ISP_UPASS_START_SIZE_MAX,
        });
        Ok(())
    }

    fn close_render(&mut self) -> Result<()> {
        let mut open = match self.open.take() {
            Some(open) => open,
            None => return Ok(()),
        };
        let last_subpass = open.first_subpass + open.render.subpasses.len() - 1;
        let max_output_regs = self.device.info().max_output_regs;

        for &a in open.allocated.iter() {
            let state = &mut self.attachments[a];
            let mrt = match state.resource.take() {
                Some(mrt) => mrt,
                None => continue,
            };
            let desc = &self.create_info.attachments[a];
            if desc.store_op == vk::AttachmentStoreOp::STORE || state.last_use > last_subpass {
                open.render.eot_surfaces.push(EotSurface { attachment: a, mrt });
                state.stored = true;
            }
        }

        if let Some(ds) = open.render.ds_attachment {
            let desc = &self.create_info.attachments[ds];
            let used_later = self.attachments[ds].last_use > last_subpass;
            open.render.depth_store = desc.has_depth() && (desc.store_op == vk::AttachmentStoreOp::STORE || used_later);
            open.render.stencil_store =
                desc.has_stencil() && (desc.stencil_store_op == vk::AttachmentStoreOp::STORE || used_later);
            if open.render.depth_store || open.render.stencil_store {
                self.attachments[ds].stored = true;
            }
        }

        open.render.tile_buffers_count = open.tile_buffers.len() as u32;
        // once anything spills, every output register counts as used
        open.render.output_regs_count = if open.render.tile_buffers_count > 0 {
            max_output_regs
        } else {
            open.output_regs_used.max(1)
        };

        let (attachments, ops): (Vec<usize>, Vec<vk::AttachmentLoadOp>) =
            open.render.color_init.iter().map(|c| (c.attachment, c.op)).unzip();
        open.render.load_op = LoadOp::new(
            self.device,
            attachments,
            &ops,
            open.render.output_regs_count,
            open.render.sample_count,
        )?;

        trace!(
            render = self.renders.len(),
            subpasses = open.render.subpasses.len(),
            output_regs = open.render.output_regs_count,
            tile_buffers = open.render.tile_buffers_count,
            eot_surfaces = open.render.eot_surfaces.len(),
            "hardware render closed"
        );
        self.renders.push(open.render);
        Ok(())
    }

    fn build(mut self) -> Result<(Vec<Subpass>, HwSetup)> {
        for index in 0..self.create_info.subpasses.len() {
            self.add_subpass(index)?;
        }
        self.close_render()?;
        Ok((
            self.subpasses,
            HwSetup {
                renders: self.renders,
                subpass_map: self.subpass_map,
            },
        ))
    }
}

//--------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug)]
pub struct ImageViewCreateInfo {
    pub format: vk::Format,
    pub samples: u32,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

/// An attachment image view. Owns its backing memory.
#[derive(Debug)]
pub struct ImageView {
    format: vk::Format,
    samples: u32,
    width: u32,
    height: u32,
    layers: u32,
    stride: u32,
    layer_size: u64,
    bo: Bo,
}

impl ImageView {
    pub fn new(device: &Arc<Device>, create_info: &ImageViewCreateInfo) -> Result<Arc<ImageView>> {
        let stride = align32(create_info.width.max(1), PBE_STRIDE_ALIGNMENT);
        let bytes_per_pixel = (format_bits_per_pixel(create_info.format) as u64 + 7) / 8;
        let layer_size =
            stride as u64 * create_info.height.max(1) as u64 * bytes_per_pixel * create_info.samples.max(1) as u64;
        let layers = create_info.layers.max(1);
        let bo = device.alloc(Heap::General, layer_size * layers as u64, hw::PM_PAGE_SIZE)?;
        Ok(Arc::new(ImageView {
            format: create_info.format,
            samples: create_info.samples.max(1),
            width: create_info.width,
            height: create_info.height,
            layers,
            stride,
            layer_size,
            bo,
        }))
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Row stride, in pixels.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn layer_size(&self) -> u64 {
        self.layer_size
    }

    pub fn addr(&self) -> DevAddr {
        self.bo.addr()
    }
}

#[derive(Clone, Debug)]
pub struct FramebufferCreateInfo {
    pub render_pass: Arc<RenderPass>,
    pub attachments: Vec<Arc<ImageView>>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

/// Number of distinct sample counts a framebuffer can be rendered with (1, 2, 4, 8).
const NUM_SAMPLE_COUNTS: usize = 4;

/// A framebuffer.
///
/// Render target datasets are created on first use, one per sample count.
#[derive(Debug)]
pub struct Framebuffer {
    render_pass: Arc<RenderPass>,
    attachments: Vec<Arc<ImageView>>,
    width: u32,
    height: u32,
    layers: u32,
    render_targets: [Mutex<Option<Arc<RenderTargetDataset>>>; NUM_SAMPLE_COUNTS],
    scratch: Arc<ScratchBuffer>,
    spm_eot: Vec<SpmEotState>,
    spm_bgobj: Vec<SpmBgobjState>,
}

impl Framebuffer {
    pub fn new(device: &Arc<Device>, create_info: FramebufferCreateInfo) -> Result<Arc<Framebuffer>> {
        let _span = trace_span!("framebuffer_create").entered();
        let FramebufferCreateInfo {
            render_pass,
            attachments,
            width,
            height,
            layers,
        } = create_info;
        debug_assert_eq!(attachments.len(), render_pass.attachments().len());

        let scratch_size = scratch_buffer_size(&render_pass, width, height, layers);
        let scratch = device.scratch_store.get_buffer(device, scratch_size)?;

        let mut spm_eot = Vec::with_capacity(render_pass.hw_setup().renders().len());
        let mut spm_bgobj = Vec::with_capacity(render_pass.hw_setup().renders().len());
        for render in render_pass.hw_setup().renders() {
            spm_eot.push(SpmEotState::new(device, &scratch, render, width, height)?);
            spm_bgobj.push(SpmBgobjState::new(device, &scratch, render, width, height)?);
        }

        debug!(width, height, layers, scratch_size, "created framebuffer");
        Ok(Arc::new(Framebuffer {
            render_pass,
            attachments,
            width,
            height,
            layers: layers.max(1),
            render_targets: Default::default(),
            scratch,
            spm_eot,
            spm_bgobj,
        }))
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn attachments(&self) -> &[Arc<ImageView>] {
        &self.attachments
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn scratch_buffer(&self) -> &Arc<ScratchBuffer> {
        &self.scratch
    }

    pub fn spm_eot_state(&self, render: usize) -> &SpmEotState {
        &self.spm_eot[render]
    }

    pub fn spm_bgobj_state(&self, render: usize) -> &SpmBgobjState {
        &self.spm_bgobj[render]
    }

    /// Returns the render target dataset for `samples`, creating it on first use.
    pub fn render_target(&self, device: &Arc<Device>, samples: u32) -> Result<Arc<RenderTargetDataset>> {
        let mut rt = self.render_targets[sample_count_log2(samples)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ref rtd) = *rt {
            return Ok(rtd.clone());
        }
        let rtd = Arc::new(RenderTargetDataset::new(
            device,
            self.width,
            self.height,
            samples,
            self.layers,
        )?);
        *rt = Some(rtd.clone());
        Ok(rtd)
    }

    /// The render target dataset for `samples`, if it was created.
    pub fn existing_render_target(&self, samples: u32) -> Option<Arc<RenderTargetDataset>> {
        self.render_targets[sample_count_log2(samples)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
