//! Sub-commands: the hardware-schedulable units a command buffer is split into.
use crate::{
    csb::{ControlStream, Slot},
    job::{ComputeJob, RenderJob},
    memory::{Bo, DevAddr},
    pass::Framebuffer,
    query::{Event, QueryPool},
    stage::PipelineStage,
};
use std::sync::{Arc, Weak};

slotmap::new_key_type! {
    /// Key of a sub-command owned by a command buffer.
    pub struct SubCmdId;
}

/// Kind of a sub-command, without payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SubCmdType {
    Graphics,
    Compute,
    OcclusionQuery,
    Transfer,
    Event,
}

impl SubCmdType {
    /// Hardware stages that must be waited on by a later barrier once a sub-command of this
    /// type was recorded.
    pub(crate) fn barrier_stages(self) -> PipelineStage {
        match self {
            SubCmdType::Graphics => PipelineStage::GEOM | PipelineStage::FRAG,
            SubCmdType::Compute => PipelineStage::COMPUTE,
            SubCmdType::OcclusionQuery | SubCmdType::Transfer => PipelineStage::TRANSFER,
            SubCmdType::Event => PipelineStage::empty(),
        }
    }
}

/// Reference to a sub-command in the order of execution.
///
/// Sub-commands of a secondary executed outside of a render pass are referenced, not owned: the
/// secondary must outlive the primary's use of them, and resetting the primary leaves them alone.
#[derive(Clone, Debug)]
pub(crate) enum SubCmdHandle {
    Owned(SubCmdId),
    Borrowed(Weak<SubCommand>),
}

/// Whether depth (or stencil) values are needed by a render.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DepthStencilUsage {
    Undefined,
    Needed,
    Never,
}

/// ISP depth bias / scissor indices that can only be resolved once the secondary recording them
/// is executed, because the table bases are only known then.
#[derive(Clone, Debug)]
pub(crate) enum DeferredPatch {
    /// Two reserved words in a deferred stream, receiving a `PPP_STATE` pointing at a new DBSC
    /// state block.
    Dbsc { depthbias_index: u32, scissor_index: u32, slot: Slot },
    /// The DBSC word of an already uploaded PPP state block.
    Dbsc2 {
        depthbias_index: u32,
        scissor_index: u32,
        bo: Arc<Bo>,
        offset_dw: u32,
    },
}

/// Graphics work targeting one hardware render.
#[derive(Debug)]
pub struct GraphicsSubCmd {
    pub(crate) csb: ControlStream,
    /// Terminate-only stream used for the fragment half of a split submission.
    pub(crate) terminate_stream: Option<ControlStream>,
    pub(crate) framebuffer: Option<Arc<Framebuffer>>,
    pub(crate) hw_render_idx: usize,
    pub(crate) depth_bias_table: Option<Bo>,
    pub(crate) scissor_table: Option<Bo>,
    pub(crate) query_pool: Option<Arc<QueryPool>>,
    /// Query indices recorded by a secondary, merged into the primary on execution.
    pub(crate) sec_query_indices: Vec<u32>,
    pub(crate) has_occlusion_query: bool,
    pub(crate) barrier_store: bool,
    pub(crate) barrier_load: bool,
    pub(crate) empty_cmd: bool,
    pub(crate) modifies_depth: bool,
    pub(crate) modifies_stencil: bool,
    pub(crate) depth_usage: DepthStencilUsage,
    pub(crate) stencil_usage: DepthStencilUsage,
    pub(crate) max_tiles_in_flight: u32,
    /// A fragment shader needs more coefficient storage than compute overlap leaves.
    pub(crate) disable_compute_overlap: bool,
    pub(crate) patches: Vec<DeferredPatch>,
    pub(crate) job: Option<RenderJob>,
}

impl GraphicsSubCmd {
    pub fn control_stream(&self) -> &ControlStream {
        &self.csb
    }

    pub fn terminate_stream(&self) -> Option<&ControlStream> {
        self.terminate_stream.as_ref()
    }

    pub fn framebuffer(&self) -> Option<&Arc<Framebuffer>> {
        self.framebuffer.as_ref()
    }

    pub fn hw_render_idx(&self) -> usize {
        self.hw_render_idx
    }

    /// Whether the tiles are stored to the SPM scratch buffer at the end of this render.
    pub fn barrier_store(&self) -> bool {
        self.barrier_store
    }

    /// Whether the tiles are reloaded from the SPM scratch buffer at the start of this render.
    pub fn barrier_load(&self) -> bool {
        self.barrier_load
    }

    /// Whether no draw was recorded.
    pub fn is_empty(&self) -> bool {
        self.empty_cmd
    }

    pub fn has_occlusion_query(&self) -> bool {
        self.has_occlusion_query
    }

    pub fn max_tiles_in_flight(&self) -> u32 {
        self.max_tiles_in_flight
    }

    pub fn modifies_depth(&self) -> bool {
        self.modifies_depth
    }

    pub fn modifies_stencil(&self) -> bool {
        self.modifies_stencil
    }

    /// The job descriptor, available once the sub-command is closed (primaries only).
    pub fn job(&self) -> Option<&RenderJob> {
        self.job.as_ref()
    }
}

/// Compute work (also used for occlusion query kernels).
#[derive(Debug)]
pub struct ComputeSubCmd {
    pub(crate) csb: ControlStream,
    pub(crate) num_shared_regs: u32,
    pub(crate) uses_barrier: bool,
    pub(crate) job: Option<ComputeJob>,
}

impl ComputeSubCmd {
    pub fn control_stream(&self) -> &ControlStream {
        &self.csb
    }

    pub fn num_shared_regs(&self) -> u32 {
        self.num_shared_regs
    }

    pub fn uses_barrier(&self) -> bool {
        self.uses_barrier
    }

    pub fn job(&self) -> Option<&ComputeJob> {
        self.job.as_ref()
    }
}

/// A transfer operation, executed by the transfer engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferOp {
    CopyBuffer {
        src: DevAddr,
        dst: DevAddr,
        size: u64,
    },
    FillBuffer {
        dst: DevAddr,
        size: u64,
        data: u32,
    },
    /// Copies `size` bytes from a staging upload owned by the command buffer.
    UpdateBuffer {
        src: DevAddr,
        dst: DevAddr,
        size: u64,
    },
    CopyQueryResults {
        results: DevAddr,
        availability: DevAddr,
        first_query: u32,
        query_count: u32,
        dst: DevAddr,
        stride: u64,
        flags: ash::vk::QueryResultFlags,
    },
}

#[derive(Debug)]
pub struct TransferSubCmd {
    pub(crate) ops: Vec<TransferOp>,
    /// The transfer must not start before the fragment work submitted before it is done.
    pub(crate) serialize_with_frag: bool,
}

impl TransferSubCmd {
    pub fn ops(&self) -> &[TransferOp] {
        &self.ops
    }

    pub fn serialize_with_frag(&self) -> bool {
        self.serialize_with_frag
    }
}

/// Synchronization action.
#[derive(Clone, Debug)]
pub enum EventSubCmd {
    Set {
        event: Arc<Event>,
        wait_for: PipelineStage,
    },
    Reset {
        event: Arc<Event>,
        wait_for: PipelineStage,
    },
    Wait {
        events: Vec<Arc<Event>>,
        wait_at: PipelineStage,
    },
    Barrier {
        in_render_pass: bool,
        wait_for: PipelineStage,
        wait_at: PipelineStage,
    },
}

/// A sub-command.
#[derive(Debug)]
pub enum SubCommand {
    Graphics(GraphicsSubCmd),
    Compute(ComputeSubCmd),
    OcclusionQuery(ComputeSubCmd),
    Transfer(TransferSubCmd),
    Event(EventSubCmd),
}

impl SubCommand {
    pub fn ty(&self) -> SubCmdType {
        match self {
            SubCommand::Graphics(_) => SubCmdType::Graphics,
            SubCommand::Compute(_) => SubCmdType::Compute,
            SubCommand::OcclusionQuery(_) => SubCmdType::OcclusionQuery,
            SubCommand::Transfer(_) => SubCmdType::Transfer,
            SubCommand::Event(_) => SubCmdType::Event,
        }
    }

    pub fn as_graphics(&self) -> Option<&GraphicsSubCmd> {
        match self {
            SubCommand::Graphics(gfx) => Some(gfx),
            _ => None,
        }
    }

    /// Compute payload of a compute or occlusion query sub-command.
    pub fn as_compute(&self) -> Option<&ComputeSubCmd> {
        match self {
            SubCommand::Compute(compute) | SubCommand::OcclusionQuery(compute) => Some(compute),
            _ => None,
        }
    }

    pub fn as_transfer(&self) -> Option<&TransferSubCmd> {
        match self {
            SubCommand::Transfer(transfer) => Some(transfer),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventSubCmd> {
        match self {
            SubCommand::Event(event) => Some(event),
            _ => None,
        }
    }

    pub(crate) fn as_graphics_mut(&mut self) -> Option<&mut GraphicsSubCmd> {
        match self {
            SubCommand::Graphics(gfx) => Some(gfx),
            _ => None,
        }
    }

    pub(crate) fn as_compute_mut(&mut self) -> Option<&mut ComputeSubCmd> {
        match self {
            SubCommand::Compute(compute) | SubCommand::OcclusionQuery(compute) => Some(compute),
            _ => None,
        }
    }

    pub(crate) fn as_transfer_mut(&mut self) -> Option<&mut TransferSubCmd> {
        match self {
            SubCommand::Transfer(transfer) => Some(transfer),
            _ => None,
        }
    }
}
