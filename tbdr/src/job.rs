//! Job descriptors.
//!
//! [`RenderJob`] and [`ComputeJob`] are filled in when a sub-command is closed. At submission the
//! queue wraps them into a [`Job`] together with per-submission data (counters, RT data slot) and
//! hands it to the transport.
use crate::{
    cmd_buffer::TransferOp,
    hw::{NUM_PBESTATE_REG_WORDS, NUM_PBESTATE_STATE_WORDS, NUM_PDS_BGND_WORDS},
    memory::DevAddr,
    rt_dataset::{RenderTargetDataset, RtDataAddrs},
};
use serde_json::json;
use std::sync::Arc;

/// Depth/stencil attachment handling of a render.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DepthStencilJobInfo {
    pub addr: DevAddr,
    pub stride: u32,
    pub has_depth: bool,
    pub has_stencil: bool,
    pub depth_load: bool,
    pub depth_store: bool,
    pub stencil_load: bool,
    pub stencil_store: bool,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl Default for DepthStencilJobInfo {
    fn default() -> Self {
        DepthStencilJobInfo {
            addr: DevAddr::INVALID,
            stride: 0,
            has_depth: false,
            has_stencil: false,
            depth_load: false,
            depth_store: false,
            stencil_load: false,
            stencil_store: false,
            clear_depth: 1.0,
            clear_stencil: 0xffff_ffff,
        }
    }
}

/// Geometry and fragment work of one graphics sub-command.
#[derive(Clone, Debug)]
pub struct RenderJob {
    pub rt_dataset: Arc<RenderTargetDataset>,
    pub ctrl_stream_addr: DevAddr,
    pub depth_bias_table_addr: DevAddr,
    pub scissor_table_addr: DevAddr,

    /// End of render PBE state.
    pub pbe_state_words: Vec<[u32; NUM_PBESTATE_STATE_WORDS]>,
    pub pbe_reg_words: Vec<[u32; NUM_PBESTATE_REG_WORDS]>,
    pub pds_pixel_event_data: DevAddr,
    /// Partial render PBE state (always the SPM store).
    pub pr_pbe_state_words: Vec<[u32; NUM_PBESTATE_STATE_WORDS]>,
    pub pr_pbe_reg_words: Vec<[u32; NUM_PBESTATE_REG_WORDS]>,
    pub pr_pds_pixel_event_data: DevAddr,

    pub pds_bgnd_reg_values: [u32; NUM_PDS_BGND_WORDS],
    /// Background object used to resume after a partial render (always the SPM reload).
    pub pr_pds_bgnd_reg_values: [u32; NUM_PDS_BGND_WORDS],
    pub enable_bg_tag: bool,
    pub process_empty_tiles: bool,

    pub ds: DepthStencilJobInfo,
    pub samples: u32,
    /// 0 means the default for the partition store.
    pub max_tiles_in_flight: u32,
    pub max_shared_registers: u32,
    pub disable_compute_overlap: bool,
    pub requires_spm_scratch_buffer: bool,
    pub get_vis_results: bool,
    pub run_frag: bool,
    pub geometry_terminate: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputeJob {
    pub ctrl_stream_addr: DevAddr,
    pub max_shared_registers: u32,
    /// The kernels use workgroup barriers; no other compute work may overlap.
    pub prevent_all_overlap: bool,
}

/// A render job as submitted.
#[derive(Clone, Debug)]
pub struct RenderSubmission {
    pub frame_num: u32,
    pub job_num: u32,
    pub rt_data_idx: usize,
    pub rt_data: RtDataAddrs,
    pub job: RenderJob,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputeSubmission {
    pub frame_num: u32,
    pub job_num: u32,
    pub job: ComputeJob,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferSubmission {
    pub frame_num: u32,
    pub job_num: u32,
    pub ops: Vec<TransferOp>,
}

/// Work handed to the transport.
#[derive(Clone, Debug)]
pub enum Job {
    Render(RenderSubmission),
    Compute(ComputeSubmission),
    Transfer(TransferSubmission),
    /// No work, only merges its waits into a single sync point.
    Null,
}

impl Job {
    /// Renders the descriptor as JSON, for diagnostics.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Job::Render(r) => {
                let job = &r.job;
                json!({
                    "type": "render",
                    "frame": r.frame_num,
                    "job": r.job_num,
                    "rtDataIdx": r.rt_data_idx,
                    "rtData": {
                        "mta": format!("{:?}", r.rt_data.mta),
                        "mlist": format!("{:?}", r.rt_data.mlist),
                        "rgnHeaders": format!("{:?}", r.rt_data.rgn_headers),
                        "rtc": format!("{:?}", r.rt_data.rtc),
                    },
                    "ctrlStream": format!("{:?}", job.ctrl_stream_addr),
                    "depthBiasTable": format!("{:?}", job.depth_bias_table_addr),
                    "scissorTable": format!("{:?}", job.scissor_table_addr),
                    "pbeStateWords": job.pbe_state_words,
                    "pbeRegWords": job.pbe_reg_words,
                    "pdsPixelEventData": format!("{:?}", job.pds_pixel_event_data),
                    "prPdsPixelEventData": format!("{:?}", job.pr_pds_pixel_event_data),
                    "pdsBgndRegValues": job.pds_bgnd_reg_values,
                    "prPdsBgndRegValues": job.pr_pds_bgnd_reg_values,
                    "enableBgTag": job.enable_bg_tag,
                    "processEmptyTiles": job.process_empty_tiles,
                    "depthStencil": {
                        "hasDepth": job.ds.has_depth,
                        "hasStencil": job.ds.has_stencil,
                        "depthLoad": job.ds.depth_load,
                        "depthStore": job.ds.depth_store,
                        "stencilLoad": job.ds.stencil_load,
                        "stencilStore": job.ds.stencil_store,
                    },
                    "samples": job.samples,
                    "maxTilesInFlight": job.max_tiles_in_flight,
                    "maxSharedRegisters": job.max_shared_registers,
                    "requiresSpmScratchBuffer": job.requires_spm_scratch_buffer,
                    "getVisResults": job.get_vis_results,
                    "runFrag": job.run_frag,
                    "geometryTerminate": job.geometry_terminate,
                })
            }
            Job::Compute(c) => json!({
                "type": "compute",
                "frame": c.frame_num,
                "job": c.job_num,
                "ctrlStream": format!("{:?}", c.job.ctrl_stream_addr),
                "maxSharedRegisters": c.job.max_shared_registers,
                "preventAllOverlap": c.job.prevent_all_overlap,
            }),
            Job::Transfer(t) => json!({
                "type": "transfer",
                "frame": t.frame_num,
                "job": t.job_num,
                "ops": t.ops.iter().map(|op| format!("{:?}", op)).collect::<Vec<_>>(),
            }),
            Job::Null => json!({ "type": "null" }),
        }
    }
}
