//! Test fixtures: a fake program generator, a recording transport and object builders.
use crate::{
    debug::Diagnostics,
    device::{Device, DeviceCreateInfo, DeviceInfo},
    job::Job,
    memory::{DevAddr, HostMemory},
    pass::{
        AttachmentDescription, Framebuffer, FramebufferCreateInfo, ImageView, ImageViewCreateInfo, RenderPass,
        RenderPassCreateInfo, SubpassDescription,
    },
    pipeline::{GraphicsPipeline, GraphicsPipelineCreateInfo, PipelineLayout, PipelineLayoutCreateInfo},
    program::{CompiledProgram, EotProgramInfo, LoadProgramInfo, ProgramGenerator, QueryProgramKind},
    queue::{SyncPoint, Transport},
    vk, Error, Result,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

/// Returns programs of plausible shape with meaningless contents.
pub(crate) struct FakePrograms;

fn program(code_dw: usize, data_dw: usize, temps: u32, shareds: u32) -> CompiledProgram {
    CompiledProgram {
        code: (0..code_dw as u32).collect(),
        data: vec![0; data_dw],
        entry_offset: 0,
        temps,
        shareds,
    }
}

impl ProgramGenerator for FakePrograms {
    fn eot_program(&self, info: &EotProgramInfo) -> Result<CompiledProgram> {
        Ok(program(4 + 2 * info.emits.len(), 0, 2, 0))
    }

    fn pixel_event_program(&self, _eot: DevAddr) -> Result<CompiledProgram> {
        Ok(program(4, 4, 1, 0))
    }

    fn load_program(&self, _info: &LoadProgramInfo) -> Result<CompiledProgram> {
        Ok(program(8, 0, 4, 0))
    }

    fn background_pds_program(&self, _load: DevAddr, _consts: DevAddr, _consts_dwords: u32) -> Result<CompiledProgram> {
        Ok(program(6, 4, 2, 0))
    }

    fn idfwdf_program(&self) -> Result<CompiledProgram> {
        Ok(program(8, 2, 1, 4))
    }

    fn compute_fence_program(&self) -> Result<CompiledProgram> {
        Ok(program(2, 0, 0, 0))
    }

    fn query_program(&self, _kind: QueryProgramKind) -> Result<CompiledProgram> {
        Ok(program(6, 2, 3, 0))
    }

    fn nop_program(&self) -> Result<CompiledProgram> {
        Ok(program(1, 0, 0, 0))
    }
}

/// Transport that records the jobs it receives. The n-th job returns `SyncPoint(n)`, starting
/// at 1.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    jobs: Mutex<Vec<(Job, Vec<SyncPoint>)>>,
    next: AtomicU64,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn jobs(&self) -> Vec<(Job, Vec<SyncPoint>)> {
        self.jobs.lock().unwrap().clone()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl Transport for RecordingTransport {
    fn submit(&self, job: &Job, waits: &[SyncPoint]) -> Result<SyncPoint> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::SubmissionFailed);
        }
        let sync = SyncPoint(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.jobs.lock().unwrap().push((job.clone(), waits.to_vec()));
        Ok(sync)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub(crate) fn device() -> Arc<Device> {
    device_with(DeviceInfo::default(), Diagnostics::empty(), 0)
}

pub(crate) fn device_with(info: DeviceInfo, diagnostics: Diagnostics, active_devices: u32) -> Arc<Device> {
    init_tracing();
    Device::new(DeviceCreateInfo {
        info,
        diagnostics,
        memory: Arc::new(HostMemory::new()),
        programs: Arc::new(FakePrograms),
        active_devices,
    })
    .unwrap()
}

/// A device allocating from `memory`, so that tests can inspect what was written.
pub(crate) fn device_on(memory: Arc<HostMemory>) -> Arc<Device> {
    init_tracing();
    Device::new(DeviceCreateInfo {
        info: DeviceInfo::default(),
        diagnostics: Diagnostics::empty(),
        memory,
        programs: Arc::new(FakePrograms),
        active_devices: 0,
    })
    .unwrap()
}

/// A single subpass rendering to one cleared color attachment.
pub(crate) fn single_color_pass(device: &Arc<Device>, format: vk::Format, samples: u32) -> Arc<RenderPass> {
    RenderPass::new(
        device,
        &RenderPassCreateInfo {
            attachments: vec![AttachmentDescription::color(format, samples)],
            subpasses: vec![SubpassDescription {
                color_attachments: vec![0],
                ..Default::default()
            }],
        },
    )
    .unwrap()
}

pub(crate) fn image_view(device: &Arc<Device>, format: vk::Format, width: u32, height: u32) -> Arc<ImageView> {
    ImageView::new(
        device,
        &ImageViewCreateInfo {
            format,
            samples: 1,
            width,
            height,
            layers: 1,
        },
    )
    .unwrap()
}

/// A framebuffer with one fresh image view per attachment of `pass`.
pub(crate) fn framebuffer(
    device: &Arc<Device>,
    pass: &Arc<RenderPass>,
    width: u32,
    height: u32,
    layers: u32,
) -> Arc<Framebuffer> {
    let attachments = pass
        .attachments()
        .iter()
        .map(|a| {
            ImageView::new(
                device,
                &ImageViewCreateInfo {
                    format: a.format,
                    samples: a.samples,
                    width,
                    height,
                    layers,
                },
            )
            .unwrap()
        })
        .collect();
    Framebuffer::new(
        device,
        FramebufferCreateInfo {
            render_pass: pass.clone(),
            attachments,
            width,
            height,
            layers,
        },
    )
    .unwrap()
}

/// A pipeline drawing triangle lists with no culling and no depth test.
pub(crate) fn graphics_pipeline(device: &Arc<Device>) -> Arc<GraphicsPipeline> {
    let layout = PipelineLayout::new(PipelineLayoutCreateInfo::default());
    let mut info = GraphicsPipelineCreateInfo::new(layout);
    info.vertex_shader = program(4, 0, 2, 0);
    info.vertex_pds = program(4, 4, 1, 0);
    info.fragment_shader = program(4, 0, 2, 0);
    info.fragment_pds = program(4, 4, 1, 0);
    GraphicsPipeline::new(device, info).unwrap()
}
