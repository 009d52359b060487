//! Shared fixtures: a program generator producing placeholder programs and a transport that
//! records what it is given.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tbdr::{
    pass::{AttachmentDescription, FramebufferCreateInfo, ImageViewCreateInfo, RenderPassCreateInfo, SubpassDescription},
    pipeline::{GraphicsPipelineCreateInfo, PipelineLayoutCreateInfo},
    program::{EotProgramInfo, LoadProgramInfo, QueryProgramKind},
    vk, ClearValue, CommandBuffer, CompiledProgram, DevAddr, Device, DeviceCreateInfo, DeviceInfo, Diagnostics,
    Framebuffer, GraphicsPipeline, HostMemory, ImageView, Job, PipelineLayout, ProgramGenerator, RenderPass,
    RenderPassBeginInfo, Result, SyncPoint, Transport,
};

pub struct Programs;

fn program(code_dw: u32, data_dw: usize, temps: u32) -> CompiledProgram {
    CompiledProgram {
        code: (0..code_dw).collect(),
        data: vec![0; data_dw],
        entry_offset: 0,
        temps,
        shareds: 0,
    }
}

impl ProgramGenerator for Programs {
    fn eot_program(&self, info: &EotProgramInfo) -> Result<CompiledProgram> {
        Ok(program(4 + 2 * info.emits.len() as u32, 0, 2))
    }
    fn pixel_event_program(&self, _eot: DevAddr) -> Result<CompiledProgram> {
        Ok(program(4, 4, 1))
    }
    fn load_program(&self, _info: &LoadProgramInfo) -> Result<CompiledProgram> {
        Ok(program(8, 0, 4))
    }
    fn background_pds_program(&self, _load: DevAddr, _consts: DevAddr, _consts_dwords: u32) -> Result<CompiledProgram> {
        Ok(program(6, 4, 2))
    }
    fn idfwdf_program(&self) -> Result<CompiledProgram> {
        Ok(CompiledProgram {
            shareds: 4,
            ..program(8, 2, 1)
        })
    }
    fn compute_fence_program(&self) -> Result<CompiledProgram> {
        Ok(program(2, 0, 0))
    }
    fn query_program(&self, _kind: QueryProgramKind) -> Result<CompiledProgram> {
        Ok(program(6, 2, 3))
    }
    fn nop_program(&self) -> Result<CompiledProgram> {
        Ok(program(1, 0, 0))
    }
}

/// Hands out increasing sync points and keeps every job.
#[derive(Default)]
pub struct Recorder {
    jobs: Mutex<Vec<(Job, Vec<SyncPoint>)>>,
}

impl Recorder {
    pub fn jobs(&self) -> Vec<(Job, Vec<SyncPoint>)> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Transport for Recorder {
    fn submit(&self, job: &Job, waits: &[SyncPoint]) -> Result<SyncPoint> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.push((job.clone(), waits.to_vec()));
        Ok(SyncPoint(jobs.len() as u64))
    }
}

pub fn device_on(memory: Arc<HostMemory>, info: DeviceInfo) -> Arc<Device> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Device::new(DeviceCreateInfo {
        info,
        diagnostics: Diagnostics::empty(),
        memory,
        programs: Arc::new(Programs),
        active_devices: 0,
    })
    .unwrap()
}

pub fn device() -> Arc<Device> {
    device_on(Arc::new(HostMemory::new()), DeviceInfo::default())
}

pub fn pass(device: &Arc<Device>, create_info: RenderPassCreateInfo) -> Arc<RenderPass> {
    RenderPass::new(device, &create_info).unwrap()
}

pub fn color_pass(device: &Arc<Device>) -> Arc<RenderPass> {
    pass(
        device,
        RenderPassCreateInfo {
            attachments: vec![AttachmentDescription::color(vk::Format::R8G8B8A8_UNORM, 1)],
            subpasses: vec![SubpassDescription {
                color_attachments: vec![0],
                ..Default::default()
            }],
        },
    )
}

pub fn framebuffer(device: &Arc<Device>, pass: &Arc<RenderPass>, width: u32, height: u32, layers: u32) -> Arc<Framebuffer> {
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

pub fn begin_info(pass: &Arc<RenderPass>, fb: &Arc<Framebuffer>) -> RenderPassBeginInfo {
    RenderPassBeginInfo {
        render_pass: pass.clone(),
        framebuffer: fb.clone(),
        render_area: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: fb.width(),
                height: fb.height(),
            },
        },
        clear_values: vec![ClearValue::default(); pass.attachments().len()],
    }
}

pub fn pipeline(device: &Arc<Device>) -> Arc<GraphicsPipeline> {
    let layout = PipelineLayout::new(PipelineLayoutCreateInfo::default());
    let mut info = GraphicsPipelineCreateInfo::new(layout);
    info.vertex_shader = program(4, 0, 2);
    info.vertex_pds = program(4, 4, 1);
    info.fragment_shader = program(4, 0, 2);
    info.fragment_pds = program(4, 4, 1);
    GraphicsPipeline::new(device, info).unwrap()
}

pub fn primary(device: &Arc<Device>) -> CommandBuffer {
    let mut cb = CommandBuffer::new(device, vk::CommandBufferLevel::PRIMARY);
    cb.begin(&Default::default()).unwrap();
    cb
}
