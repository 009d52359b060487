mod common;

use std::{collections::HashSet, sync::Arc};
use tbdr::{
    job::ComputeSubmission,
    pipeline::ComputePipelineCreateInfo,
    vk, CompiledProgram, ComputePipeline, DevAddr, DependencyInfo, Device, Job, PipelineLayout, Queue,
    SubmitInfo, SyncPoint,
};

fn compute_pipeline(device: &Arc<Device>) -> Arc<ComputePipeline> {
    let layout = PipelineLayout::new(Default::default());
    let mut info = ComputePipelineCreateInfo::new(layout, [16, 1, 1]);
    info.kernel_pds = CompiledProgram {
        code: vec![0; 4],
        data: vec![0; 8],
        ..Default::default()
    };
    ComputePipeline::new(device, info).unwrap()
}

fn kind(job: &Job) -> &'static str {
    match job {
        Job::Render(_) => "render",
        Job::Compute(_) => "compute",
        Job::Transfer(_) => "transfer",
        Job::Null => "null",
    }
}

#[test]
fn compute_results_are_copied_after_a_barrier() {
    let device = common::device();
    let recorder = Arc::new(common::Recorder::default());
    let queue = Queue::new(&device, recorder.clone());

    let mut cb = common::primary(&device);
    cb.bind_compute_pipeline(&compute_pipeline(&device));
    cb.dispatch([8, 8, 1]).unwrap();
    cb.pipeline_barrier(&DependencyInfo {
        src_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
        dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
        ..Default::default()
    })
    .unwrap();
    cb.copy_buffer(DevAddr(0x1_0030_0000), DevAddr(0x1_0031_0000), 4096).unwrap();
    cb.end().unwrap();

    let done = queue
        .submit(&SubmitInfo {
            waits: &[],
            command_buffers: &[&cb],
        })
        .unwrap();

    let jobs = recorder.jobs();
    let kinds: Vec<_> = jobs.iter().map(|(job, _)| kind(job)).collect();
    assert_eq!(kinds, vec!["compute", "null", "transfer", "null"]);
    assert!(jobs[0].1.is_empty());
    assert_eq!(jobs[1].1, vec![SyncPoint(1)]);
    assert_eq!(jobs[2].1, vec![SyncPoint(2)]);
    assert_eq!(done, SyncPoint(4));
}

#[test]
fn jobs_of_one_submission_share_a_frame_number() {
    let device = common::device();
    let recorder = Arc::new(common::Recorder::default());
    let queue = Queue::new(&device, recorder.clone());
    let pass = common::color_pass(&device);
    let fb = common::framebuffer(&device, &pass, 64, 64, 1);
    let pipeline = common::pipeline(&device);

    let mut render = common::primary(&device);
    render.begin_render_pass(&common::begin_info(&pass, &fb)).unwrap();
    render.bind_graphics_pipeline(&pipeline);
    render.draw(3, 1, 0, 0).unwrap();
    render.end_render_pass().unwrap();
    render.end().unwrap();

    let mut compute = common::primary(&device);
    compute.bind_compute_pipeline(&compute_pipeline(&device));
    compute.dispatch([1, 1, 1]).unwrap();
    compute.end().unwrap();

    for _ in 0..2 {
        queue
            .submit(&SubmitInfo {
                waits: &[],
                command_buffers: &[&render, &compute],
            })
            .unwrap();
    }

    let mut frames = Vec::new();
    let mut job_nums = HashSet::new();
    for (job, _) in recorder.jobs() {
        match job {
            Job::Render(r) => {
                frames.push(r.frame_num);
                assert!(job_nums.insert(r.job_num));
            }
            Job::Compute(ComputeSubmission { frame_num, job_num, .. }) => {
                frames.push(frame_num);
                assert!(job_nums.insert(job_num));
            }
            _ => {}
        }
    }
    assert_eq!(frames, vec![1, 1, 2, 2]);
}

#[test]
fn idle_sync_waits_for_every_stage() {
    let device = common::device();
    let recorder = Arc::new(common::Recorder::default());
    let queue = Queue::new(&device, recorder.clone());
    let pass = common::color_pass(&device);
    let fb = common::framebuffer(&device, &pass, 64, 64, 1);

    let mut cb = common::primary(&device);
    cb.begin_render_pass(&common::begin_info(&pass, &fb)).unwrap();
    cb.end_render_pass().unwrap();
    cb.fill_buffer(DevAddr(0x1_0040_0000), 64, 0).unwrap();
    cb.end().unwrap();
    queue
        .submit(&SubmitInfo {
            waits: &[SyncPoint(1000)],
            command_buffers: &[&cb],
        })
        .unwrap();

    let idle = queue.idle_sync().unwrap();
    let jobs = recorder.jobs();
    let (last, waits) = jobs.last().unwrap();
    assert!(matches!(last, Job::Null));
    assert_eq!(idle, SyncPoint(jobs.len() as u64));
    // the render and the fill
    assert_eq!(waits.len(), 2);
    assert!(waits.contains(&SyncPoint(1)));
    assert!(waits.contains(&SyncPoint(2)));
}
