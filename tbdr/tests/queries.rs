mod common;

use std::sync::Arc;
use tbdr::{vk, DevAddr, Job, QueryPool, Queue, SubmitInfo, SyncPoint};

#[test]
fn availability_kernel_runs_after_the_render() {
    let device = common::device();
    let recorder = Arc::new(common::Recorder::default());
    let queue = Queue::new(&device, recorder.clone());
    let pass = common::color_pass(&device);
    let fb = common::framebuffer(&device, &pass, 64, 64, 1);
    let pipeline = common::pipeline(&device);
    let pool = QueryPool::new(&device, 4).unwrap();

    let mut cb = common::primary(&device);
    cb.begin_render_pass(&common::begin_info(&pass, &fb)).unwrap();
    cb.bind_graphics_pipeline(&pipeline);
    cb.begin_query(&pool, 2).unwrap();
    cb.draw(3, 1, 0, 0).unwrap();
    cb.end_query(&pool, 2).unwrap();
    cb.end_render_pass().unwrap();
    cb.copy_query_pool_results(&pool, 0, 4, DevAddr(0x1_0050_0000), 4, vk::QueryResultFlags::WAIT)
        .unwrap();
    cb.end().unwrap();

    queue
        .submit(&SubmitInfo {
            waits: &[],
            command_buffers: &[&cb],
        })
        .unwrap();
    let jobs = recorder.jobs();

    // render, fragment -> query barrier, availability kernel
    match &jobs[0].0 {
        Job::Render(render) => assert!(render.job.get_vis_results),
        other => panic!("unexpected job: {:?}", other),
    }
    assert!(matches!(jobs[1].0, Job::Null));
    assert_eq!(jobs[1].1, vec![SyncPoint(1)]);
    assert!(matches!(jobs[2].0, Job::Compute(_)));
    assert_eq!(jobs[2].1, vec![SyncPoint(2)]);

    // the copy waits on both the queries and the render
    let (copy, waits) = jobs
        .iter()
        .find(|(job, _)| matches!(job, Job::Transfer(_)))
        .unwrap();
    assert!(matches!(copy, Job::Transfer(_)));
    assert!(waits.contains(&SyncPoint(1)));
    assert!(waits.len() >= 2);
}
