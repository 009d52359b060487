//! Job submission.
//!
//! The queue walks the sub-commands of executable command buffers in order and turns each into a
//! [`Job`] handed to the [`Transport`]. Ordering between jobs is expressed with [`SyncPoint`]s: the
//! queue remembers, per hardware stage, the last job submitted on it, and turns event
//! sub-commands (barriers, event set/reset/wait) into waits on those.
use crate::{
    cmd_buffer::{CommandBuffer, EventSubCmd, SubCommand},
    debug::Diagnostics,
    device::Device,
    job::{ComputeJob, ComputeSubmission, Job, RenderJob, RenderSubmission, TransferSubmission},
    query::EventStatus,
    stage::{PipelineStage, NUM_SYNC_STAGES},
    Result,
};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, trace, trace_span, warn};

/// Opaque completion primitive returned by the transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SyncPoint(pub u64);

/// Execution transport.
pub trait Transport: Send + Sync {
    /// Submits a job that starts once every sync point in `waits` is signalled. Returns the sync
    /// point signalled once the job is done.
    fn submit(&self, job: &Job, waits: &[SyncPoint]) -> Result<SyncPoint>;
}

/// Parameters of [`Queue::submit`].
#[derive(Copy, Clone, Debug, Default)]
pub struct SubmitInfo<'a> {
    /// Sync points every job of the submission waits for.
    pub waits: &'a [SyncPoint],
    pub command_buffers: &'a [&'a CommandBuffer],
}

/// Per-submission bookkeeping.
struct Submission {
    frame_num: u32,
    /// Last job submitted per stage.
    completions: [Option<SyncPoint>; NUM_SYNC_STAGES],
    /// What the next job of each stage must wait for.
    waits: [Vec<SyncPoint>; NUM_SYNC_STAGES],
}

impl Submission {
    fn new(frame_num: u32, waits: &[SyncPoint]) -> Submission {
        let mut submission = Submission {
            frame_num,
            completions: [None; NUM_SYNC_STAGES],
            waits: Default::default(),
        };
        for stage_waits in submission.waits.iter_mut() {
            stage_waits.extend_from_slice(waits);
        }
        submission
    }

    /// Removes and returns the waits of the stages in `stages`.
    fn take_waits(&mut self, stages: PipelineStage) -> Vec<SyncPoint> {
        let mut waits = Vec::new();
        for stage in stages.iter() {
            for sync in self.waits[stage.index()].drain(..) {
                if !waits.contains(&sync) {
                    waits.push(sync);
                }
            }
        }
        waits
    }

    fn add_wait(&mut self, stages: PipelineStage, sync: SyncPoint) {
        for stage in stages.iter() {
            let waits = &mut self.waits[stage.index()];
            if !waits.contains(&sync) {
                waits.push(sync);
            }
        }
    }

    fn completions_of(&self, stages: PipelineStage) -> Vec<SyncPoint> {
        let mut syncs = Vec::new();
        for stage in stages.iter() {
            if let Some(sync) = self.completions[stage.index()] {
                if !syncs.contains(&sync) {
                    syncs.push(sync);
                }
            }
        }
        syncs
    }

    fn complete(&mut self, stages: PipelineStage, sync: SyncPoint) {
        for stage in stages.iter() {
            self.completions[stage.index()] = Some(sync);
        }
    }
}

/// A hardware queue.
pub struct Queue {
    device: Arc<Device>,
    transport: Arc<dyn Transport>,
    /// Last job submitted per stage, across submissions. Also serializes submissions.
    last: Mutex<[Option<SyncPoint>; NUM_SYNC_STAGES]>,
}

impl Queue {
    pub fn new(device: &Arc<Device>, transport: Arc<dyn Transport>) -> Queue {
        Queue {
            device: device.clone(),
            transport,
            last: Mutex::new([None; NUM_SYNC_STAGES]),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn lock(&self) -> MutexGuard<[Option<SyncPoint>; NUM_SYNC_STAGES]> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits the work recorded in `info.command_buffers`.
    ///
    /// Returns a sync point signalled once all of it is done.
    pub fn submit(&self, info: &SubmitInfo) -> Result<SyncPoint> {
        let _span = trace_span!("queue_submit", command_buffers = info.command_buffers.len()).entered();
        let mut last = self.lock();
        let mut submission = Submission::new(self.device.next_frame_number(), info.waits);

        for cb in info.command_buffers {
            debug_assert!(!cb.is_secondary(), "secondary command buffers can't be submitted");
            debug_assert!(cb.error().is_none(), "submitting a command buffer that failed to record");
            for sub_cmd in cb.sub_commands() {
                self.process_sub_cmd(&mut submission, &sub_cmd)?;
            }
        }

        let done = submission.completions_of(PipelineStage::ALL);
        let signal = self.submit_job(&Job::Null, &done)?;
        for (last, completion) in last.iter_mut().zip(submission.completions.iter()) {
            if completion.is_some() {
                *last = *completion;
            }
        }
        debug!(frame = submission.frame_num, ?signal, "submission done");
        Ok(signal)
    }

    /// Returns a sync point signalled once every job submitted so far is done.
    pub fn idle_sync(&self) -> Result<SyncPoint> {
        let last = self.lock();
        let mut waits: Vec<SyncPoint> = Vec::new();
        for sync in last.iter().flatten() {
            if !waits.contains(sync) {
                waits.push(*sync);
            }
        }
        self.submit_job(&Job::Null, &waits)
    }

    fn process_sub_cmd(&self, submission: &mut Submission, sub_cmd: &SubCommand) -> Result<()> {
        match sub_cmd {
            SubCommand::Graphics(gfx) => {
                let job = match gfx.job() {
                    Some(job) => job,
                    None => {
                        warn!("graphics sub-command without a render job, skipped");
                        return Ok(());
                    }
                };
                let waits = submission.take_waits(PipelineStage::GEOM | PipelineStage::FRAG);
                match gfx.terminate_stream() {
                    Some(terminate) => {
                        // geometry of all layers first, then the fragment phase on its own stream
                        let mut geom = job.clone();
                        geom.run_frag = false;
                        geom.geometry_terminate = false;
                        let geom_sync = self.submit_render(submission, geom, &waits)?;
                        submission.complete(PipelineStage::GEOM, geom_sync);

                        let mut frag = job.clone();
                        frag.ctrl_stream_addr = terminate.start_addr();
                        let frag_sync = self.submit_render(submission, frag, &[geom_sync])?;
                        submission.complete(PipelineStage::FRAG, frag_sync);
                    }
                    None => {
                        let sync = self.submit_render(submission, job.clone(), &waits)?;
                        submission.complete(PipelineStage::GEOM | PipelineStage::FRAG, sync);
                    }
                }
            }
            SubCommand::Compute(compute) => {
                if let Some(job) = compute.job() {
                    self.submit_compute(submission, PipelineStage::COMPUTE, job)?;
                }
            }
            SubCommand::OcclusionQuery(compute) => {
                if let Some(job) = compute.job() {
                    self.submit_compute(submission, PipelineStage::OCCLUSION_QUERY, job)?;
                }
            }
            SubCommand::Transfer(transfer) => {
                let mut waits = submission.take_waits(PipelineStage::TRANSFER);
                if transfer.serialize_with_frag() {
                    for sync in submission.completions_of(PipelineStage::FRAG) {
                        if !waits.contains(&sync) {
                            waits.push(sync);
                        }
                    }
                }
                let job = Job::Transfer(TransferSubmission {
                    frame_num: submission.frame_num,
                    job_num: self.device.next_job_number(),
                    ops: transfer.ops().to_vec(),
                });
                let sync = self.submit_job(&job, &waits)?;
                submission.complete(PipelineStage::TRANSFER, sync);
            }
            SubCommand::Event(event) => self.process_event(submission, event)?,
        }
        Ok(())
    }

    fn process_event(&self, submission: &mut Submission, event: &EventSubCmd) -> Result<()> {
        match event {
            EventSubCmd::Barrier { wait_for, wait_at, .. } => {
                let src = submission.completions_of(*wait_for);
                if src.is_empty() {
                    trace!(?wait_for, ?wait_at, "barrier with no prior work");
                    return Ok(());
                }
                let sync = self.submit_job(&Job::Null, &src)?;
                submission.add_wait(*wait_at, sync);
            }
            EventSubCmd::Set { event, wait_for } => {
                let src = submission.completions_of(*wait_for);
                let sync = self.submit_job(&Job::Null, &src)?;
                event.update(EventStatus::Set, Some(sync));
            }
            EventSubCmd::Reset { event, wait_for } => {
                let src = submission.completions_of(*wait_for);
                let sync = self.submit_job(&Job::Null, &src)?;
                event.update(EventStatus::Reset, Some(sync));
            }
            EventSubCmd::Wait { events, wait_at } => {
                for event in events {
                    match event.sync() {
                        Some(sync) => submission.add_wait(*wait_at, sync),
                        None if event.status() == EventStatus::Reset => {
                            debug!("waiting on an event that is not signalled")
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn submit_render(&self, submission: &Submission, job: RenderJob, waits: &[SyncPoint]) -> Result<SyncPoint> {
        let rt_dataset = job.rt_dataset.clone();
        let run_frag = job.run_frag;
        let rt_data_idx = rt_dataset.rt_data_idx();
        let job = Job::Render(RenderSubmission {
            frame_num: submission.frame_num,
            job_num: self.device.next_job_number(),
            rt_data_idx,
            rt_data: rt_dataset.rt_data_addrs(rt_data_idx),
            job,
        });
        let sync = self.submit_job(&job, waits)?;
        rt_dataset.job_submitted(run_frag);
        Ok(sync)
    }

    fn submit_compute(&self, submission: &mut Submission, stage: PipelineStage, job: &ComputeJob) -> Result<()> {
        let waits = submission.take_waits(stage);
        let job = Job::Compute(ComputeSubmission {
            frame_num: submission.frame_num,
            job_num: self.device.next_job_number(),
            job: job.clone(),
        });
        let sync = self.submit_job(&job, &waits)?;
        submission.complete(stage, sync);
        Ok(())
    }

    fn submit_job(&self, job: &Job, waits: &[SyncPoint]) -> Result<SyncPoint> {
        if self.device.diagnostics().contains(Diagnostics::DUMP_JOBS) {
            debug!(job = %job.to_json(), ?waits, "job");
        }
        let sync = self.transport.submit(job, waits).map_err(|err| {
            warn!(%err, "job submission failed");
            err
        })?;
        trace!(?sync, waits = waits.len(), "job submitted");
        Ok(sync)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue").field("last", &*self.lock()).finish()
    }
}
