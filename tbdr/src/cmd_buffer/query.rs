//! Occlusion queries.
use crate::{
    cmd_buffer::{
        compute::compute_flat_slot_size, state::DirtyFlags, CommandBuffer, EventSubCmd, SubCmdType, TransferOp,
    },
    hw::{self, cdm},
    memory::{DevAddr, Heap},
    program::{QueryProgramKind, UploadedProgram},
    query::QueryPool,
    stage::PipelineStage,
    util::{div_ceil32, dw_to_bytes},
    vk, Result,
};
use std::sync::Arc;
use tracing::{debug, trace_span};

impl CommandBuffer {
    /// Starts counting visible samples into `query`.
    pub fn begin_query(&mut self, pool: &Arc<QueryPool>, query: u32) -> Result<()> {
        let _span = trace_span!("begin_query", query).entered();
        debug_assert!(!self.state.vis_test_enabled, "occlusion queries can't be nested");
        debug_assert!(query < pool.query_count());
        self.record(|cb| {
            let current_pool = cb.current_gfx_mut().map(|gfx| gfx.query_pool.clone());
            match current_pool {
                Some(None) => {
                    if let Some(gfx) = cb.current_gfx_mut() {
                        gfx.query_pool = Some(pool.clone());
                    }
                }
                Some(Some(ref current)) if !Arc::ptr_eq(current, pool) => {
                    // results of one render go to a single pool: split the render
                    debug!("query pool changed within a render");
                    if let Some(gfx) = cb.current_gfx_mut() {
                        gfx.barrier_store = true;
                    }
                    cb.end_sub_cmd()?;
                    cb.start_sub_cmd(SubCmdType::Graphics)?;
                    if let Some(gfx) = cb.current_gfx_mut() {
                        gfx.barrier_load = true;
                        gfx.query_pool = Some(pool.clone());
                    }
                }
                _ => {}
            }
            cb.state.query_pool = Some(pool.clone());
            cb.state.vis_test_enabled = true;
            cb.state.vis_reg = query;
            cb.state.dirty |= DirtyFlags::VIS_TEST;
            cb.state.add_query_index(query);
            Ok(())
        })
    }

    pub fn end_query(&mut self, _pool: &Arc<QueryPool>, _query: u32) -> Result<()> {
        let _span = trace_span!("end_query").entered();
        self.record(|cb| {
            cb.state.vis_test_enabled = false;
            cb.state.dirty |= DirtyFlags::VIS_TEST;
            Ok(())
        })
    }

    /// Zeroes the results and availability of `query_count` queries starting at `first_query`.
    pub fn reset_query_pool(&mut self, pool: &Arc<QueryPool>, first_query: u32, query_count: u32) -> Result<()> {
        let _span = trace_span!("reset_query_pool").entered();
        debug_assert!(first_query + query_count <= pool.query_count());
        self.record(|cb| {
            // don't overwrite counters still being written
            cb.add_event(EventSubCmd::Barrier {
                in_render_pass: false,
                wait_for: PipelineStage::ALL_GRAPHICS,
                wait_at: PipelineStage::OCCLUSION_QUERY,
            })?;
            let offset = first_query as u64 * 4;
            let results = pool.results_addr().offset(offset);
            let availability = pool.availability_addr().offset(offset);
            let args = [results.lo(), results.hi(), availability.lo(), availability.hi(), query_count];
            cb.emit_query_program(QueryProgramKind::Reset, &args)?;
            // later renders count from zero
            cb.add_event(EventSubCmd::Barrier {
                in_render_pass: false,
                wait_for: PipelineStage::OCCLUSION_QUERY,
                wait_at: PipelineStage::ALL_GRAPHICS,
            })
        })
    }

    /// Copies query results to `dst`, `stride` bytes apart.
    pub fn copy_query_pool_results(
        &mut self,
        pool: &Arc<QueryPool>,
        first_query: u32,
        query_count: u32,
        dst: DevAddr,
        stride: u64,
        flags: vk::QueryResultFlags,
    ) -> Result<()> {
        let _span = trace_span!("copy_query_pool_results").entered();
        debug_assert!(first_query + query_count <= pool.query_count());
        self.record(|cb| {
            cb.add_event(EventSubCmd::Barrier {
                in_render_pass: false,
                wait_for: PipelineStage::FRAG | PipelineStage::OCCLUSION_QUERY,
                wait_at: PipelineStage::TRANSFER,
            })?;
            cb.start_sub_cmd(SubCmdType::Transfer)?;
            if let Some(transfer) = cb.current.as_mut().and_then(|s| s.as_transfer_mut()) {
                transfer.serialize_with_frag = true;
                transfer.ops.push(TransferOp::CopyQueryResults {
                    results: pool.results_addr(),
                    availability: pool.availability_addr(),
                    first_query,
                    query_count,
                    dst,
                    stride,
                    flags,
                });
            }
            Ok(())
        })
    }

    /// Makes the queries of a finished render available once its fragment work is done.
    pub(crate) fn add_query_availability(&mut self, pool: &Arc<QueryPool>, indices: &[u32]) -> Result<()> {
        let indices_addr = self.upload(Heap::General, indices)?;
        let availability = pool.availability_addr();
        self.add_event(EventSubCmd::Barrier {
            in_render_pass: false,
            wait_for: PipelineStage::FRAG,
            wait_at: PipelineStage::OCCLUSION_QUERY,
        })?;
        let args = [
            indices_addr.lo(),
            indices_addr.hi(),
            indices.len() as u32,
            availability.lo(),
            availability.hi(),
        ];
        self.emit_query_program(QueryProgramKind::Availability, &args)
    }

    /// Records a query kernel in its own occlusion query sub-command.
    fn emit_query_program(&mut self, kind: QueryProgramKind, args: &[u32]) -> Result<()> {
        self.end_sub_cmd()?;
        self.start_sub_cmd(SubCmdType::OcclusionQuery)?;

        let helpers = &self.device.helpers;
        let program: &UploadedProgram = match kind {
            QueryProgramKind::Availability => &helpers.query_availability,
            QueryProgramKind::Reset => &helpers.query_reset,
        };
        let code_addr = program.code_addr();
        let temps = program.temps;
        let data = query_program_data(program.data_words(), args);
        let data_addr = self.upload(Heap::Pds, &data)?;

        let kernel = cdm::KernelInfo {
            usc_target: cdm::USC_TARGET_ANY,
            sd_type: cdm::SD_TYPE_NONE,
            pds_temp_size: div_ceil32(temps << 2, hw::PDS_TEMP_SIZE_UNIT_SIZE),
            pds_data_size: div_ceil32(dw_to_bytes(data.len() as u32), hw::PDS_DATA_SIZE_UNIT_SIZE),
            pds_data_offset: data_addr.lo(),
            pds_code_offset: code_addr.lo(),
            global_size: [1, 1, 1],
            local_size: [1, 1, 1],
            max_instances: compute_flat_slot_size(self.device.info(), 0, false, 1),
            ..Default::default()
        };
        self.with_current_compute(|_, compute| {
            compute.csb.set_relocation_mark();
            compute.csb.emit(&cdm::kernel(&kernel))?;
            compute.csb.clear_relocation_mark();
            Ok(())
        })?;
        self.end_sub_cmd()
    }
}

/// PDS data of a query kernel: the program's data segment, followed by its arguments.
fn query_program_data(template: &[u32], args: &[u32]) -> Vec<u32> {
    let mut data = Vec::with_capacity(template.len() + args.len());
    data.extend_from_slice(template);
    data.extend_from_slice(args);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cmd_buffer::{BeginInfo, ClearValue, RenderPassBeginInfo, SubCommand},
        testing,
    };

    fn begin_pass(cb: &mut CommandBuffer, device: &Arc<crate::device::Device>) {
        let pass = testing::single_color_pass(device, vk::Format::R8G8B8A8_UNORM, 1);
        let fb = testing::framebuffer(device, &pass, 64, 64, 1);
        cb.begin_render_pass(&RenderPassBeginInfo {
            render_pass: pass,
            framebuffer: fb,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width: 64, height: 64 },
            },
            clear_values: vec![ClearValue::default()],
        })
        .unwrap();
    }

    #[test]
    fn render_with_queries_is_followed_by_availability() {
        let device = testing::device();
        let pool = QueryPool::new(&device, 8).unwrap();
        let pipeline = testing::graphics_pipeline(&device);
        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        begin_pass(&mut cb, &device);
        cb.bind_graphics_pipeline(&pipeline);
        cb.begin_query(&pool, 3).unwrap();
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end_query(&pool, 3).unwrap();
        cb.end_render_pass().unwrap();
        cb.end().unwrap();

        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        let types: Vec<_> = sub_cmds.iter().map(|s| s.ty()).collect();
        assert_eq!(
            types,
            vec![SubCmdType::Graphics, SubCmdType::Event, SubCmdType::OcclusionQuery]
        );
        let gfx = sub_cmds[0].as_graphics().unwrap();
        assert!(gfx.has_occlusion_query());
        assert!(gfx.job().unwrap().get_vis_results);
        match &*sub_cmds[1] {
            SubCommand::Event(EventSubCmd::Barrier { wait_for, wait_at, .. }) => {
                assert_eq!(*wait_for, PipelineStage::FRAG);
                assert_eq!(*wait_at, PipelineStage::OCCLUSION_QUERY);
            }
            other => panic!("unexpected sub-command: {:?}", other),
        }
        assert!(sub_cmds[2].as_compute().unwrap().job().is_some());
    }

    #[test]
    fn reset_is_fenced_on_both_sides() {
        let device = testing::device();
        let pool = QueryPool::new(&device, 4).unwrap();
        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.reset_query_pool(&pool, 0, 4).unwrap();
        cb.end().unwrap();
        let types: Vec<_> = cb.sub_commands().map(|s| s.ty()).collect();
        assert_eq!(
            types,
            vec![SubCmdType::Event, SubCmdType::OcclusionQuery, SubCmdType::Event]
        );
    }

    #[test]
    fn copy_results_waits_for_fragment_work() {
        let device = testing::device();
        let pool = QueryPool::new(&device, 4).unwrap();
        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.copy_query_pool_results(&pool, 1, 2, DevAddr(0x1_0000_0100), 8, vk::QueryResultFlags::WAIT)
            .unwrap();
        cb.end().unwrap();
        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        assert_eq!(sub_cmds.len(), 2);
        let transfer = sub_cmds[1].as_transfer().unwrap();
        assert!(transfer.serialize_with_frag());
        assert!(matches!(
            transfer.ops()[0],
            TransferOp::CopyQueryResults { first_query: 1, query_count: 2, stride: 8, .. }
        ));
    }

    #[test]
    fn query_data_appends_arguments() {
        assert_eq!(query_program_data(&[7, 8], &[1, 2, 3]), vec![7, 8, 1, 2, 3]);
    }
}
