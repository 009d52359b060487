//! Compute dispatches and compute control stream helpers.
use crate::{
    cmd_buffer::{draw::patch_descriptor_data, state::DirtyFlags, CommandBuffer, ComputeSubCmd, SubCmdType},
    device::DeviceInfo,
    hw::{
        self,
        cdm::{self, KernelInfo},
        CDM_MAX_PACKED_WORKGROUPS_PER_TASK, MAX_INSTANCES_PER_TASK, MAX_OVERLAPPED_PIXEL_TASK_INSTANCES,
        PIXEL_ALLOCATION_SIZE_MAX_IN_BLOCKS, USC_COMMON_SIZE_UNIT_SIZE,
    },
    job::ComputeJob,
    memory::{DevAddr, Heap},
    pipeline::ComputePipeline,
    util::{align32, div_ceil32, dw_to_bytes},
    vk, Result,
};
use std::sync::Arc;
use tracing::{trace, trace_span};

/// Number of instances a compute slot can hold.
///
/// Limits the number of workgroups packed in a task by the coefficient registers they need,
/// leaving room for overlapping pixel tasks where the hardware requires it. With barriers (or on
/// cores that can't split workgroups across tasks) only whole workgroups are packed.
pub fn compute_flat_slot_size(
    info: &DeviceInfo,
    coeff_regs_count: u32,
    use_barrier: bool,
    total_workitems: u32,
) -> u32 {
    let mut max_workgroups_per_task = CDM_MAX_PACKED_WORKGROUPS_PER_TASK;
    let max_avail_coeff_regs = info.cdm_max_local_mem_size_regs;
    let localstore_chunks_count = div_ceil32(dw_to_bytes(coeff_regs_count), USC_COMMON_SIZE_UNIT_SIZE);

    if coeff_regs_count > 0 {
        if info.has_quirk_52354 && (info.compute_overlap || info.gs_rta_support) {
            // n + (2n + 7) * (local_size - 1) = pool_size - 7 * pixel_allocation_size
            let max_common_store_blocks = div_ceil32(max_avail_coeff_regs * 4, USC_COMMON_SIZE_UNIT_SIZE)
                .saturating_sub(MAX_OVERLAPPED_PIXEL_TASK_INSTANCES * PIXEL_ALLOCATION_SIZE_MAX_IN_BLOCKS)
                .saturating_sub(MAX_OVERLAPPED_PIXEL_TASK_INSTANCES * (localstore_chunks_count - 1));
            max_workgroups_per_task = (max_common_store_blocks / (1 + 2 * (localstore_chunks_count - 1)))
                .min(CDM_MAX_PACKED_WORKGROUPS_PER_TASK);
        } else {
            max_workgroups_per_task = (max_avail_coeff_regs / coeff_regs_count).min(max_workgroups_per_task);
        }
    }
    let max_workgroups_per_task = max_workgroups_per_task.max(1);

    if total_workitems >= MAX_INSTANCES_PER_TASK {
        // the workgroup was padded to a multiple of the task size
        return MAX_INSTANCES_PER_TASK;
    }

    if info.has_quirk_49032 || use_barrier {
        let max_workgroups_per_task = max_workgroups_per_task.min(MAX_INSTANCES_PER_TASK / total_workitems.max(1));
        return total_workitems * max_workgroups_per_task;
    }

    (total_workitems * max_workgroups_per_task).min(MAX_INSTANCES_PER_TASK)
}

/// Pads a workgroup to a whole number of tasks when it spans more than one task or when its
/// coefficient usage would starve other slots.
pub fn compute_flat_pad_workgroup_size(info: &DeviceInfo, workgroup_size: u32, coeff_regs_count: u32) -> u32 {
    let max_avail_coeff_regs = info.cdm_max_local_mem_size_regs;
    let coeff_regs_count_aligned = align32(coeff_regs_count, USC_COMMON_SIZE_UNIT_SIZE >> 2);

    if workgroup_size > MAX_INSTANCES_PER_TASK || coeff_regs_count_aligned > max_avail_coeff_regs / 8 {
        debug_assert!(workgroup_size <= hw::COMPUTE_MAX_WORK_GROUP_SIZE);
        return align32(workgroup_size, MAX_INSTANCES_PER_TASK);
    }
    workgroup_size
}

impl CommandBuffer {
    pub fn bind_compute_pipeline(&mut self, pipeline: &Arc<ComputePipeline>) {
        self.state.compute_pipeline = Some(pipeline.clone());
        self.state.dirty |= DirtyFlags::COMPUTE_PIPELINE;
    }

    /// Dispatches `group_count` workgroups. Does nothing if any dimension is zero.
    pub fn dispatch(&mut self, group_count: [u32; 3]) -> Result<()> {
        let _span = trace_span!("dispatch").entered();
        if group_count.iter().any(|&c| c == 0) {
            return Ok(());
        }
        self.record(|cb| cb.record_dispatch(None, group_count))
    }

    /// Dispatches with the workgroup counts read from `addr`.
    pub fn dispatch_indirect(&mut self, addr: DevAddr) -> Result<()> {
        let _span = trace_span!("dispatch_indirect").entered();
        self.record(|cb| cb.record_dispatch(Some(addr), [1, 1, 1]))
    }

    fn record_dispatch(&mut self, indirect: Option<DevAddr>, group_count: [u32; 3]) -> Result<()> {
        let pipeline = match self.state.compute_pipeline.clone() {
            Some(pipeline) => pipeline,
            None => panic!("dispatch without a compute pipeline"),
        };
        self.start_sub_cmd(SubCmdType::Compute)?;

        if self.state.push_constants.dirty_stages.contains(vk::ShaderStageFlags::COMPUTE) {
            self.upload_push_constants()?;
            self.state.dirty |= DirtyFlags::COMPUTE_DESC_SETS;
            self.state.push_constants.dirty_stages &= !vk::ShaderStageFlags::COMPUTE;
        }

        if self
            .state
            .dirty
            .intersects(DirtyFlags::COMPUTE_DESC_SETS | DirtyFlags::COMPUTE_PIPELINE)
            || !self.state.compute_pds_data.is_valid()
        {
            let descriptor_table = self.upload_descriptor_table(true)?;
            let push_constants = self.state.push_constants.uploaded.unwrap_or(DevAddr::INVALID);
            let data = patch_descriptor_data(
                &pipeline.kernel_pds_data,
                &pipeline.descriptors,
                descriptor_table,
                push_constants,
            );
            self.state.compute_pds_data = self.upload(Heap::Pds, &data)?;
        }

        self.with_current_compute(|cb, compute| {
            compute.uses_barrier |= pipeline.uses_barrier;
            cb.update_shared(compute, &pipeline)?;
            cb.update_kernel(compute, &pipeline, indirect, group_count)
        })?;
        self.state.dirty &= !(DirtyFlags::COMPUTE_DESC_SETS | DirtyFlags::COMPUTE_PIPELINE);
        Ok(())
    }

    /// Emits the kernel allocating (and loading) the constant shared registers of a pipeline.
    fn update_shared(&mut self, compute: &mut ComputeSubCmd, pipeline: &ComputePipeline) -> Result<()> {
        let const_shared_regs = pipeline.const_shared_regs_count;
        if const_shared_regs == 0 {
            return Ok(());
        }
        self.state.max_shared_regs = self.state.max_shared_regs.max(const_shared_regs);

        // without constants to load, the nop program still performs the allocation
        let program = match pipeline.shared_update_pds {
            Some(ref program) => program,
            None => &self.device.helpers.nop,
        };
        let info = KernelInfo {
            sd_type: cdm::SD_TYPE_NONE,
            usc_target: cdm::USC_TARGET_ALL,
            usc_common_shared: true,
            usc_common_size: div_ceil32(const_shared_regs, USC_COMMON_SIZE_UNIT_SIZE),
            pds_data_offset: program.data_addr().lo(),
            pds_data_size: div_ceil32(dw_to_bytes(program.data_size_dw), hw::PDS_DATA_SIZE_UNIT_SIZE),
            pds_code_offset: program.code_addr().lo(),
            local_size: [1, 1, 1],
            global_size: [1, 1, 1],
            max_instances: compute_flat_slot_size(self.device.info(), const_shared_regs, false, 1),
            ..Default::default()
        };
        emit_kernel(compute, &info)
    }

    fn update_kernel(
        &mut self,
        compute: &mut ComputeSubCmd,
        pipeline: &ComputePipeline,
        indirect: Option<DevAddr>,
        group_count: [u32; 3],
    ) -> Result<()> {
        let info = self.device.info();
        let mut work_size = pipeline.workgroup_invocations();
        let mut coeff_regs = if work_size > MAX_INSTANCES_PER_TASK {
            // a single workgroup per cluster, through allocation starvation
            info.cdm_max_local_mem_size_regs
        } else {
            pipeline.coeff_regs_count
        };
        let usc_common_size = div_ceil32(dw_to_bytes(coeff_regs), USC_COMMON_SIZE_UNIT_SIZE);

        // a whole slot per workgroup
        work_size = work_size.max(MAX_INSTANCES_PER_TASK);
        coeff_regs += pipeline.const_shared_regs_count;
        work_size = compute_flat_pad_workgroup_size(info, work_size, coeff_regs);

        let kernel = KernelInfo {
            indirect_buffer_addr: indirect,
            usc_target: cdm::USC_TARGET_ANY,
            pds_temp_size: div_ceil32(pipeline.kernel_pds.temps << 2, hw::PDS_TEMP_SIZE_UNIT_SIZE),
            pds_data_size: div_ceil32(
                dw_to_bytes(pipeline.kernel_pds_data.len() as u32),
                hw::PDS_DATA_SIZE_UNIT_SIZE,
            ),
            pds_data_offset: self.state.compute_pds_data.lo(),
            pds_code_offset: pipeline.kernel_pds.code_addr().lo(),
            sd_type: if pipeline.const_shared_regs_count > 0 {
                cdm::SD_TYPE_USC
            } else {
                cdm::SD_TYPE_NONE
            },
            usc_unified_size: div_ceil32(pipeline.shader.temps << 2, hw::USC_UNIFIED_SIZE_UNIT_SIZE),
            usc_common_size,
            global_size: group_count,
            local_size: [work_size, 1, 1],
            max_instances: compute_flat_slot_size(info, coeff_regs, false, work_size),
            ..Default::default()
        };
        trace!(?group_count, ?indirect, work_size, "compute kernel");
        emit_kernel(compute, &kernel)
    }

    /// Emits an "issue data fence, wait for data fence" kernel.
    pub(crate) fn emit_idfwdf(&self, compute: &mut ComputeSubCmd) -> Result<()> {
        let program = &self.device.helpers.idfwdf;
        let info = KernelInfo {
            usc_common_size: div_ceil32(dw_to_bytes(program.shareds), USC_COMMON_SIZE_UNIT_SIZE),
            pds_data_size: div_ceil32(dw_to_bytes(program.data_size_dw), hw::PDS_DATA_SIZE_UNIT_SIZE),
            usc_target: cdm::USC_TARGET_ALL,
            pds_data_offset: program.data_addr().lo(),
            sd_type: cdm::SD_TYPE_USC,
            usc_common_shared: true,
            pds_code_offset: program.code_addr().lo(),
            global_size: [1, 1, 1],
            local_size: [1, 1, 1],
            max_instances: compute_flat_slot_size(self.device.info(), program.shareds, false, 1),
            ..Default::default()
        };
        emit_kernel(compute, &info)
    }

    /// Emits a compute fence. With `deallocate_shareds`, the shared registers of the job are
    /// released once the fence passes.
    pub(crate) fn emit_compute_fence(&self, compute: &mut ComputeSubCmd, deallocate_shareds: bool) -> Result<()> {
        let program = &self.device.helpers.compute_fence;
        let info = KernelInfo {
            pds_data_size: div_ceil32(dw_to_bytes(program.data_size_dw), hw::PDS_DATA_SIZE_UNIT_SIZE),
            usc_target: cdm::USC_TARGET_ANY,
            is_fence: true,
            pds_data_offset: program.data_addr().lo(),
            sd_type: cdm::SD_TYPE_PDS,
            usc_common_shared: deallocate_shareds,
            pds_code_offset: program.code_addr().lo(),
            global_size: [1, 1, 1],
            local_size: [1, 1, 1],
            max_instances: compute_flat_slot_size(self.device.info(), 0, false, 1),
            ..Default::default()
        };
        emit_kernel(compute, &info)
    }

    /// Fills in the job descriptor of a closed compute sub-command.
    pub(crate) fn compute_job_init(&mut self, compute: &mut ComputeSubCmd) {
        compute.num_shared_regs = self.device.helpers.idfwdf.shareds.max(self.state.max_shared_regs);
        self.state.max_shared_regs = 0;
        compute.job = Some(ComputeJob {
            ctrl_stream_addr: compute.csb.start_addr(),
            max_shared_registers: compute.num_shared_regs,
            prevent_all_overlap: compute.uses_barrier,
        });
    }
}

fn emit_kernel(compute: &mut ComputeSubCmd, info: &KernelInfo) -> Result<()> {
    compute.csb.set_relocation_mark();
    compute.csb.emit(&cdm::kernel(info))?;
    compute.csb.clear_relocation_mark();
    // the firmware saves this many shared registers on a context switch
    if info.usc_common_shared {
        compute.num_shared_regs = compute.num_shared_regs.max(info.usc_common_size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cmd_buffer::BeginInfo,
        pipeline::{ComputePipelineCreateInfo, PipelineLayout, PipelineLayoutCreateInfo},
        program::CompiledProgram,
        testing,
    };

    fn pipeline(device: &Arc<crate::device::Device>, const_shared_regs: u32) -> Arc<ComputePipeline> {
        let layout = PipelineLayout::new(PipelineLayoutCreateInfo::default());
        let mut info = ComputePipelineCreateInfo::new(layout, [8, 1, 1]);
        info.kernel_pds = CompiledProgram {
            code: vec![0; 4],
            data: vec![0; 8],
            ..Default::default()
        };
        info.const_shared_regs_count = const_shared_regs;
        ComputePipeline::new(device, info).unwrap()
    }

    fn kernel_len() -> usize {
        cdm::kernel(&KernelInfo {
            global_size: [1, 1, 1],
            ..Default::default()
        })
        .len()
    }

    #[test]
    fn slot_size_limits() {
        let info = DeviceInfo::default();
        assert_eq!(compute_flat_slot_size(&info, 0, false, 64), MAX_INSTANCES_PER_TASK);
        // whole workgroups only with barriers
        assert_eq!(compute_flat_slot_size(&info, 0, true, 12), 24);
        assert_eq!(compute_flat_slot_size(&info, 0, false, 12), 32);
        // 512 coefficient registers out of 1024 leave room for two workgroups
        assert_eq!(compute_flat_slot_size(&info, 512, false, 4), 8);
    }

    #[test]
    fn slot_size_leaves_room_for_pixel_tasks() {
        let info = DeviceInfo {
            cdm_max_local_mem_size_regs: 8192,
            has_quirk_52354: true,
            compute_overlap: true,
            ..Default::default()
        };
        assert_eq!(compute_flat_slot_size(&info, 512, false, 4), 8);
        assert_eq!(compute_flat_slot_size(&info, 64, false, 2), 16);

        let quirk = DeviceInfo {
            has_quirk_49032: true,
            ..Default::default()
        };
        assert_eq!(compute_flat_slot_size(&quirk, 0, false, 12), 24);
    }

    #[test]
    fn workgroup_padding() {
        let info = DeviceInfo::default();
        assert_eq!(compute_flat_pad_workgroup_size(&info, 33, 0), 64);
        assert_eq!(compute_flat_pad_workgroup_size(&info, 16, 0), 16);
        assert_eq!(compute_flat_pad_workgroup_size(&info, 16, 200), 32);
    }

    #[test]
    fn zero_sized_dispatch_is_ignored() {
        let device = testing::device();
        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.bind_compute_pipeline(&pipeline(&device, 0));
        cb.dispatch([4, 0, 1]).unwrap();
        cb.end().unwrap();
        assert_eq!(cb.sub_command_count(), 0);
    }

    #[test]
    fn dispatch_emits_kernel_and_fence() {
        let device = testing::device();
        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.bind_compute_pipeline(&pipeline(&device, 0));
        cb.dispatch([4, 2, 1]).unwrap();
        cb.dispatch_indirect(DevAddr(0x1_0000_1000)).unwrap();
        cb.end().unwrap();

        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        assert_eq!(sub_cmds.len(), 1);
        let compute = sub_cmds[0].as_compute().unwrap();
        let words = compute.control_stream().words();
        // dispatch, indirect dispatch (one word shorter), fence, terminate
        assert_eq!(words.len(), kernel_len() + (kernel_len() - 1) + kernel_len() + 1);
        assert_eq!(&words[3..6], &[3, 1, 0]);
        // indirect flag of the second kernel
        assert_ne!(words[kernel_len()] & (1 << 29), 0);

        let job = compute.job().unwrap();
        assert_eq!(job.ctrl_stream_addr, compute.control_stream().start_addr());
        assert!(!job.prevent_all_overlap);
    }

    #[test]
    fn shared_registers_are_allocated_and_tracked() {
        let device = testing::device();
        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.bind_compute_pipeline(&pipeline(&device, 96));
        cb.dispatch([1, 1, 1]).unwrap();
        cb.end().unwrap();

        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        let compute = sub_cmds[0].as_compute().unwrap();
        // shared update, kernel, fence, terminate
        assert_eq!(compute.control_stream().len_words() as usize, 3 * kernel_len() + 1);
        assert!(compute.num_shared_regs() >= 96);
        assert_eq!(compute.job().unwrap().max_shared_registers, compute.num_shared_regs());
        assert_eq!(cb.state.max_shared_regs, 0);
    }
}
