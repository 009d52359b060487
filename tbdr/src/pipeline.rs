//! Pipelines, pipeline layouts and descriptor sets.
//!
//! Shaders arrive already compiled. A pipeline uploads its programs and keeps the fixed-function
//! state the recorder turns into register words.
use crate::{
    device::Device,
    hw::{MAX_DESCRIPTOR_SETS, MAX_VERTEX_INPUT_BINDINGS},
    memory::{Bo, DevAddr, Heap},
    program::{CompiledProgram, UploadedProgram},
    vk, Result,
};
use std::sync::Arc;
use tracing::{debug, trace_span};

/// Description of the resources a descriptor set holds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DescriptorSetLayout {
    /// Size of the descriptor memory, in dwords.
    pub size_dw: u32,
    /// Number of dynamic uniform/storage buffers.
    pub dynamic_buffer_count: u32,
}

/// A descriptor set.
#[derive(Debug)]
pub struct DescriptorSet {
    layout: DescriptorSetLayout,
    bo: Bo,
    dynamic_buffers: Vec<DevAddr>,
}

impl DescriptorSet {
    pub fn new(device: &Arc<Device>, layout: DescriptorSetLayout) -> Result<Arc<DescriptorSet>> {
        let bo = device.alloc(Heap::General, (layout.size_dw.max(1) * 4) as u64, 16)?;
        Ok(Arc::new(DescriptorSet {
            layout,
            bo,
            dynamic_buffers: vec![DevAddr::INVALID; layout.dynamic_buffer_count as usize],
        }))
    }

    /// Same as [`DescriptorSet::new`], with the base addresses of the dynamic buffers.
    pub fn with_dynamic_buffers(
        device: &Arc<Device>,
        layout: DescriptorSetLayout,
        dynamic_buffers: Vec<DevAddr>,
    ) -> Result<Arc<DescriptorSet>> {
        debug_assert_eq!(dynamic_buffers.len(), layout.dynamic_buffer_count as usize);
        let bo = device.alloc(Heap::General, (layout.size_dw.max(1) * 4) as u64, 16)?;
        Ok(Arc::new(DescriptorSet {
            layout,
            bo,
            dynamic_buffers,
        }))
    }

    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    pub fn addr(&self) -> DevAddr {
        self.bo.addr()
    }

    pub fn dynamic_buffers(&self) -> &[DevAddr] {
        &self.dynamic_buffers
    }
}

/// Where a shader stage expects its descriptor data.
///
/// The offsets index the data segment of the stage's descriptor PDS program, as laid out by the
/// descriptor layout compiler.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StageDescriptorMapping {
    /// Dword offset of the descriptor table address.
    pub descriptor_table_offset_dw: Option<u32>,
    /// Dword offset of the push constants address.
    pub push_constants_offset_dw: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineLayoutCreateInfo {
    pub set_layouts: Vec<DescriptorSetLayout>,
    pub push_constants_size: u32,
}

/// A pipeline layout.
#[derive(Debug)]
pub struct PipelineLayout {
    set_layouts: Vec<DescriptorSetLayout>,
    push_constants_size: u32,
}

impl PipelineLayout {
    pub fn new(create_info: PipelineLayoutCreateInfo) -> Arc<PipelineLayout> {
        debug_assert!(create_info.set_layouts.len() <= MAX_DESCRIPTOR_SETS);
        Arc::new(PipelineLayout {
            set_layouts: create_info.set_layouts,
            push_constants_size: create_info.push_constants_size,
        })
    }

    pub fn set_layouts(&self) -> &[DescriptorSetLayout] {
        &self.set_layouts
    }

    pub fn push_constants_size(&self) -> u32 {
        self.push_constants_size
    }

    /// Total number of dynamic buffers across all sets.
    pub fn dynamic_buffer_count(&self) -> u32 {
        self.set_layouts.iter().map(|s| s.dynamic_buffer_count).sum()
    }
}

/// A vertex attribute fetched by the vertex PDS program.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VertexAttributeDma {
    pub binding: u32,
    /// Byte offset of the attribute within a vertex.
    pub offset: u32,
    /// Dword offset in the vertex PDS data segment receiving the attribute's base address.
    pub data_offset_dw: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

/// Stencil test state for one face.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StencilState {
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineCreateInfo {
    pub layout: Arc<PipelineLayout>,
    pub vertex_shader: CompiledProgram,
    /// PDS program fetching vertex attributes and launching the vertex shader.
    pub vertex_pds: CompiledProgram,
    pub vertex_attributes: Vec<VertexAttributeDma>,
    pub vertex_descriptors: StageDescriptorMapping,
    pub fragment_shader: CompiledProgram,
    /// PDS program launching the fragment shader.
    pub fragment_pds: CompiledProgram,
    pub fragment_descriptors: StageDescriptorMapping,
    /// Coefficient storage of the fragment varyings, in dwords.
    pub fragment_coeff_size: u32,
    pub vs_output_count: u32,
    pub has_point_size: bool,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub stencil_test: bool,
    pub stencil_compare: vk::CompareOp,
    pub stencil_front: StencilState,
    pub stencil_back: StencilState,
    /// Static depth bias. Dynamic depth bias overrides it.
    pub depth_bias: Option<DepthBias>,
    pub samples: u32,
    pub line_width: f32,
}

impl GraphicsPipelineCreateInfo {
    /// A minimal pipeline drawing triangle lists with no culling and no depth test.
    pub fn new(layout: Arc<PipelineLayout>) -> GraphicsPipelineCreateInfo {
        GraphicsPipelineCreateInfo {
            layout,
            vertex_shader: CompiledProgram::default(),
            vertex_pds: CompiledProgram::default(),
            vertex_attributes: Vec::new(),
            vertex_descriptors: Default::default(),
            fragment_shader: CompiledProgram::default(),
            fragment_pds: CompiledProgram::default(),
            fragment_descriptors: Default::default(),
            fragment_coeff_size: 0,
            vs_output_count: 4,
            has_point_size: false,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::ALWAYS,
            stencil_test: false,
            stencil_compare: vk::CompareOp::ALWAYS,
            stencil_front: Default::default(),
            stencil_back: Default::default(),
            depth_bias: None,
            samples: 1,
            line_width: 1.0,
        }
    }
}

/// A graphics pipeline.
#[derive(Debug)]
pub struct GraphicsPipeline {
    pub(crate) layout: Arc<PipelineLayout>,
    pub(crate) vertex_shader: UploadedProgram,
    pub(crate) vertex_pds: UploadedProgram,
    /// Data segment template of the vertex PDS program, patched with buffer addresses per draw.
    pub(crate) vertex_pds_data: Vec<u32>,
    pub(crate) vertex_attributes: Vec<VertexAttributeDma>,
    pub(crate) vertex_descriptors: StageDescriptorMapping,
    pub(crate) fragment_shader: UploadedProgram,
    pub(crate) fragment_pds: UploadedProgram,
    pub(crate) fragment_pds_data: Vec<u32>,
    pub(crate) fragment_descriptors: StageDescriptorMapping,
    pub(crate) fragment_coeff_size: u32,
    pub(crate) vs_output_count: u32,
    pub(crate) has_point_size: bool,
    pub(crate) topology: vk::PrimitiveTopology,
    pub(crate) cull_mode: vk::CullModeFlags,
    pub(crate) front_face: vk::FrontFace,
    pub(crate) depth_test: bool,
    pub(crate) depth_write: bool,
    pub(crate) depth_compare: vk::CompareOp,
    pub(crate) stencil_test: bool,
    /// Stencil compare op of the front face; the back face shares it.
    pub(crate) stencil_compare: vk::CompareOp,
    pub(crate) stencil_front: StencilState,
    pub(crate) stencil_back: StencilState,
    pub(crate) depth_bias: Option<DepthBias>,
    pub(crate) samples: u32,
    pub(crate) line_width: f32,
}

impl GraphicsPipeline {
    pub fn new(device: &Arc<Device>, create_info: GraphicsPipelineCreateInfo) -> Result<Arc<GraphicsPipeline>> {
        let _span = trace_span!("graphics_pipeline_create").entered();
        debug_assert!(create_info
            .vertex_attributes
            .iter()
            .all(|a| (a.binding as usize) < MAX_VERTEX_INPUT_BINDINGS));

        let pipeline = GraphicsPipeline {
            vertex_shader: device.upload_program(Heap::Usc, &create_info.vertex_shader)?,
            vertex_pds: device.upload_program(Heap::Pds, &create_info.vertex_pds)?,
            vertex_pds_data: create_info.vertex_pds.data.clone(),
            fragment_shader: device.upload_program(Heap::Usc, &create_info.fragment_shader)?,
            fragment_pds: device.upload_program(Heap::Pds, &create_info.fragment_pds)?,
            fragment_pds_data: create_info.fragment_pds.data.clone(),
            layout: create_info.layout,
            vertex_attributes: create_info.vertex_attributes,
            vertex_descriptors: create_info.vertex_descriptors,
            fragment_descriptors: create_info.fragment_descriptors,
            fragment_coeff_size: create_info.fragment_coeff_size,
            vs_output_count: create_info.vs_output_count,
            has_point_size: create_info.has_point_size,
            topology: create_info.topology,
            cull_mode: create_info.cull_mode,
            front_face: create_info.front_face,
            depth_test: create_info.depth_test,
            depth_write: create_info.depth_write,
            depth_compare: create_info.depth_compare,
            stencil_test: create_info.stencil_test,
            stencil_compare: create_info.stencil_compare,
            stencil_front: create_info.stencil_front,
            stencil_back: create_info.stencil_back,
            depth_bias: create_info.depth_bias,
            samples: create_info.samples.max(1),
            line_width: create_info.line_width,
        };
        debug!(samples = pipeline.samples, topology = ?pipeline.topology, "created graphics pipeline");
        Ok(Arc::new(pipeline))
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[derive(Clone, Debug)]
pub struct ComputePipelineCreateInfo {
    pub layout: Arc<PipelineLayout>,
    pub shader: CompiledProgram,
    /// PDS program launching the compute shader.
    pub kernel_pds: CompiledProgram,
    pub descriptors: StageDescriptorMapping,
    /// PDS program loading constant shared registers, if the shader uses any.
    pub shared_update_pds: Option<CompiledProgram>,
    pub workgroup_size: [u32; 3],
    /// Coefficient registers used by the shader (workgroup local memory).
    pub coeff_regs_count: u32,
    /// Constant shared registers loaded once per dispatch.
    pub const_shared_regs_count: u32,
    pub uses_barrier: bool,
}

impl ComputePipelineCreateInfo {
    pub fn new(layout: Arc<PipelineLayout>, workgroup_size: [u32; 3]) -> ComputePipelineCreateInfo {
        ComputePipelineCreateInfo {
            layout,
            shader: CompiledProgram::default(),
            kernel_pds: CompiledProgram::default(),
            descriptors: Default::default(),
            shared_update_pds: None,
            workgroup_size,
            coeff_regs_count: 0,
            const_shared_regs_count: 0,
            uses_barrier: false,
        }
    }
}

/// A compute pipeline.
#[derive(Debug)]
pub struct ComputePipeline {
    pub(crate) layout: Arc<PipelineLayout>,
    pub(crate) shader: UploadedProgram,
    pub(crate) kernel_pds: UploadedProgram,
    pub(crate) kernel_pds_data: Vec<u32>,
    pub(crate) descriptors: StageDescriptorMapping,
    pub(crate) shared_update_pds: Option<UploadedProgram>,
    pub(crate) workgroup_size: [u32; 3],
    pub(crate) coeff_regs_count: u32,
    pub(crate) const_shared_regs_count: u32,
    pub(crate) uses_barrier: bool,
}

impl ComputePipeline {
    pub fn new(device: &Arc<Device>, create_info: ComputePipelineCreateInfo) -> Result<Arc<ComputePipeline>> {
        let _span = trace_span!("compute_pipeline_create").entered();
        debug_assert!(create_info.workgroup_size.iter().all(|&s| s > 0));
        let shared_update_pds = match create_info.shared_update_pds {
            Some(ref program) => Some(device.upload_program(Heap::Pds, program)?),
            None => None,
        };
        Ok(Arc::new(ComputePipeline {
            shader: device.upload_program(Heap::Usc, &create_info.shader)?,
            kernel_pds: device.upload_program(Heap::Pds, &create_info.kernel_pds)?,
            kernel_pds_data: create_info.kernel_pds.data.clone(),
            layout: create_info.layout,
            descriptors: create_info.descriptors,
            shared_update_pds,
            workgroup_size: create_info.workgroup_size,
            coeff_regs_count: create_info.coeff_regs_count,
            const_shared_regs_count: create_info.const_shared_regs_count,
            uses_barrier: create_info.uses_barrier,
        }))
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Number of invocations in a workgroup.
    pub fn workgroup_invocations(&self) -> u32 {
        self.workgroup_size.iter().product()
    }
}
