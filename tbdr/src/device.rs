//! Device-wide state: configuration, the global free list, helper programs and submission counters.
use crate::{
    debug::Diagnostics,
    free_list::{FreeList, FreeListCreateInfo},
    hw::{self, vdm},
    memory::{Bo, DeviceMemory, Heap},
    program::{CompiledProgram, ProgramGenerator, QueryProgramKind, UploadedProgram},
    spm::ScratchBufferStore,
    Result,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tracing::{debug, trace_span};

/// Initial size of the global free list.
pub const GLOBAL_FREE_LIST_INITIAL_SIZE: u64 = 2 * 1024 * 1024;
/// Initial size of the global free list when other devices are already active.
pub const SECONDARY_DEVICE_FREE_LIST_INITIAL_SIZE: u64 = 512 * 1024;
pub const GLOBAL_FREE_LIST_MAX_SIZE: u64 = 256 * 1024 * 1024;
pub const GLOBAL_FREE_LIST_GROW_SIZE: u64 = 1024 * 1024;
/// Percentage of the global free list in use above which it grows.
pub const GLOBAL_FREE_LIST_GROW_THRESHOLD: u32 = 13;

/// Features, quirks and limits of the GPU core.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub tile_size_x: u32,
    pub tile_size_y: u32,
    /// System level cache line size, in bytes.
    pub slc_cache_line_size: u32,
    /// PM free list base address alignment, in bytes.
    pub pm_freelist_base_align: u32,
    /// Hardware limit on the size of any free list, in bytes.
    pub max_free_list_size: u64,
    /// Coefficient registers available to a compute slot.
    pub cdm_max_local_mem_size_regs: u32,
    /// Default number of tiles the ISP keeps in flight.
    pub isp_max_tiles_in_flight: u32,
    /// On-chip output registers per pixel. Anything beyond spills to tile buffers.
    pub max_output_regs: u32,
    pub max_multisample: u32,
    pub compute_overlap: bool,
    pub gs_rta_support: bool,
    pub simple_internal_parameter_format: bool,
    /// Slot sizing must only pack whole workgroups.
    pub has_quirk_49032: bool,
    /// Slot sizing must leave room for overlapping pixel tasks.
    pub has_quirk_52354: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            tile_size_x: 32,
            tile_size_y: 32,
            slc_cache_line_size: 64,
            pm_freelist_base_align: 16,
            max_free_list_size: 1 << 32,
            cdm_max_local_mem_size_regs: 1024,
            isp_max_tiles_in_flight: 4,
            max_output_regs: 4,
            max_multisample: 8,
            compute_overlap: false,
            gs_rta_support: false,
            simple_internal_parameter_format: true,
            has_quirk_49032: false,
            has_quirk_52354: false,
        }
    }
}

/// Parameters for [`Device::new`].
pub struct DeviceCreateInfo {
    pub info: DeviceInfo,
    pub diagnostics: Diagnostics,
    pub memory: Arc<dyn DeviceMemory>,
    pub programs: Arc<dyn ProgramGenerator>,
    /// Number of devices already open on the same GPU.
    pub active_devices: u32,
}

/// Full-screen rectangle used by transparent and load objects.
const CLEAR_RECT_VERTICES: [u32; 12] = [
    0xbf80_0000, 0xbf80_0000, 0, // (-1, -1, 0)
    0x3f80_0000, 0xbf80_0000, 0, // ( 1, -1, 0)
    0xbf80_0000, 0x3f80_0000, 0, // (-1,  1, 0)
    0x3f80_0000, 0x3f80_0000, 0, // ( 1,  1, 0)
];
const PRIMITIVE_TOPOLOGY_TRI_STRIP: u32 = 4;

/// Programs created once per device.
#[derive(Debug)]
pub(crate) struct DevicePrograms {
    pub(crate) idfwdf: UploadedProgram,
    pub(crate) compute_fence: UploadedProgram,
    pub(crate) nop: UploadedProgram,
    pub(crate) query_availability: UploadedProgram,
    pub(crate) query_reset: UploadedProgram,
}

/// A GPU device.
pub struct Device {
    info: DeviceInfo,
    diagnostics: Diagnostics,
    memory: Arc<dyn DeviceMemory>,
    programs: Arc<dyn ProgramGenerator>,
    global_free_list: Arc<FreeList>,
    pub(crate) helpers: DevicePrograms,
    _clear_vertices: Bo,
    /// VDM words drawing a full-screen rectangle.
    pub(crate) clear_vdm_words: Vec<u32>,
    pub(crate) scratch_store: ScratchBufferStore,
    frame_counter: AtomicU32,
    job_counter: AtomicU32,
}

impl Device {
    pub fn new(create_info: DeviceCreateInfo) -> Result<Arc<Device>> {
        let _span = trace_span!("device_create").entered();
        let DeviceCreateInfo {
            info,
            diagnostics,
            memory,
            programs,
            active_devices,
        } = create_info;

        let initial_size = if active_devices > 0 {
            SECONDARY_DEVICE_FREE_LIST_INITIAL_SIZE
        } else {
            GLOBAL_FREE_LIST_INITIAL_SIZE
        };
        let global_free_list = FreeList::new(
            &info,
            &memory,
            diagnostics,
            FreeListCreateInfo {
                initial_size,
                max_size: GLOBAL_FREE_LIST_MAX_SIZE,
                grow_size: GLOBAL_FREE_LIST_GROW_SIZE,
                grow_threshold: GLOBAL_FREE_LIST_GROW_THRESHOLD,
                parent: None,
            },
        )?;

        let upload = |heap: Heap, program: CompiledProgram| UploadedProgram::upload(&memory, diagnostics, heap, &program);
        let helpers = DevicePrograms {
            idfwdf: upload(Heap::Pds, programs.idfwdf_program()?)?,
            compute_fence: upload(Heap::Pds, programs.compute_fence_program()?)?,
            nop: upload(Heap::Pds, programs.nop_program()?)?,
            query_availability: upload(Heap::Pds, programs.query_program(QueryProgramKind::Availability)?)?,
            query_reset: upload(Heap::Pds, programs.query_program(QueryProgramKind::Reset)?)?,
        };

        let clear_vertices = Bo::new(&memory, diagnostics, Heap::General, (CLEAR_RECT_VERTICES.len() * 4) as u64, 16)?;
        clear_vertices.write(0, &CLEAR_RECT_VERTICES);
        let mut clear_vdm_words = Vec::new();
        clear_vdm_words.extend_from_slice(&vdm::pds_state(
            clear_vertices.addr(),
            helpers.nop.code_addr(),
            crate::util::div_ceil32(helpers.nop.data_size_dw * 4, hw::PDS_DATA_SIZE_UNIT_SIZE),
            crate::util::div_ceil32(helpers.nop.temps * 4, hw::PDS_TEMP_SIZE_UNIT_SIZE),
        ));
        clear_vdm_words.extend(vdm::index_list(&vdm::IndexList {
            primitive_topology: PRIMITIVE_TOPOLOGY_TRI_STRIP,
            index_count: 4,
            instance_count: 1,
            ..Default::default()
        }));

        debug!(
            ?diagnostics,
            global_free_list_size = global_free_list.size(),
            "created device"
        );

        Ok(Arc::new(Device {
            info,
            diagnostics,
            memory,
            programs,
            global_free_list,
            helpers,
            _clear_vertices: clear_vertices,
            clear_vdm_words,
            scratch_store: ScratchBufferStore::new(),
            frame_counter: AtomicU32::new(0),
            job_counter: AtomicU32::new(0),
        }))
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn memory(&self) -> &Arc<dyn DeviceMemory> {
        &self.memory
    }

    pub fn programs(&self) -> &Arc<dyn ProgramGenerator> {
        &self.programs
    }

    /// The device-wide free list every RTD-local list falls back to.
    pub fn global_free_list(&self) -> &Arc<FreeList> {
        &self.global_free_list
    }

    /// Creates a free list on this device.
    pub fn create_free_list(&self, create_info: FreeListCreateInfo) -> Result<Arc<FreeList>> {
        FreeList::new(&self.info, &self.memory, self.diagnostics, create_info)
    }

    pub(crate) fn alloc(&self, heap: Heap, size: u64, align: u64) -> Result<Bo> {
        Bo::new(&self.memory, self.diagnostics, heap, size, align)
    }

    /// Allocates a buffer holding `words`.
    pub(crate) fn upload(&self, heap: Heap, words: &[u32]) -> Result<Bo> {
        let bo = self.alloc(heap, (words.len().max(1) * 4) as u64, 16)?;
        bo.write(0, words);
        Ok(bo)
    }

    pub(crate) fn upload_program(&self, heap: Heap, program: &CompiledProgram) -> Result<UploadedProgram> {
        UploadedProgram::upload(&self.memory, self.diagnostics, heap, program)
    }

    pub(crate) fn next_frame_number(&self) -> u32 {
        self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_job_number(&self) -> u32 {
        self.job_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("diagnostics", &self.diagnostics)
            .field("global_free_list", &self.global_free_list)
            .finish()
    }
}
