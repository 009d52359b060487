//! Interface to the program generator.
//!
//! Shader and microcode compilation is not done here. The core asks a [`ProgramGenerator`] for the
//! fixed-function helper programs it needs (end of tile, background object, fences, query
//! kernels) and embeds the returned blobs in device memory without looking inside them.
use crate::{
    debug::Diagnostics,
    memory::{Bo, DevAddr, DeviceMemory, Heap},
    Result,
};
use std::sync::Arc;

/// A compiled program as returned by the generator.
#[derive(Clone, Debug, Default)]
pub struct CompiledProgram {
    /// Code segment.
    pub code: Vec<u32>,
    /// Data segment (PDS programs only). Uploaded separately from the code.
    pub data: Vec<u32>,
    /// Entry point, in bytes from the start of the code segment.
    pub entry_offset: u32,
    /// Temporary registers used.
    pub temps: u32,
    /// Shared registers used.
    pub shareds: u32,
}

/// One PBE emit of an end of tile program.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PbeEmit {
    pub state_words: [u32; crate::hw::NUM_PBESTATE_STATE_WORDS],
    /// First output register (or tile buffer dword) this emit stores.
    pub source_start: u32,
    /// Tile buffer the emit reads from, `None` for on-chip output registers.
    pub tile_buffer: Option<u32>,
}

/// Request for an end of tile program.
#[derive(Clone, Debug)]
pub struct EotProgramInfo<'a> {
    pub emits: &'a [PbeEmit],
    /// Whether the program writes to the SPM scratch buffer rather than to attachments.
    pub for_spm: bool,
}

/// Request for a program that initializes tile memory at the start of a render.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadProgramInfo {
    /// Reload previously stored tile data from the SPM scratch buffer.
    SpmReload {
        output_regs: u32,
        tile_buffers: u32,
        samples: u32,
    },
    /// Apply attachment load ops (clears and loads) for a render or subpass.
    LoadOps {
        clear_mask: u32,
        load_mask: u32,
        output_regs: u32,
        samples: u32,
    },
}

/// Kernels run by occlusion query sub-commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueryProgramKind {
    /// Writes availability for a list of query indices.
    Availability,
    /// Zeroes results and availability of a range of queries.
    Reset,
}

/// Program generator.
pub trait ProgramGenerator: Send + Sync {
    /// USC end of tile program running `info.emits`.
    fn eot_program(&self, info: &EotProgramInfo) -> Result<CompiledProgram>;
    /// PDS pixel event program launching the end of tile program at `eot`.
    fn pixel_event_program(&self, eot: DevAddr) -> Result<CompiledProgram>;
    /// USC program initializing tile memory.
    fn load_program(&self, info: &LoadProgramInfo) -> Result<CompiledProgram>;
    /// PDS background object program launching the load program at `load`, DMAing
    /// `consts_dwords` of texture/constant state from `consts`.
    fn background_pds_program(&self, load: DevAddr, consts: DevAddr, consts_dwords: u32) -> Result<CompiledProgram>;
    /// PDS+USC "issue data fence, wait for data fence" kernel.
    fn idfwdf_program(&self) -> Result<CompiledProgram>;
    /// PDS compute fence kernel.
    fn compute_fence_program(&self) -> Result<CompiledProgram>;
    /// Occlusion query kernel.
    fn query_program(&self, kind: QueryProgramKind) -> Result<CompiledProgram>;
    /// PDS program that does nothing. Used for transparent objects and as a stand-in kernel when
    /// a shared register allocation has no constants to load.
    fn nop_program(&self) -> Result<CompiledProgram>;
}

/// A program resident in device memory.
#[derive(Debug)]
pub struct UploadedProgram {
    code: Bo,
    data: Option<Bo>,
    /// Host copy of the data segment, for callers building their own data from it.
    data_words: Vec<u32>,
    pub entry_offset: u32,
    pub temps: u32,
    pub shareds: u32,
    pub code_size_dw: u32,
    pub data_size_dw: u32,
}

impl UploadedProgram {
    pub(crate) fn upload(
        memory: &Arc<dyn DeviceMemory>,
        diagnostics: Diagnostics,
        heap: Heap,
        program: &CompiledProgram,
    ) -> Result<UploadedProgram> {
        let code = Bo::new(memory, diagnostics, heap, (program.code.len().max(1) * 4) as u64, 16)?;
        code.write(0, &program.code);
        let data = if program.data.is_empty() {
            None
        } else {
            let data = Bo::new(memory, diagnostics, heap, (program.data.len() * 4) as u64, 16)?;
            data.write(0, &program.data);
            Some(data)
        };
        Ok(UploadedProgram {
            code,
            data,
            data_words: program.data.clone(),
            entry_offset: program.entry_offset,
            temps: program.temps,
            shareds: program.shareds,
            code_size_dw: program.code.len() as u32,
            data_size_dw: program.data.len() as u32,
        })
    }

    /// Address of the entry point.
    pub fn code_addr(&self) -> DevAddr {
        self.code.addr().offset(self.entry_offset as u64)
    }

    pub fn data_addr(&self) -> DevAddr {
        self.data.as_ref().map(Bo::addr).unwrap_or(DevAddr::INVALID)
    }

    pub(crate) fn data_words(&self) -> &[u32] {
        &self.data_words
    }
}
