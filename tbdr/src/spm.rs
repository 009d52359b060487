//! Smart parameter management.
//!
//! When the parameter buffer fills up mid-render, the hardware performs a partial render: it
//! stores the tile contents to a scratch buffer with an end of tile program, flushes the
//! parameter buffer, and reloads the tiles with a background object before resuming. The
//! programs and register words for both halves are prepared once per framebuffer and render,
//! and stay valid for any number of partial renders.
use crate::{
    device::Device,
    hw::{self, pbe, pds, PBE_STRIDE_ALIGNMENT},
    memory::{Bo, DevAddr, Heap},
    pass::{HwRender, RenderPass},
    program::{EotProgramInfo, LoadProgramInfo, PbeEmit, UploadedProgram},
    util::{align, align32, div_ceil32},
    Result,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace_span};

/// Maximum number of dwords a single PBE emit stores per pixel.
const MAX_DWORDS_PER_EMIT: u32 = 4;
/// Texture state words per reloaded surface.
const TEXTURE_STATE_WORDS: usize = 4;

/// Size in bytes of the scratch buffer needed to survive a partial render in any render of the
/// pass.
pub fn scratch_buffer_size(pass: &RenderPass, width: u32, height: u32, layers: u32) -> u64 {
    let mut output_regs = 1;
    let mut tile_buffers = 0;
    for render in pass.hw_setup().renders() {
        output_regs = output_regs.max(render.output_regs_count);
        tile_buffers = tile_buffers.max(render.tile_buffers_count);
    }
    let dwords_per_pixel = pass.max_sample_count() as u64 * output_regs as u64 * (tile_buffers as u64 + 1);
    align(width as u64, PBE_STRIDE_ALIGNMENT as u64) * height as u64 * dwords_per_pixel * 4 * layers.max(1) as u64
}

/// A scratch buffer shared between framebuffers.
#[derive(Debug)]
pub struct ScratchBuffer {
    bo: Bo,
}

impl ScratchBuffer {
    pub fn addr(&self) -> DevAddr {
        self.bo.addr()
    }

    pub fn size(&self) -> u64 {
        self.bo.size()
    }
}

/// Device-wide cache of the largest scratch buffer handed out so far.
///
/// Only one fragment job runs at a time, so every framebuffer can share the same buffer as long
/// as it is large enough.
#[derive(Debug, Default)]
pub struct ScratchBufferStore {
    head: Mutex<Option<Arc<ScratchBuffer>>>,
}

impl ScratchBufferStore {
    pub(crate) fn new() -> ScratchBufferStore {
        ScratchBufferStore::default()
    }

    /// Returns a scratch buffer of at least `size` bytes, reusing the cached one if possible.
    pub(crate) fn get_buffer(&self, device: &Device, size: u64) -> Result<Arc<ScratchBuffer>> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ref buffer) = *head {
            if buffer.size() >= size {
                return Ok(buffer.clone());
            }
        }
        let buffer = Arc::new(ScratchBuffer {
            bo: device.alloc(Heap::General, size.max(4), hw::PM_PAGE_SIZE)?,
        });
        debug!(size, addr = ?buffer.addr(), "new scratch buffer");
        // framebuffers still holding the previous buffer keep it alive
        *head = Some(buffer.clone());
        Ok(buffer)
    }

    /// The cached buffer, if any.
    pub fn current(&self) -> Option<Arc<ScratchBuffer>> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// One surface stored to (and reloaded from) the scratch buffer.
#[derive(Copy, Clone, Debug)]
struct ScratchSurface {
    addr: DevAddr,
    dwords: u32,
    source_start: u32,
    tile_buffer: Option<u32>,
}

/// Splits the tile data of a render into PBE-sized surfaces laid out back to back in the scratch
/// buffer.
fn scratch_surfaces(
    device: &Device,
    scratch: &ScratchBuffer,
    render: &HwRender,
    width: u32,
    height: u32,
) -> Vec<ScratchSurface> {
    let stride = align32(width, PBE_STRIDE_ALIGNMENT) as u64;
    let samples = render.sample_count.max(1) as u64;
    let mut surfaces = Vec::new();
    let mut offset = 0u64;
    let mut push = |dwords: u32, source_start: u32, tile_buffer: Option<u32>| {
        surfaces.push(ScratchSurface {
            addr: scratch.addr().offset(offset),
            dwords,
            source_start,
            tile_buffer,
        });
        offset += stride * height as u64 * samples * dwords as u64 * 4;
    };

    let output_regs = render.output_regs_count.max(1);
    let mut start = 0;
    while start < output_regs {
        let dwords = (output_regs - start).min(MAX_DWORDS_PER_EMIT);
        push(dwords, start, None);
        start += dwords;
    }
    let tile_buffer_dwords = device.info().max_output_regs;
    for tile_buffer in 0..render.tile_buffers_count {
        let mut start = 0;
        while start < tile_buffer_dwords {
            let dwords = (tile_buffer_dwords - start).min(MAX_DWORDS_PER_EMIT);
            push(dwords, start, Some(tile_buffer));
            start += dwords;
        }
    }
    debug_assert!(offset <= scratch.size(), "scratch buffer too small for render");
    surfaces
}

/// End of tile state storing a render's tiles to the scratch buffer.
#[derive(Debug)]
pub struct SpmEotState {
    _usc_program: UploadedProgram,
    pixel_event_program: UploadedProgram,
    pbe_state_words: Vec<[u32; hw::NUM_PBESTATE_STATE_WORDS]>,
    pbe_reg_words: Vec<[u32; hw::NUM_PBESTATE_REG_WORDS]>,
}

impl SpmEotState {
    pub(crate) fn new(
        device: &Device,
        scratch: &ScratchBuffer,
        render: &HwRender,
        width: u32,
        height: u32,
    ) -> Result<SpmEotState> {
        let _span = trace_span!("spm_init_eot_state").entered();
        let surfaces = scratch_surfaces(device, scratch, render, width, height);
        let stride = align32(width, PBE_STRIDE_ALIGNMENT);

        let emits: Vec<PbeEmit> = surfaces
            .iter()
            .map(|s| PbeEmit {
                state_words: pbe::state_words(s.addr, s.dwords, s.source_start),
                source_start: s.source_start,
                tile_buffer: s.tile_buffer,
            })
            .collect();
        let usc = device.programs().eot_program(&EotProgramInfo {
            emits: &emits,
            for_spm: true,
        })?;
        let usc_program = device.upload_program(Heap::Usc, &usc)?;
        let pixel_event = device.programs().pixel_event_program(usc_program.code_addr())?;
        let pixel_event_program = device.upload_program(Heap::Pds, &pixel_event)?;

        let pbe_reg_words = surfaces
            .iter()
            .map(|_| pbe::reg_words(stride, width, height, render.sample_count, false))
            .collect();

        Ok(SpmEotState {
            _usc_program: usc_program,
            pixel_event_program,
            pbe_state_words: emits.iter().map(|e| e.state_words).collect(),
            pbe_reg_words,
        })
    }

    pub fn emit_count(&self) -> usize {
        self.pbe_reg_words.len()
    }

    pub fn pbe_state_words(&self) -> &[[u32; hw::NUM_PBESTATE_STATE_WORDS]] {
        &self.pbe_state_words
    }

    pub fn pbe_reg_words(&self) -> &[[u32; hw::NUM_PBESTATE_REG_WORDS]] {
        &self.pbe_reg_words
    }

    /// Data segment of the pixel event program, as referenced by the fragment job.
    pub fn pixel_event_data_addr(&self) -> DevAddr {
        self.pixel_event_program.data_addr()
    }
}

/// Background object state reloading a render's tiles from the scratch buffer.
#[derive(Debug)]
pub struct SpmBgobjState {
    _load_program: UploadedProgram,
    _consts: Bo,
    _pds_program: UploadedProgram,
    pds_reg_values: [u32; hw::NUM_PDS_BGND_WORDS],
}

impl SpmBgobjState {
    pub(crate) fn new(
        device: &Device,
        scratch: &ScratchBuffer,
        render: &HwRender,
        width: u32,
        height: u32,
    ) -> Result<SpmBgobjState> {
        let _span = trace_span!("spm_init_bgobj_state").entered();
        let surfaces = scratch_surfaces(device, scratch, render, width, height);
        let stride = align32(width, PBE_STRIDE_ALIGNMENT);

        let load = device.programs().load_program(&LoadProgramInfo::SpmReload {
            output_regs: render.output_regs_count.max(1),
            tile_buffers: render.tile_buffers_count,
            samples: render.sample_count,
        })?;
        let load_program = device.upload_program(Heap::Usc, &load)?;

        let mut consts = Vec::with_capacity(surfaces.len() * TEXTURE_STATE_WORDS);
        for s in surfaces.iter() {
            consts.extend_from_slice(&[
                s.addr.lo(),
                s.addr.hi(),
                (width.saturating_sub(1) & 0xffff) | (height.saturating_sub(1) << 16),
                stride | (s.dwords << 16),
            ]);
        }
        let consts_bo = device.upload(Heap::General, &consts)?;

        let pds = device.programs().background_pds_program(
            load_program.code_addr(),
            consts_bo.addr(),
            consts.len() as u32,
        )?;
        let pds_program = device.upload_program(Heap::Pds, &pds)?;
        let pds_reg_values = pds::bgnd_words(
            load_program.code_addr(),
            pds_program.data_addr(),
            pds_program.code_addr(),
            consts.len() as u32,
            div_ceil32(pds_program.data_size_dw * 4, hw::PDS_DATA_SIZE_UNIT_SIZE),
            div_ceil32(pds_program.temps * 4, hw::PDS_TEMP_SIZE_UNIT_SIZE),
        );

        Ok(SpmBgobjState {
            _load_program: load_program,
            _consts: consts_bo,
            _pds_program: pds_program,
            pds_reg_values,
        })
    }

    pub fn pds_reg_values(&self) -> [u32; hw::NUM_PDS_BGND_WORDS] {
        self.pds_reg_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn store_reuses_large_enough_buffer() {
        let device = testing::device();
        let store = ScratchBufferStore::new();
        let a = store.get_buffer(&device, 1 << 16).unwrap();
        let b = store.get_buffer(&device, 1 << 12).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = store.get_buffer(&device, 1 << 20).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&store.current().unwrap(), &c));
    }

    #[test]
    fn scratch_size_grows_with_area_and_depth() {
        use crate::pass::{AttachmentDescription, RenderPassCreateInfo, SubpassDescription};
        use crate::vk;

        let device = testing::device();
        let narrow = testing::single_color_pass(&device, vk::Format::R8G8B8A8_UNORM, 1);
        let wide = testing::single_color_pass(&device, vk::Format::R32G32B32A32_SFLOAT, 1);
        // too many output registers: the second attachment goes to a tile buffer
        let spilled = RenderPass::new(
            &device,
            &RenderPassCreateInfo {
                attachments: vec![
                    AttachmentDescription::color(vk::Format::R32G32B32A32_SFLOAT, 1),
                    AttachmentDescription::color(vk::Format::R32G32_SFLOAT, 1),
                ],
                subpasses: vec![SubpassDescription {
                    color_attachments: vec![0, 1],
                    ..Default::default()
                }],
            },
        )
        .unwrap();
        assert_eq!(spilled.hw_setup().renders()[0].tile_buffers_count, 1);

        let extents = [(1, 1), (16, 16), (32, 64), (64, 64), (100, 75), (128, 128), (1920, 1080)];
        for pass in [&narrow, &wide, &spilled].iter() {
            let sizes: Vec<u64> = extents
                .iter()
                .map(|&(w, h)| scratch_buffer_size(pass, w, h, 1))
                .collect();
            for pair in sizes.windows(2) {
                assert!(pair[0] <= pair[1], "{:?}", sizes);
            }
        }
        for &(w, h) in extents.iter() {
            let a = scratch_buffer_size(&narrow, w, h, 1);
            let b = scratch_buffer_size(&wide, w, h, 1);
            let c = scratch_buffer_size(&spilled, w, h, 1);
            assert!(a <= b && b <= c, "{}x{}: {} {} {}", w, h, a, b, c);
        }
        assert!(scratch_buffer_size(&narrow, 64, 64, 1) < scratch_buffer_size(&spilled, 64, 64, 1));
    }
}
