//! Hardware synchronization stages.
use ash::vk;
use bitflags::bitflags;

/// Number of hardware stages tracked for synchronization.
pub const NUM_SYNC_STAGES: usize = 5;

bitflags! {
    /// Hardware pipeline stages, as seen by the job scheduler.
    #[derive(Default)]
    pub struct PipelineStage: u32 {
        const GEOM            = 1 << 0;
        const FRAG            = 1 << 1;
        const COMPUTE         = 1 << 2;
        const TRANSFER        = 1 << 3;
        const OCCLUSION_QUERY = 1 << 4;
        const ALL_GRAPHICS    = Self::GEOM.bits | Self::FRAG.bits;
        const ALL             = Self::ALL_GRAPHICS.bits
            | Self::COMPUTE.bits
            | Self::TRANSFER.bits
            | Self::OCCLUSION_QUERY.bits;
    }
}

impl PipelineStage {
    /// Maps Vulkan pipeline stages to hardware stages.
    pub fn from_vk(stages: vk::PipelineStageFlags) -> PipelineStage {
        if stages.contains(vk::PipelineStageFlags::ALL_COMMANDS) {
            return PipelineStage::ALL;
        }

        let mut out = PipelineStage::empty();
        if stages.contains(vk::PipelineStageFlags::ALL_GRAPHICS) {
            out |= PipelineStage::ALL_GRAPHICS;
        }
        if stages.intersects(
            vk::PipelineStageFlags::DRAW_INDIRECT
                | vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER
                | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER
                | vk::PipelineStageFlags::GEOMETRY_SHADER,
        ) {
            out |= PipelineStage::GEOM;
        }
        if stages.intersects(
            vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ) {
            out |= PipelineStage::FRAG;
        }
        if stages.intersects(vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER) {
            out |= PipelineStage::COMPUTE;
        }
        if stages.contains(vk::PipelineStageFlags::TRANSFER) {
            out |= PipelineStage::TRANSFER;
        }
        out
    }

    /// Source stage mapping: bottom-of-pipe means waiting for everything.
    pub fn from_vk_src(stages: vk::PipelineStageFlags) -> PipelineStage {
        if stages.contains(vk::PipelineStageFlags::BOTTOM_OF_PIPE) {
            return PipelineStage::ALL;
        }
        PipelineStage::from_vk(stages)
    }

    /// Destination stage mapping: top-of-pipe means blocking everything.
    pub fn from_vk_dst(stages: vk::PipelineStageFlags) -> PipelineStage {
        if stages.contains(vk::PipelineStageFlags::TOP_OF_PIPE) {
            return PipelineStage::ALL;
        }
        PipelineStage::from_vk(stages)
    }

    /// Index of a single-stage mask.
    pub fn index(self) -> usize {
        debug_assert_eq!(self.bits().count_ones(), 1);
        self.bits().trailing_zeros() as usize
    }

    pub fn from_index(index: usize) -> PipelineStage {
        PipelineStage::from_bits_truncate(1 << index)
    }

    /// Iterates over the single stages contained in this mask.
    pub fn iter(self) -> impl Iterator<Item = PipelineStage> {
        (0..NUM_SYNC_STAGES)
            .map(PipelineStage::from_index)
            .filter(move |s| self.contains(*s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_stage_mapping() {
        assert_eq!(
            PipelineStage::from_vk(vk::PipelineStageFlags::VERTEX_SHADER),
            PipelineStage::GEOM
        );
        assert_eq!(
            PipelineStage::from_vk(vk::PipelineStageFlags::DRAW_INDIRECT),
            PipelineStage::GEOM | PipelineStage::COMPUTE
        );
        assert_eq!(
            PipelineStage::from_vk_src(vk::PipelineStageFlags::BOTTOM_OF_PIPE),
            PipelineStage::ALL
        );
        assert_eq!(
            PipelineStage::from_vk_dst(vk::PipelineStageFlags::TOP_OF_PIPE),
            PipelineStage::ALL
        );
        assert_eq!(
            PipelineStage::from_vk_src(vk::PipelineStageFlags::TOP_OF_PIPE),
            PipelineStage::empty()
        );
    }

    #[test]
    fn iterate_single_stages() {
        let stages: Vec<_> = PipelineStage::ALL_GRAPHICS.iter().collect();
        assert_eq!(stages, vec![PipelineStage::GEOM, PipelineStage::FRAG]);
        assert_eq!(PipelineStage::TRANSFER.index(), 3);
    }
}
