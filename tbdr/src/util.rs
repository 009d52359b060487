//! Miscellaneous integer and format helpers.
use ash::vk;

/// Aligns `a` up to `b`, which must be a power of two.
pub(crate) fn align(a: u64, b: u64) -> u64 {
    assert!(b.is_power_of_two(), "alignment must be a power of two");
    (a + b - 1) & !(b - 1)
}

/// 32-bit variant of [`align`].
pub(crate) fn align32(a: u32, b: u32) -> u32 {
    assert!(b.is_power_of_two(), "alignment must be a power of two");
    (a + b - 1) & !(b - 1)
}

/// Integer division rounding up.
pub(crate) fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

pub(crate) fn div_ceil32(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Size in bytes of `dwords` 32-bit words.
pub(crate) const fn dw_to_bytes(dwords: u32) -> u32 {
    dwords * 4
}

/// Number of bits per pixel of an attachment format.
///
/// Only the formats that can be bound as render pass attachments are known here; anything else
/// is a capability gap.
pub fn format_bits_per_pixel(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SINT | vk::Format::S8_UINT => 8,
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UINT
        | vk::Format::D16_UNORM => 16,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::X8_D24_UNORM_PACK32 => 32,
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT => 64,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 128,
        _ => panic!("unsupported attachment format: {:?}", format),
    }
}

pub fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::X8_D24_UNORM_PACK32
    )
}

pub fn format_has_stencil(format: vk::Format) -> bool {
    matches!(format, vk::Format::S8_UINT | vk::Format::D24_UNORM_S8_UINT)
}

/// Index of a sample count among the supported counts (1, 2, 4, 8).
pub(crate) fn sample_count_log2(samples: u32) -> usize {
    match samples {
        0 | 1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => panic!("unsupported number of samples: {}", samples),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_power_of_two() {
        assert_eq!(align(0, 4096), 0);
        assert_eq!(align(1, 4096), 4096);
        assert_eq!(align(4096, 4096), 4096);
        assert_eq!(align32(17, 16), 32);
        assert_eq!(div_ceil(9, 8), 2);
        assert_eq!(div_ceil32(16, 8), 2);
    }

    #[test]
    #[should_panic]
    fn align_rejects_non_power_of_two() {
        align(3, 6);
    }
}
