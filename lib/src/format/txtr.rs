use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Result};
use image::RgbaImage;

use crate::format::vram::VramBuffers;

// Texture reads wrap at the 512 KiB buffer, palette reads at 64 Ki entries,
// replicating the hardware's address wrap instead of failing on overrun.
const VRAM_TEX_MASK: usize = 0x7FFFF;
const VRAM_PAL_MASK: usize = 0xFFFF;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ETextureFormat {
    None = 0,
    A3I5 = 1,
    Palette4 = 2,
    Palette16 = 3,
    Palette256 = 4,
    Compressed4x4 = 5,
    A5I3 = 6,
    Direct = 7,
}

impl ETextureFormat {
    fn from_bits(value: u32) -> Self {
        match value & 7 {
            0 => ETextureFormat::None,
            1 => ETextureFormat::A3I5,
            2 => ETextureFormat::Palette4,
            3 => ETextureFormat::Palette16,
            4 => ETextureFormat::Palette256,
            5 => ETextureFormat::Compressed4x4,
            6 => ETextureFormat::A5I3,
            _ => ETextureFormat::Direct,
        }
    }
}

impl Display for ETextureFormat {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(match self {
            ETextureFormat::None => "[none]",
            ETextureFormat::A3I5 => "A3I5",
            ETextureFormat::Palette4 => "4-color",
            ETextureFormat::Palette16 => "16-color",
            ETextureFormat::Palette256 => "256-color",
            ETextureFormat::Compressed4x4 => "Compressed 4x4",
            ETextureFormat::A5I3 => "A5I3",
            ETextureFormat::Direct => "Direct color",
        })
    }
}

/// Texture fields unpacked from a TEXIMAGE_PARAM register value.
#[derive(Copy, Clone, Debug)]
pub struct STextureParams {
    pub vram_addr: usize,
    pub width: u32,
    pub height: u32,
    /// Alpha substituted for palette index 0, on the hardware's 0-31 scale.
    pub alpha0: u8,
    pub format: ETextureFormat,
}

impl STextureParams {
    pub fn from_texparam(texparam: u32) -> Self {
        Self {
            vram_addr: ((texparam & 0xFFFF) << 3) as usize,
            width: 8 << ((texparam >> 20) & 7),
            height: 8 << ((texparam >> 23) & 7),
            alpha0: if texparam & (1 << 29) != 0 { 0 } else { 31 },
            format: ETextureFormat::from_bits(texparam >> 26),
        }
    }
}

/// An RGBA8 bitmap decoded from VRAM.
#[derive(Clone, Debug)]
pub struct DecodedTexture {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// True iff every decoded texel's source alpha was 31.
    pub is_opaque: bool,
}

impl DecodedTexture {
    pub fn into_image(self) -> Result<RgbaImage> {
        let (width, height, len) = (self.width, self.height, self.data.len());
        RgbaImage::from_raw(width, height, self.data)
            .ok_or_else(|| anyhow!("Conversion failed: {width}x{height} from size {len}"))
    }
}

/// Decodes the texture selected by `texparam`/`texpal` from reconstructed
/// VRAM. Returns `None` for format 0 (untextured); the caller substitutes a
/// flat-tinted fallback material.
pub fn decode_texture(vram: &VramBuffers, texparam: u32, texpal: u32) -> Option<DecodedTexture> {
    let params = STextureParams::from_texparam(texparam);
    let num_texels = (params.width * params.height) as usize;
    let addr = params.vram_addr;
    let texpal = texpal as usize;
    // VramBuffers are always fully sized, so masked reads cannot go out of
    // bounds.
    let tex = &vram.texture;
    let pal = &vram.palette;

    // Decode to intermediate BGR555 color + 5-bit alpha planes.
    let mut color = Vec::with_capacity(num_texels);
    let mut alpha: Vec<u8> = Vec::with_capacity(num_texels);
    match params.format {
        ETextureFormat::None => return None,
        ETextureFormat::A3I5 => {
            let base = texpal << 3;
            for a in addr..addr + num_texels {
                let texel = tex[a & VRAM_TEX_MASK] as usize;
                color.push(pal[(base + (texel & 0x1F)) & VRAM_PAL_MASK]);
                // 3-bit alpha scaled to 0-31 by bit replication.
                alpha.push((((texel >> 3) & 0x1C) + (texel >> 6)) as u8);
            }
        }
        ETextureFormat::Palette4 => {
            let base = texpal << 2;
            for a in addr..addr + num_texels / 4 {
                let texel = tex[a & VRAM_TEX_MASK] as usize;
                for shift in [0, 2, 4, 6] {
                    let index = (texel >> shift) & 3;
                    color.push(pal[(base + index) & VRAM_PAL_MASK]);
                    alpha.push(if index == 0 { params.alpha0 } else { 31 });
                }
            }
        }
        ETextureFormat::Palette16 => {
            let base = texpal << 3;
            for a in addr..addr + num_texels / 2 {
                let texel = tex[a & VRAM_TEX_MASK] as usize;
                for shift in [0, 4] {
                    let index = (texel >> shift) & 0xF;
                    color.push(pal[(base + index) & VRAM_PAL_MASK]);
                    alpha.push(if index == 0 { params.alpha0 } else { 31 });
                }
            }
        }
        ETextureFormat::Palette256 => {
            let base = texpal << 3;
            for a in addr..addr + num_texels {
                let index = tex[a & VRAM_TEX_MASK] as usize;
                color.push(pal[(base + index) & VRAM_PAL_MASK]);
                alpha.push(if index == 0 { params.alpha0 } else { 31 });
            }
        }
        ETextureFormat::Compressed4x4 => {
            decode_compressed(tex, pal, &params, texpal, &mut color, &mut alpha);
        }
        ETextureFormat::A5I3 => {
            let base = texpal << 3;
            for a in addr..addr + num_texels {
                let texel = tex[a & VRAM_TEX_MASK] as usize;
                color.push(pal[(base + (texel & 0x7)) & VRAM_PAL_MASK]);
                alpha.push((texel >> 3) as u8);
            }
        }
        ETextureFormat::Direct => {
            for a in (addr..addr + num_texels * 2).step_by(2) {
                let texel =
                    tex[a & VRAM_TEX_MASK] as u16 | (tex[(a + 1) & VRAM_TEX_MASK] as u16) << 8;
                color.push(texel);
                alpha.push(if texel & 0x8000 != 0 { 31 } else { 0 });
            }
        }
    }

    // Expand BGR555 + 5-bit alpha to RGBA8. Rows are written top-down; no
    // y-flip, unlike the Blender importer this format comes from.
    let mut data = Vec::with_capacity(num_texels * 4);
    for (&c, &a) in color.iter().zip(&alpha) {
        let r = (c & 0x1F) as u32;
        let g = ((c >> 5) & 0x1F) as u32;
        let b = ((c >> 10) & 0x1F) as u32;
        data.extend_from_slice(&[
            (r * 255 / 31) as u8,
            (g * 255 / 31) as u8,
            (b * 255 / 31) as u8,
            (a as u32 * 255 / 31) as u8,
        ]);
    }
    let is_opaque = alpha.iter().all(|&a| a == 31);
    Some(DecodedTexture { width: params.width, height: params.height, data, is_opaque })
}

/// 4x4-block compressed format: each block's 2-bit texel indices select from
/// a 4-entry CLUT described by a 16-bit record in VRAM slot 1.
fn decode_compressed(
    tex: &[u8],
    pal: &[u16],
    params: &STextureParams,
    texpal: usize,
    color: &mut Vec<u16>,
    alpha: &mut Vec<u8>,
) {
    let num_texels = (params.width * params.height) as usize;
    let width = params.width as usize;
    color.resize(num_texels, 0);
    alpha.resize(num_texels, 0);

    let base = texpal << 3;
    let mut x_ofs = 0;
    let mut y_ofs = 0;
    for addr in (params.vram_addr..params.vram_addr + num_texels / 4).step_by(4) {
        // The palette record for a block in slot 0 lives at half its offset
        // into slot 1; blocks in slot 2 use the upper half of slot 1.
        let mut slot1_addr = 0x20000 + ((addr & 0x1FFFC) >> 1);
        if addr >= 0x40000 {
            slot1_addr += 0x10000;
        }
        let palinfo = tex[slot1_addr & VRAM_TEX_MASK] as usize
            | (tex[(slot1_addr + 1) & VRAM_TEX_MASK] as usize) << 8;
        let pal_offset = base + ((palinfo & 0x3FFF) << 1);
        let pal_mode = palinfo >> 14;

        let col0 = pal[pal_offset & VRAM_PAL_MASK];
        let col1 = pal[(pal_offset + 1) & VRAM_PAL_MASK];
        let mut block_color = [col0, col1, 0, 0];
        let block_alpha = [31, 31, 31, if pal_mode >= 2 { 31 } else { 0 }];
        match pal_mode {
            0 => {
                block_color[2] = pal[(pal_offset + 2) & VRAM_PAL_MASK];
            }
            1 => {
                block_color[2] = blend_555(col0, col1, 1, 1, 1);
            }
            2 => {
                block_color[2] = pal[(pal_offset + 2) & VRAM_PAL_MASK];
                block_color[3] = pal[(pal_offset + 3) & VRAM_PAL_MASK];
            }
            _ => {
                block_color[2] = blend_555(col0, col1, 5, 3, 3);
                block_color[3] = blend_555(col0, col1, 3, 5, 3);
            }
        }

        // 4 rows of 4 2-bit indices.
        for y in 0..4 {
            let ofs = y_ofs + y * width + x_ofs;
            let texel = tex[(addr + y) & VRAM_TEX_MASK] as usize;
            for (i, shift) in [0, 2, 4, 6].into_iter().enumerate() {
                let index = (texel >> shift) & 3;
                color[ofs + i] = block_color[index];
                alpha[ofs + i] = block_alpha[index];
            }
        }

        x_ofs += 4;
        if x_ofs == width {
            x_ofs = 0;
            y_ofs += 4 * width;
        }
    }
}

/// Weighted per-channel blend of two BGR555 colors. Channels are masked
/// independently so a carry never crosses into the next channel.
fn blend_555(col0: u16, col1: u16, w0: u32, w1: u32, shift: u32) -> u16 {
    let col0 = col0 as u32;
    let col1 = col1 as u32;
    let r = (((col0 & 0x001F) * w0 + (col1 & 0x001F) * w1) >> shift) & 0x001F;
    let g = (((col0 & 0x03E0) * w0 + (col1 & 0x03E0) * w1) >> shift) & 0x03E0;
    let b = (((col0 & 0x7C00) * w0 + (col1 & 0x7C00) * w1) >> shift) & 0x7C00;
    (r | g | b) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLACK: u16 = 0x0000;
    const RED: u16 = 0x001F;
    const GREEN: u16 = 0x03E0;
    const BLUE: u16 = 0x7C00;

    fn texparam(format: ETextureFormat, alpha0_transparent: bool) -> u32 {
        let mut value = (format as u32) << 26;
        if alpha0_transparent {
            value |= 1 << 29;
        }
        value
    }

    fn pixel(texture: &DecodedTexture, index: usize) -> [u8; 4] {
        texture.data[index * 4..index * 4 + 4].try_into().unwrap()
    }

    #[test]
    fn texparam_field_extraction() {
        let params = STextureParams::from_texparam(
            0x1234 | (3 << 20) | (1 << 23) | (5 << 26) | (1 << 29),
        );
        assert_eq!(params.vram_addr, 0x1234 << 3);
        assert_eq!(params.width, 64);
        assert_eq!(params.height, 16);
        assert_eq!(params.alpha0, 0);
        assert_eq!(params.format, ETextureFormat::Compressed4x4);
    }

    #[test]
    fn format_none_has_no_texture() {
        let vram = VramBuffers::default();
        assert!(decode_texture(&vram, texparam(ETextureFormat::None, false), 0).is_none());
    }

    #[test]
    fn palette4_decodes_known_palette() {
        let mut vram = VramBuffers::default();
        // Indices 0, 1, 2, 3 packed into one byte.
        vram.texture[0] = 0b11100100;
        vram.palette[..4].copy_from_slice(&[BLACK, RED, GREEN, BLUE]);
        let texture =
            decode_texture(&vram, texparam(ETextureFormat::Palette4, false), 0).unwrap();
        assert_eq!((texture.width, texture.height), (8, 8));
        assert_eq!(pixel(&texture, 0), [0, 0, 0, 255]);
        assert_eq!(pixel(&texture, 1), [255, 0, 0, 255]);
        assert_eq!(pixel(&texture, 2), [0, 255, 0, 255]);
        assert_eq!(pixel(&texture, 3), [0, 0, 255, 255]);
    }

    #[test]
    fn transparent_index_zero_clears_is_opaque() {
        let vram = VramBuffers::default();
        // Zero-filled VRAM: every texel is index 0.
        let opaque =
            decode_texture(&vram, texparam(ETextureFormat::Palette16, false), 0).unwrap();
        assert!(opaque.is_opaque);
        assert_eq!(pixel(&opaque, 0)[3], 255);
        let transparent =
            decode_texture(&vram, texparam(ETextureFormat::Palette16, true), 0).unwrap();
        assert!(!transparent.is_opaque);
        assert_eq!(pixel(&transparent, 0)[3], 0);
    }

    #[test]
    fn a3i5_alpha_bit_replication() {
        let mut vram = VramBuffers::default();
        vram.texture[0] = 7 << 5; // alpha 7 -> 31
        vram.texture[1] = 3 << 5; // alpha 3 -> 13
        vram.texture[2] = 1 << 5; // alpha 1 -> 4
        let texture = decode_texture(&vram, texparam(ETextureFormat::A3I5, false), 0).unwrap();
        assert_eq!(pixel(&texture, 0)[3], 255);
        assert_eq!(pixel(&texture, 1)[3], (13 * 255 / 31) as u8);
        assert_eq!(pixel(&texture, 2)[3], (4 * 255 / 31) as u8);
        assert!(!texture.is_opaque);
    }

    #[test]
    fn direct_color_alpha_bit() {
        let mut vram = VramBuffers::default();
        // Texel 0: red with the alpha bit, texel 1: red without it.
        vram.texture[0..2].copy_from_slice(&(0x8000u16 | RED).to_le_bytes());
        vram.texture[2..4].copy_from_slice(&RED.to_le_bytes());
        let texture = decode_texture(&vram, texparam(ETextureFormat::Direct, false), 0).unwrap();
        assert_eq!(pixel(&texture, 0), [255, 0, 0, 255]);
        assert_eq!(pixel(&texture, 1), [255, 0, 0, 0]);
        assert!(!texture.is_opaque);
    }

    #[test]
    fn compressed_mode2_block_uses_explicit_clut() {
        let mut vram = VramBuffers::default();
        // First block: rows of indices 0, 1, 2, 3.
        for y in 0..4 {
            vram.texture[y] = 0b11100100;
        }
        // Slot 1 record for block 0: palette offset 0, mode 2.
        vram.texture[0x20000..0x20002].copy_from_slice(&(2u16 << 14).to_le_bytes());
        vram.palette[..4].copy_from_slice(&[BLACK, RED, GREEN, BLUE]);
        let texture =
            decode_texture(&vram, texparam(ETextureFormat::Compressed4x4, false), 0).unwrap();
        for y in 0..4 {
            let row = y * texture.width as usize;
            assert_eq!(pixel(&texture, row), [0, 0, 0, 255]);
            assert_eq!(pixel(&texture, row + 1), [255, 0, 0, 255]);
            assert_eq!(pixel(&texture, row + 2), [0, 255, 0, 255]);
            assert_eq!(pixel(&texture, row + 3), [0, 0, 255, 255]);
        }
    }

    #[test]
    fn compressed_mode1_averages_and_mode3_blends() {
        // Mode 1: color 2 is the channel-wise average of colors 0 and 1.
        assert_eq!(blend_555(RED, BLACK, 1, 1, 1), 0x000F);
        assert_eq!(blend_555(0x7FFF, 0x7FFF, 1, 1, 1), 0x7FFF);
        // Mode 3: 5:3 and 3:5 weighted blends.
        assert_eq!(blend_555(RED, BLACK, 5, 3, 3), (31 * 5 / 8) as u16);
        assert_eq!(blend_555(RED, BLACK, 3, 5, 3), (31 * 3 / 8) as u16);
        // Channels blend independently.
        assert_eq!(blend_555(RED | BLUE, GREEN, 1, 1, 1), 0x000F | 0x01E0 | 0x3C00);
    }

    #[test]
    fn compressed_mode1_index3_is_transparent() {
        let mut vram = VramBuffers::default();
        vram.texture[0] = 0b11000000; // texel 3 of row 0 selects index 3
        // Mode 1 record: index 3 is fully transparent.
        vram.texture[0x20000..0x20002].copy_from_slice(&(1u16 << 14).to_le_bytes());
        let texture =
            decode_texture(&vram, texparam(ETextureFormat::Compressed4x4, false), 0).unwrap();
        assert_eq!(pixel(&texture, 3)[3], 0);
        assert_eq!(pixel(&texture, 0)[3], 255);
        assert!(!texture.is_opaque);
    }
}
