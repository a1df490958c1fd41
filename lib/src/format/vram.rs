use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use binrw::{binrw, BinReaderExt};

pub const TEXTURE_BANK_SIZE: usize = 128 * 1024;
pub const PALETTE_BANK_SIZE: usize = 16 * 1024;
pub const TEXTURE_SLOT_COUNT: usize = 4;
pub const PALETTE_SLOT_COUNT: usize = 8;

/// Total size of the reconstructed texture buffer (512 KiB).
pub const VRAM_TEX_SIZE: usize = TEXTURE_SLOT_COUNT * TEXTURE_BANK_SIZE;
/// Total number of reconstructed 16-bit palette entries (64 Ki).
pub const VRAM_PAL_ENTRIES: usize = PALETTE_SLOT_COUNT * PALETTE_BANK_SIZE / 2;

/// Bank-selection bitmasks from the head of a `VRAM` chunk.
#[binrw]
#[derive(Clone, Debug, Default)]
struct SVramMaps {
    texture: [u32; TEXTURE_SLOT_COUNT],
    texpal: [u32; PALETTE_SLOT_COUNT],
}

/// Flat texture and palette memory, reconstructed from the banked snapshot
/// in a `VRAM` chunk.
///
/// Both buffers are always fully sized (`VRAM_TEX_SIZE` bytes /
/// `VRAM_PAL_ENTRIES` entries); a dump without a `VRAM` chunk decodes
/// against zero-filled memory.
#[derive(Clone)]
pub struct VramBuffers {
    pub texture: Vec<u8>,
    pub palette: Vec<u16>,
}

impl Default for VramBuffers {
    fn default() -> Self {
        Self { texture: vec![0; VRAM_TEX_SIZE], palette: vec![0; VRAM_PAL_ENTRIES] }
    }
}

impl VramBuffers {
    /// Reads a `VRAM` chunk payload: the bank maps followed by four 128 KiB
    /// texture banks (A-D) and six 16 KiB banks (E-I plus one unused).
    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let maps: SVramMaps = cursor.read_le().context("Reading VRAM bank maps")?;
        let mut banks = Vec::with_capacity(10);
        for _ in 0..4 {
            banks.push(read_bank(cursor, TEXTURE_BANK_SIZE)?);
        }
        for _ in 0..6 {
            banks.push(read_bank(cursor, PALETTE_BANK_SIZE)?);
        }
        Ok(Self::assemble(&maps, &banks))
    }

    /// Unions banks into the flat buffers. Bank selection is
    /// exclusive-lowest-bit-wins, not additive; slots with no mapped bank
    /// are zero-filled.
    fn assemble(maps: &SVramMaps, banks: &[Vec<u8>]) -> Self {
        let mut texture = Vec::with_capacity(VRAM_TEX_SIZE);
        for &mask in &maps.texture {
            match (0..TEXTURE_SLOT_COUNT).find(|&bit| mask & (1 << bit) != 0) {
                Some(bank) => texture.extend_from_slice(&banks[bank]),
                None => texture.resize(texture.len() + TEXTURE_BANK_SIZE, 0),
            }
        }
        let mut pal_bytes = Vec::with_capacity(PALETTE_SLOT_COUNT * PALETTE_BANK_SIZE);
        for (slot, &mask) in maps.texpal.iter().enumerate() {
            if mask & (1 << 4) != 0 {
                pal_bytes.extend_from_slice(&banks[4 + (slot & 3)]);
            } else if mask & (1 << 5) != 0 {
                pal_bytes.extend_from_slice(&banks[8]);
            } else if mask & (1 << 6) != 0 {
                pal_bytes.extend_from_slice(&banks[9]);
            } else {
                pal_bytes.resize(pal_bytes.len() + PALETTE_BANK_SIZE, 0);
            }
        }
        let palette =
            pal_bytes.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])).collect();
        Self { texture, palette }
    }
}

fn read_bank(cursor: &mut Cursor<&[u8]>, size: usize) -> Result<Vec<u8>> {
    let mut bank = vec![0u8; size];
    cursor.read_exact(&mut bank).context("Reading VRAM bank")?;
    Ok(bank)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_banks() -> Vec<Vec<u8>> {
        let mut banks = Vec::new();
        for i in 0..4 {
            banks.push(vec![0x10 + i as u8; TEXTURE_BANK_SIZE]);
        }
        for i in 0..6 {
            banks.push(vec![0x50 + i as u8; PALETTE_BANK_SIZE]);
        }
        banks
    }

    #[test]
    fn texture_bank_selection_is_exclusive_lowest_bit() {
        let mut maps = SVramMaps::default();
        maps.texture[0] = (1 << 0) | (1 << 2);
        let vram = VramBuffers::assemble(&maps, &test_banks());
        assert_eq!(vram.texture.len(), VRAM_TEX_SIZE);
        // Bit 0 wins over bit 2; bank C's bytes must not appear.
        assert!(vram.texture[..TEXTURE_BANK_SIZE].iter().all(|&b| b == 0x10));
    }

    #[test]
    fn unmapped_texture_slots_are_zero_filled() {
        let mut maps = SVramMaps::default();
        maps.texture[1] = 1 << 3;
        let vram = VramBuffers::assemble(&maps, &test_banks());
        assert!(vram.texture[..TEXTURE_BANK_SIZE].iter().all(|&b| b == 0));
        assert!(vram.texture[TEXTURE_BANK_SIZE..2 * TEXTURE_BANK_SIZE]
            .iter()
            .all(|&b| b == 0x13));
        assert!(vram.texture[2 * TEXTURE_BANK_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn palette_slots_map_to_small_banks() {
        let mut maps = SVramMaps::default();
        maps.texpal[0] = 1 << 4; // bank E
        maps.texpal[5] = 1 << 4; // slot & 3 == 1 -> bank F
        maps.texpal[2] = 1 << 5; // fixed bank at index 8
        maps.texpal[3] = 1 << 6; // fixed bank at index 9
        let vram = VramBuffers::assemble(&maps, &test_banks());
        assert_eq!(vram.palette.len(), VRAM_PAL_ENTRIES);
        let entries_per_slot = PALETTE_BANK_SIZE / 2;
        assert_eq!(vram.palette[0], 0x5050);
        assert_eq!(vram.palette[5 * entries_per_slot], 0x5151);
        assert_eq!(vram.palette[2 * entries_per_slot], 0x5454);
        assert_eq!(vram.palette[3 * entries_per_slot], 0x5555);
        assert_eq!(vram.palette[entries_per_slot], 0); // slot 1 unmapped
    }

    #[test]
    fn palette_entries_are_little_endian() {
        let mut banks = test_banks();
        banks[4][0] = 0x34;
        banks[4][1] = 0x12;
        let mut maps = SVramMaps::default();
        maps.texpal[0] = 1 << 4;
        let vram = VramBuffers::assemble(&maps, &banks);
        assert_eq!(vram.palette[0], 0x1234);
    }

    #[test]
    fn default_buffers_are_fully_sized() {
        let vram = VramBuffers::default();
        assert_eq!(vram.texture.len(), VRAM_TEX_SIZE);
        assert_eq!(vram.palette.len(), VRAM_PAL_ENTRIES);
    }
}
