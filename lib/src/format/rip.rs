use std::io::Cursor;

use anyhow::{bail, ensure, Context, Result};
use binrw::{binrw, BinReaderExt};
use indexmap::IndexSet;

use crate::format::{
    txtr::{decode_texture, DecodedTexture},
    vram::VramBuffers,
    FourCC,
};

// Rip dump magic
pub const K_DUMP_MAGIC: &[u8] = b"melon ripper v2";
// Magic/header region skipped before the first chunk
pub const K_DUMP_HEADER_SIZE: usize = 24;

// Triangle geometry
pub const K_CHUNK_TRI: FourCC = FourCC(*b"TRI ");
// Quad geometry
pub const K_CHUNK_QUAD: FourCC = FourCC(*b"QUAD");
// TEXIMAGE_PARAM register
pub const K_CHUNK_TPRM: FourCC = FourCC(*b"TPRM");
// PLTT_BASE register
pub const K_CHUNK_TPLT: FourCC = FourCC(*b"TPLT");
// POLYGON_ATTR register
pub const K_CHUNK_PATR: FourCC = FourCC(*b"PATR");
// VRAM snapshot
pub const K_CHUNK_VRAM: FourCC = FourCC(*b"VRAM");
// DISP3DCNT register
pub const K_CHUNK_DISP: FourCC = FourCC(*b"DISP");
// Toon table (32 entries)
pub const K_CHUNK_TOON: FourCC = FourCC(*b"TOON");

const TOON_TABLE_SIZE: u64 = 32 * 2;

/// One vertex record as emitted into TRI/QUAD chunks: Q1.19.12 position,
/// biased color, 1/16-texel UV.
#[binrw]
#[derive(Clone, Debug)]
struct SRawVertex {
    position: [i32; 3],
    color: [i32; 3],
    s: u16,
    t: u16,
}

const RAW_VERTEX_SIZE: u64 = 28;

/// The register triple that fully determines a face's texture and shading.
/// First-seen order of distinct keys assigns material indices.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MaterialKey {
    pub texparam: u32,
    pub texpal: u32,
    pub polygon_attr: u32,
}

#[derive(Clone, Debug)]
pub struct Material {
    pub key: MaterialKey,
    /// `None` means untextured; the consumer renders a flat fallback tint.
    pub texture: Option<DecodedTexture>,
}

/// A renderable scene reconstructed from one rip dump.
///
/// `tri_indices`/`quad_indices` index into the dense vertex arrays;
/// `tri_materials`/`quad_materials` hold one material index per face.
/// Everything is immutable once parsed; a new dump produces a wholly new
/// model.
#[derive(Clone, Debug, Default)]
pub struct RipModel {
    pub positions: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 3]>,
    pub toon_flags: Vec<bool>,
    pub uvs: Vec<[f32; 2]>,
    pub tri_indices: Vec<u32>,
    pub quad_indices: Vec<u32>,
    pub tri_materials: Vec<u32>,
    pub quad_materials: Vec<u32>,
    pub materials: Vec<Material>,
}

impl RipModel {
    /// Parses a whole dump buffer. Any malformed-stream condition (bad
    /// magic, unrecognized tag, payload past the buffer end) fails the
    /// entire conversion; no partial model is returned.
    pub fn parse(data: &[u8]) -> Result<Self> {
        ensure!(data.len() >= K_DUMP_HEADER_SIZE, "Dump truncated: {} bytes", data.len());
        ensure!(data[..K_DUMP_MAGIC.len()] == *K_DUMP_MAGIC, "Not a rip dump (bad magic)");
        let mut parser = Parser::new(data);
        parser.run()?;
        Ok(parser.finish())
    }
}

struct Parser<'a> {
    data: &'a [u8],
    cursor: Cursor<&'a [u8]>,

    positions: Vec<[f32; 3]>,
    // 0-31 channel values; expanded to 8-bit in the finish pass
    raw_colors: Vec<[u8; 3]>,
    toon_flags: Vec<bool>,
    uvs: Vec<[f32; 2]>,
    tri_indices: Vec<u32>,
    quad_indices: Vec<u32>,
    tri_materials: Vec<u32>,
    quad_materials: Vec<u32>,
    material_keys: IndexSet<MaterialKey>,

    // Current register state, latched by TPRM/TPLT/PATR
    texparam: u32,
    texpal: u32,
    polygon_attr: u32,
    tex_width: u32,
    tex_height: u32,

    vram: Option<VramBuffers>,
    disp_cnt: u32,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        let mut cursor = Cursor::new(data);
        cursor.set_position(K_DUMP_HEADER_SIZE as u64);
        Self {
            data,
            cursor,
            positions: vec![],
            raw_colors: vec![],
            toon_flags: vec![],
            uvs: vec![],
            tri_indices: vec![],
            quad_indices: vec![],
            tri_materials: vec![],
            quad_materials: vec![],
            material_keys: IndexSet::new(),
            texparam: 0,
            texpal: 0,
            polygon_attr: 0,
            // Width/height fields of texparam 0 decode to 8x8
            tex_width: 8,
            tex_height: 8,
            vram: None,
            disp_cnt: 0,
        }
    }

    fn run(&mut self) -> Result<()> {
        while (self.cursor.position() as usize) < self.data.len() {
            let pos = self.cursor.position();
            let tag: FourCC = self
                .cursor
                .read_le()
                .with_context(|| format!("Reading chunk tag at {pos:#x}"))?;
            match tag {
                K_CHUNK_TRI => self.read_polygon(3)?,
                K_CHUNK_QUAD => self.read_polygon(4)?,
                K_CHUNK_TPRM => {
                    self.texparam = self.read_register(tag)?;
                    self.tex_width = 8 << ((self.texparam >> 20) & 7);
                    self.tex_height = 8 << ((self.texparam >> 23) & 7);
                }
                K_CHUNK_TPLT => self.texpal = self.read_register(tag)?,
                K_CHUNK_PATR => self.polygon_attr = self.read_register(tag)?,
                K_CHUNK_VRAM => {
                    let vram = VramBuffers::read(&mut self.cursor)
                        .with_context(|| format!("Reading VRAM chunk at {pos:#x}"))?;
                    self.vram = Some(vram);
                }
                // Latched but never consulted; toon detection uses the
                // blend mode captured per vertex, as MelonRipper does.
                K_CHUNK_DISP => self.disp_cnt = self.read_register(tag)?,
                K_CHUNK_TOON => self.skip(TOON_TABLE_SIZE, "TOON table")?,
                tag => bail!("Unrecognized chunk tag {tag:?} at {pos:#x}"),
            }
        }
        Ok(())
    }

    fn read_register(&mut self, tag: FourCC) -> Result<u32> {
        self.cursor.read_le().with_context(|| format!("Reading {tag} register"))
    }

    fn skip(&mut self, len: u64, what: &str) -> Result<()> {
        let end = self.cursor.position() + len;
        ensure!(end <= self.data.len() as u64, "{what} runs past end of dump");
        self.cursor.set_position(end);
        Ok(())
    }

    fn read_polygon(&mut self, nverts: u32) -> Result<()> {
        if (self.polygon_attr >> 4) & 3 == 3 {
            // Shadow volumes are capture artifacts with no render
            // representation.
            return self.skip(nverts as u64 * RAW_VERTEX_SIZE, "Shadow polygon");
        }
        let vert_index = self.positions.len() as u32;
        let use_toon = (self.polygon_attr >> 4) & 3 == 2;
        for i in 0..nverts {
            let raw: SRawVertex =
                self.cursor.read_le().context("Reading polygon vertex")?;
            // Q1.19.12 fixed point
            self.positions.push(raw.position.map(|v| (f64::from(v) / 4096.0) as f32));
            // Undo the emitter-side bias, back to 0-31 per channel
            self.raw_colors.push(raw.color.map(|c| ((c - 0xFFF) >> 12) as u8));
            // Whether toon/highlight applies depends on DISP3DCNT, which
            // arrives at the end of the stream; remember the blend mode and
            // resolve in the finish pass.
            self.toon_flags.push(use_toon);
            self.uvs.push([
                raw.s as f32 / 16.0 / self.tex_width as f32,
                raw.t as f32 / 16.0 / self.tex_height as f32,
            ]);
            if nverts == 4 {
                self.quad_indices.push(vert_index + i);
            } else {
                self.tri_indices.push(vert_index + i);
            }
        }
        let key = MaterialKey {
            texparam: self.texparam,
            texpal: self.texpal,
            polygon_attr: self.polygon_attr,
        };
        let (material_index, _) = self.material_keys.insert_full(key);
        if nverts == 4 {
            self.quad_materials.push(material_index as u32);
        } else {
            self.tri_materials.push(material_index as u32);
        }
        Ok(())
    }

    /// Post-pass once the whole stream is known: expand vertex colors to
    /// 8-bit and decode one texture per unique material key.
    fn finish(self) -> RipModel {
        if self.vram.is_none() {
            log::warn!("Dump has no VRAM chunk, textures will be blank");
        }
        log::debug!("Final DISP3DCNT {:#010x}", self.disp_cnt);
        let vram = self.vram.unwrap_or_default();
        let colors = self
            .raw_colors
            .iter()
            .map(|c| c.map(|ch| (ch as u32 * 255 / 31) as u8))
            .collect();
        let materials: Vec<Material> = self
            .material_keys
            .iter()
            .map(|&key| {
                let texture = decode_texture(&vram, key.texparam, key.texpal);
                if texture.is_none() {
                    log::debug!(
                        "Material texparam={:#010x} texpal={:#010x} is untextured",
                        key.texparam,
                        key.texpal
                    );
                }
                Material { key, texture }
            })
            .collect();
        log::info!(
            "Imported {} vertices, {} triangles, {} quads, {} materials",
            self.positions.len(),
            self.tri_indices.len() / 3,
            self.quad_indices.len() / 4,
            materials.len()
        );
        RipModel {
            positions: self.positions,
            colors,
            toon_flags: self.toon_flags,
            uvs: self.uvs,
            tri_indices: self.tri_indices,
            quad_indices: self.quad_indices,
            tri_materials: self.tri_materials,
            quad_materials: self.quad_materials,
            materials,
        }
    }
}
