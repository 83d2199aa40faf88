// qfiles.rs — battlescape BSP file format structures

// ============================================================
// BSP file format
// ============================================================

/// BSP magic: "IBSP" in little-endian
pub const IDBSPHEADER: i32 = (b'P' as i32) << 24 | (b'S' as i32) << 16 | (b'B' as i32) << 8 | b'I' as i32;
pub const BSPVERSION: i32 = 71;

// Upper design bounds
pub const MAX_MAP_MODELS: usize = 1024;
pub const MAX_MAP_BRUSHES: usize = 8192;
pub const MAX_MAP_ENTSTRING: usize = 0x40000;
pub const MAX_MAP_TEXINFO: usize = 8192;
pub const MAX_MAP_PLANES: usize = 65536;
pub const MAX_MAP_NODES: usize = 65536;
pub const MAX_MAP_BRUSHSIDES: usize = 65536;
pub const MAX_MAP_LEAFS: usize = 65536;
pub const MAX_MAP_LEAFBRUSHES: usize = 65536;
pub const MAX_MAP_ROUTING: usize = 0x40000;

/// Number of tiles one assembled map may be built from.
pub const MAX_MAPTILES: usize = 64;

// Lump indices
pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_PLANES: usize = 1;
pub const LUMP_VERTEXES: usize = 2;
pub const LUMP_ROUTING: usize = 3;
pub const LUMP_NODES: usize = 4;
pub const LUMP_TEXINFO: usize = 5;
pub const LUMP_FACES: usize = 6;
pub const LUMP_LIGHTING: usize = 7;
pub const LUMP_LEAFS: usize = 8;
pub const LUMP_LEAFFACES: usize = 9;
pub const LUMP_LEAFBRUSHES: usize = 10;
pub const LUMP_EDGES: usize = 11;
pub const LUMP_SURFEDGES: usize = 12;
pub const LUMP_MODELS: usize = 13;
pub const LUMP_BRUSHES: usize = 14;
pub const LUMP_BRUSHSIDES: usize = 15;
pub const HEADER_LUMPS: usize = 19;

pub const HEADER_SIZE: usize = 8 + HEADER_LUMPS * 8;

// On-disk record sizes
pub const DMODEL_SIZE: usize = 48;
pub const DPLANE_SIZE: usize = 20;
pub const DNODE_SIZE: usize = 28;
pub const TEXINFO_SIZE: usize = 76;
pub const DLEAF_SIZE: usize = 28;
pub const DLEAFBRUSH_SIZE: usize = 2;
pub const DBRUSH_SIZE: usize = 12;
pub const DBRUSHSIDE_SIZE: usize = 4;

/// Node planenum used by level grouping nodes.
pub const PLANENUM_LEAF: i32 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Lump {
    pub fileofs: i32,
    pub filelen: i32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DModel {
    pub mins: [f32; 3],
    pub maxs: [f32; 3],
    pub origin: [f32; 3],
    pub headnode: i32,
    pub firstface: i32,
    pub numfaces: i32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DPlane {
    pub normal: [f32; 3],
    pub dist: f32,
    pub plane_type: i32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DNode {
    pub planenum: i32,
    pub children: [i32; 2],
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstface: u16,
    pub numfaces: u16,
}

#[derive(Debug, Clone)]
#[repr(C)]
pub struct TexInfo {
    pub vecs: [[f32; 4]; 2],
    pub flags: i32,
    pub value: i32,
    pub texture: [u8; 32],
    pub nexttexinfo: i32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DLeaf {
    pub contents: i32,
    pub cluster: i16,
    pub area: i16,
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstleafface: u16,
    pub numleaffaces: u16,
    pub firstleafbrush: u16,
    pub numleafbrushes: u16,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DBrushSide {
    pub planenum: u16,
    pub texinfo: i16,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DBrush {
    pub firstside: i32,
    pub numsides: i32,
    pub contents: i32,
}

// ============================================================
// Little-endian record writers
// ============================================================

fn put_f32s(out: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_i16s(out: &mut Vec<u8>, values: &[i16]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

impl DModel {
    pub fn write(&self, out: &mut Vec<u8>) {
        put_f32s(out, &self.mins);
        put_f32s(out, &self.maxs);
        put_f32s(out, &self.origin);
        out.extend_from_slice(&self.headnode.to_le_bytes());
        out.extend_from_slice(&self.firstface.to_le_bytes());
        out.extend_from_slice(&self.numfaces.to_le_bytes());
    }
}

impl DPlane {
    pub fn write(&self, out: &mut Vec<u8>) {
        put_f32s(out, &self.normal);
        out.extend_from_slice(&self.dist.to_le_bytes());
        out.extend_from_slice(&self.plane_type.to_le_bytes());
    }
}

impl DNode {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.planenum.to_le_bytes());
        out.extend_from_slice(&self.children[0].to_le_bytes());
        out.extend_from_slice(&self.children[1].to_le_bytes());
        put_i16s(out, &self.mins);
        put_i16s(out, &self.maxs);
        out.extend_from_slice(&self.firstface.to_le_bytes());
        out.extend_from_slice(&self.numfaces.to_le_bytes());
    }
}

impl TexInfo {
    pub fn named(name: &str, flags: i32, value: i32) -> Self {
        let mut texture = [0u8; 32];
        for (dst, src) in texture.iter_mut().zip(name.bytes().take(31)) {
            *dst = src;
        }
        Self {
            vecs: [[0.0; 4]; 2],
            flags,
            value,
            texture,
            nexttexinfo: -1,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        put_f32s(out, &self.vecs[0]);
        put_f32s(out, &self.vecs[1]);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.texture);
        out.extend_from_slice(&self.nexttexinfo.to_le_bytes());
    }
}

impl DLeaf {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.contents.to_le_bytes());
        out.extend_from_slice(&self.cluster.to_le_bytes());
        out.extend_from_slice(&self.area.to_le_bytes());
        put_i16s(out, &self.mins);
        put_i16s(out, &self.maxs);
        out.extend_from_slice(&self.firstleafface.to_le_bytes());
        out.extend_from_slice(&self.numleaffaces.to_le_bytes());
        out.extend_from_slice(&self.firstleafbrush.to_le_bytes());
        out.extend_from_slice(&self.numleafbrushes.to_le_bytes());
    }
}

impl DBrushSide {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.planenum.to_le_bytes());
        out.extend_from_slice(&self.texinfo.to_le_bytes());
    }
}

impl DBrush {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.firstside.to_le_bytes());
        out.extend_from_slice(&self.numsides.to_le_bytes());
        out.extend_from_slice(&self.contents.to_le_bytes());
    }
}

/// Write a complete BSP blob: header, lump directory and 4-byte aligned lump payloads.
pub fn assemble_bsp(lumps: &[Vec<u8>; HEADER_LUMPS]) -> Vec<u8> {
    let mut directory = [Lump::default(); HEADER_LUMPS];
    let mut body = Vec::new();
    for (i, payload) in lumps.iter().enumerate() {
        directory[i].fileofs = (HEADER_SIZE + body.len()) as i32;
        directory[i].filelen = payload.len() as i32;
        body.extend_from_slice(payload);
        while body.len() % 4 != 0 {
            body.push(0);
        }
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&IDBSPHEADER.to_le_bytes());
    out.extend_from_slice(&BSPVERSION.to_le_bytes());
    for lump in &directory {
        out.extend_from_slice(&lump.fileofs.to_le_bytes());
        out.extend_from_slice(&lump.filelen.to_le_bytes());
    }
    out.extend_from_slice(&body);
    out
}

// =============================================================================
// Tests
// =============================================================================
