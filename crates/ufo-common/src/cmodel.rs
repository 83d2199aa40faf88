// cmodel.rs — map tile loading and tile-level collision queries
//
// Every tile is one BSP blob placed into the world at a cell shift. The tile
// owns its planes, nodes, leafs and brushes, the synthetic box hull appended
// after them, the line-test tnodes built from its level models and the baked
// routing lump, if any.

use crate::md4::com_block_checksum;
use crate::q_shared::{
    angle_vectors, box_on_plane_side, com_parse, create_rotation_matrix, dot_product,
    rotate_vector, vector_add, vector_center_from_mins_maxs, vector_not_empty, vector_subtract,
    CModel, CPlane, CSurface, Contents, Vec3, NUM_REGULAR_MODELS, PATHFINDING_HEIGHT,
    PLANE_ANYX, UNIT_HEIGHT, UNIT_SIZE,
};
use crate::qfiles::{
    Lump, BSPVERSION, DBRUSHSIDE_SIZE, DBRUSH_SIZE, DLEAFBRUSH_SIZE, DLEAF_SIZE, DMODEL_SIZE,
    DNODE_SIZE, DPLANE_SIZE, HEADER_LUMPS, HEADER_SIZE, IDBSPHEADER, LUMP_BRUSHES,
    LUMP_BRUSHSIDES, LUMP_ENTITIES, LUMP_LEAFBRUSHES, LUMP_LEAFS, LUMP_MODELS, LUMP_NODES,
    LUMP_PLANES, LUMP_ROUTING, LUMP_TEXINFO, MAX_MAPTILES, MAX_MAP_BRUSHES, MAX_MAP_BRUSHSIDES,
    MAX_MAP_ENTSTRING, MAX_MAP_LEAFBRUSHES, MAX_MAP_LEAFS, MAX_MAP_MODELS, MAX_MAP_NODES,
    MAX_MAP_PLANES, MAX_MAP_ROUTING, MAX_MAP_TEXINFO, PLANENUM_LEAF, TEXINFO_SIZE,
};
use crate::routing::{decompress_routing, RoutingLump};
use crate::tnodes::{make_tnodes, CHead, THead, TNode};
use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;

// ============================================================
// Errors
// ============================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CModelError {
    #[error("not an IBSP file")]
    BadMagic,
    #[error("wrong version number ({found} should be {expected})")]
    BadVersion { found: i32, expected: i32 },
    #[error("BSP data too short for {0}")]
    Truncated(&'static str),
    #[error("funny lump size ({0})")]
    FunnyLumpSize(&'static str),
    #[error("map has too many {what} ({count} > {max})")]
    TooMany {
        what: &'static str,
        count: usize,
        max: usize,
    },
    #[error("map with no {0}")]
    NoEntries(&'static str),
    #[error("map has {0} models, the level models are missing")]
    MissingLevels(usize),
    #[error("bad {what} reference {index}")]
    BadReference { what: &'static str, index: i64 },
    #[error("map leaf 0 is not CONTENTS_SOLID")]
    SolidLeaf,
    #[error("map does not have an empty leaf")]
    NoEmptyLeaf,
    #[error("level grouping node {0} has a leaf child")]
    UnexpectedLeaf(usize),
    #[error("too many map tiles (max {max})", max = MAX_MAPTILES)]
    TooManyTiles,
    #[error("invalid tile shift {0:?}")]
    BadShift([i32; 3]),
    #[error("BAD routing lump ({decoded} bytes decoded)")]
    BadRouting { decoded: usize },
    #[error("bad inline model name '{0}'")]
    BadInlineName(String),
    #[error("bad inline model number '{0}'")]
    BadInlineNumber(String),
}

// ============================================================
// Internal structures (not in the BSP file, but used at runtime)
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct CNode {
    /// None for level grouping nodes.
    pub plane_idx: Option<usize>,
    pub children: [i32; 2], // negative numbers are leafs
    pub mins: Vec3,
    pub maxs: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct CBrushSide {
    pub plane_idx: usize,
    /// None means the shared null surface.
    pub surface_idx: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CLeaf {
    pub contents: Contents,
    pub firstleafbrush: u16,
    pub numleafbrushes: u16,
}

#[derive(Debug, Clone, Default)]
pub struct CBrush {
    pub contents: Contents,
    pub numsides: usize,
    pub firstbrushside: usize,
}

/// Parallel threshold for lump parsing - below this count, sequential is faster
const PARALLEL_LUMP_THRESHOLD: usize = 64;

/// Maximum number of leafs collected by a box leaf enumeration.
pub const MAX_BOX_LEAFS: usize = 1024;

// ============================================================
// BSP byte helpers
// ============================================================

fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse `count` fixed-size records, in parallel for large lumps.
fn parse_records<T, F>(count: usize, parse: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if count >= PARALLEL_LUMP_THRESHOLD {
        (0..count).into_par_iter().map(parse).collect()
    } else {
        (0..count).map(parse).collect()
    }
}

/// Validate a lump against the blob and the record stride; returns (offset, count).
fn lump_records(
    data: &[u8],
    lump: &Lump,
    stride: usize,
    max: usize,
    what: &'static str,
) -> Result<(usize, usize), CModelError> {
    if lump.fileofs < 0 || lump.filelen < 0 {
        return Err(CModelError::Truncated(what));
    }
    let ofs = lump.fileofs as usize;
    let len = lump.filelen as usize;
    if ofs + len > data.len() {
        return Err(CModelError::Truncated(what));
    }
    if len % stride != 0 {
        return Err(CModelError::FunnyLumpSize(what));
    }
    let count = len / stride;
    if count > max {
        return Err(CModelError::TooMany { what, count, max });
    }
    Ok((ofs, count))
}

// ============================================================
// Tile
// ============================================================

/// One loaded BSP tile.
#[derive(Debug, Clone, Default)]
pub struct MapTile {
    pub name: String,
    pub idx: usize,
    /// Placement in cells and the equivalent world offset.
    pub shift: [i32; 3],
    pub world_shift: Vec3,

    pub planes: Vec<CPlane>,
    pub nodes: Vec<CNode>,
    pub leafs: Vec<CLeaf>,
    pub leafbrushes: Vec<u16>,
    pub brushes: Vec<CBrush>,
    pub brushsides: Vec<CBrushSide>,
    pub surfaces: Vec<CSurface>,
    pub models: Vec<CModel>,
    pub nullsurface: CSurface,

    /// Number of nodes read from the file; the box hull follows.
    pub numnodes: usize,
    pub emptyleaf: usize,

    // Box hull
    pub box_headnode: usize,
    pub box_planes_start: usize,
    pub box_brush: usize,
    pub box_leaf: usize,

    // Line test accelerator
    pub tnodes: Vec<TNode>,
    pub theads: Vec<THead>,
    pub cheads: Vec<CHead>,

    pub entity_string: String,
    pub checksum: u32,
    pub routing: Option<RoutingLump>,
}

impl MapTile {
    // ============================================================
    // Lump loaders
    // ============================================================

    fn load_surfaces(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        // texinfo: vecs[2][4], flags, value, texture[32], nexttexinfo
        let (ofs, count) =
            lump_records(data, lump, TEXINFO_SIZE, MAX_MAP_TEXINFO, "surfaces")?;

        self.surfaces = parse_records(count, |i| {
            let base = ofs + i * TEXINFO_SIZE;
            let raw = &data[base + 40..base + 72];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            CSurface {
                name: String::from_utf8_lossy(&raw[..end]).into_owned(),
                flags: read_i32_le(data, base + 32),
                value: read_i32_le(data, base + 36),
            }
        });
        Ok(())
    }

    fn load_leafs(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        // dleaf_t layout:
        // contents: i32 (4), cluster: i16 (2), area: i16 (2)
        // mins: [i16; 3] (6), maxs: [i16; 3] (6)
        // firstleafface: u16 (2), numleaffaces: u16 (2)
        // firstleafbrush: u16 (2), numleafbrushes: u16 (2)
        let (ofs, count) = lump_records(data, lump, DLEAF_SIZE, MAX_MAP_LEAFS, "leafs")?;
        if count < 1 {
            return Err(CModelError::NoEntries("leafs"));
        }

        let mut leafs = parse_records(count, |i| {
            let base = ofs + i * DLEAF_SIZE;
            CLeaf {
                contents: Contents::from_file(read_i32_le(data, base)),
                firstleafbrush: read_u16_le(data, base + 24),
                numleafbrushes: read_u16_le(data, base + 26),
            }
        });
        leafs.reserve(1); // box leaf

        if leafs[0].contents != Contents::SOLID {
            return Err(CModelError::SolidLeaf);
        }
        self.emptyleaf = leafs
            .iter()
            .skip(1)
            .position(|l| l.contents.is_empty())
            .map(|p| p + 1)
            .ok_or(CModelError::NoEmptyLeaf)?;
        self.leafs = leafs;
        Ok(())
    }

    fn load_leaf_brushes(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        let (ofs, count) = lump_records(
            data,
            lump,
            DLEAFBRUSH_SIZE,
            MAX_MAP_LEAFBRUSHES,
            "leafbrushes",
        )?;
        self.leafbrushes = parse_records(count, |i| read_u16_le(data, ofs + i * DLEAFBRUSH_SIZE));
        Ok(())
    }

    fn load_planes(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        let (ofs, count) = lump_records(data, lump, DPLANE_SIZE, MAX_MAP_PLANES, "planes")?;
        if count < 1 {
            return Err(CModelError::NoEntries("planes"));
        }

        let shift = self.world_shift;
        self.planes = parse_records(count, |i| {
            let base = ofs + i * DPLANE_SIZE;
            let normal = [
                read_f32_le(data, base),
                read_f32_le(data, base + 4),
                read_f32_le(data, base + 8),
            ];
            let mut plane = CPlane::new(normal, read_f32_le(data, base + 12));
            plane.plane_type = read_i32_le(data, base + 16) as u8;
            // tile shift moves every plane along its normal
            plane.dist += dot_product(&normal, &shift);
            plane
        });
        Ok(())
    }

    fn load_brushes(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        let (ofs, count) = lump_records(data, lump, DBRUSH_SIZE, MAX_MAP_BRUSHES, "brushes")?;

        let brushes = parse_records(count, |i| {
            let base = ofs + i * DBRUSH_SIZE;
            (
                read_i32_le(data, base),
                read_i32_le(data, base + 4),
                read_i32_le(data, base + 8),
            )
        });

        self.brushes = Vec::with_capacity(count + 1); // extra for box brush
        for (firstside, numsides, contents) in brushes {
            if firstside < 0 || numsides < 0 {
                return Err(CModelError::BadReference {
                    what: "brushside",
                    index: firstside as i64,
                });
            }
            self.brushes.push(CBrush {
                contents: Contents::from_file(contents),
                numsides: numsides as usize,
                firstbrushside: firstside as usize,
            });
        }
        Ok(())
    }

    fn load_brush_sides(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        let (ofs, count) = lump_records(
            data,
            lump,
            DBRUSHSIDE_SIZE,
            MAX_MAP_BRUSHSIDES,
            "brushsides",
        )?;

        let sides = parse_records(count, |i| {
            let base = ofs + i * DBRUSHSIDE_SIZE;
            let planenum = read_u16_le(data, base) as usize;
            let texinfo = read_i16_le(data, base + 2);
            CBrushSide {
                plane_idx: planenum,
                surface_idx: if texinfo >= 0 { Some(texinfo as usize) } else { None },
            }
        });

        // Validate indices sequentially to keep the parallel pass error free
        for side in &sides {
            if side.plane_idx >= self.planes.len() {
                return Err(CModelError::BadReference {
                    what: "brushside plane",
                    index: side.plane_idx as i64,
                });
            }
            if let Some(surf) = side.surface_idx {
                if surf >= self.surfaces.len() {
                    return Err(CModelError::BadReference {
                        what: "brushside texinfo",
                        index: surf as i64,
                    });
                }
            }
        }
        for brush in &self.brushes {
            if brush.firstbrushside + brush.numsides > sides.len() {
                return Err(CModelError::BadReference {
                    what: "brushside",
                    index: (brush.firstbrushside + brush.numsides) as i64,
                });
            }
        }
        for &lb in &self.leafbrushes {
            if lb as usize >= self.brushes.len() {
                return Err(CModelError::BadReference {
                    what: "leafbrush",
                    index: lb as i64,
                });
            }
        }
        for leaf in &self.leafs {
            let end = leaf.firstleafbrush as usize + leaf.numleafbrushes as usize;
            if end > self.leafbrushes.len() {
                return Err(CModelError::BadReference {
                    what: "leaf brush list",
                    index: end as i64,
                });
            }
        }

        self.brushsides = sides;
        self.brushsides.reserve(6); // extra for box
        Ok(())
    }

    fn load_submodels(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        // mins[3], maxs[3], origin[3], headnode, firstface, numfaces = 48
        let (ofs, count) = lump_records(data, lump, DMODEL_SIZE, MAX_MAP_MODELS, "submodels")?;
        if count < 1 {
            return Err(CModelError::NoEntries("models"));
        }
        if count < NUM_REGULAR_MODELS {
            return Err(CModelError::MissingLevels(count));
        }

        let shift = self.world_shift;
        let tile = self.idx;
        self.models = parse_records(count, |i| {
            let base = ofs + i * DMODEL_SIZE;
            let mut cm = CModel {
                tile,
                shift,
                ..CModel::default()
            };
            for j in 0..3 {
                // spread the models a bit so point traces on the border still hit
                cm.mins[j] = read_f32_le(data, base + j * 4) - 1.0 + shift[j];
                cm.maxs[j] = read_f32_le(data, base + 12 + j * 4) + 1.0 + shift[j];
            }
            cm.headnode = read_i32_le(data, base + 36);
            cm
        });
        Ok(())
    }

    fn load_nodes(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        // planenum, children[2], short mins[3], short maxs[3], firstface, numfaces = 28
        let (ofs, count) = lump_records(data, lump, DNODE_SIZE, MAX_MAP_NODES, "nodes")?;
        if count < 1 {
            return Err(CModelError::NoEntries("nodes"));
        }

        let shift = self.world_shift;
        let raw = parse_records(count, |i| {
            let base = ofs + i * DNODE_SIZE;
            let mut node = CNode::default();
            for j in 0..3 {
                node.mins[j] = read_i16_le(data, base + 12 + j * 2) as f32 + shift[j];
                node.maxs[j] = read_i16_le(data, base + 18 + j * 2) as f32 + shift[j];
            }
            node.children = [read_i32_le(data, base + 4), read_i32_le(data, base + 8)];
            (read_i32_le(data, base), node)
        });

        self.numnodes = count;
        self.nodes = Vec::with_capacity(count + 6); // extra for box hull
        // nodes are stored in pre-order: a child node always follows its
        // parent, so a corrupt blob can not make the tree cyclic
        for (i, (planenum, mut node)) in raw.into_iter().enumerate() {
            node.plane_idx = if planenum == PLANENUM_LEAF {
                None
            } else if planenum < 0 || planenum as usize >= self.planes.len() {
                return Err(CModelError::BadReference {
                    what: "node plane",
                    index: planenum as i64,
                });
            } else {
                Some(planenum as usize)
            };
            for &child in &node.children {
                let bad = if child >= 0 {
                    child as usize >= count || child as usize <= i
                } else {
                    (-1 - child) as usize >= self.leafs.len()
                };
                if bad {
                    return Err(CModelError::BadReference {
                        what: "node child",
                        index: child as i64,
                    });
                }
            }
            self.nodes.push(node);
        }

        for model in &self.models {
            if model.headnode >= count as i32 || model.headnode < -1 {
                return Err(CModelError::BadReference {
                    what: "model headnode",
                    index: model.headnode as i64,
                });
            }
        }
        Ok(())
    }

    fn load_entity_string(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        let (ofs, len) = lump_records(data, lump, 1, MAX_MAP_ENTSTRING, "entdata")?;
        let raw = &data[ofs..ofs + len];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        self.entity_string = String::from_utf8_lossy(&raw[..end]).into_owned();
        Ok(())
    }

    fn load_routing(&mut self, data: &[u8], lump: &Lump) -> Result<(), CModelError> {
        let (ofs, len) = lump_records(data, lump, 1, MAX_MAP_ROUTING, "routing")?;
        self.routing = if len == 0 {
            None
        } else {
            Some(decompress_routing(&data[ofs..ofs + len])?)
        };
        Ok(())
    }

    // ============================================================
    // Box hull
    // ============================================================

    /// Append the box hull: 6 nodes, 12 planes, 6 brush sides, 1 brush, 1 leaf and
    /// 1 leafbrush. The plane distances are supplied per query by the trace context.
    fn init_box_hull(&mut self) {
        self.box_headnode = self.nodes.len();
        self.box_planes_start = self.planes.len();
        self.box_brush = self.brushes.len();
        self.box_leaf = self.leafs.len();
        let first_side = self.brushsides.len();
        let box_leafbrush = self.leafbrushes.len();

        self.brushes.push(CBrush {
            contents: Contents::WEAPONCLIP,
            numsides: 6,
            firstbrushside: first_side,
        });
        self.leafs.push(CLeaf {
            contents: Contents::WEAPONCLIP,
            firstleafbrush: box_leafbrush as u16,
            numleafbrushes: 1,
        });
        self.leafbrushes.push(self.box_brush as u16);

        let emptyleaf = self.emptyleaf as i32;
        for i in 0..6 {
            let side = i & 1;
            let axis = i >> 1;

            self.brushsides.push(CBrushSide {
                plane_idx: self.box_planes_start + i * 2 + side,
                surface_idx: None,
            });

            let mut children = [0i32; 2];
            children[side] = -1 - emptyleaf;
            children[side ^ 1] = if i != 5 {
                (self.box_headnode + i + 1) as i32
            } else {
                -1 - self.box_leaf as i32
            };
            self.nodes.push(CNode {
                plane_idx: Some(self.box_planes_start + i * 2),
                children,
                mins: [0.0; 3],
                maxs: [0.0; 3],
            });

            let mut normal = [0.0f32; 3];
            normal[axis] = 1.0;
            let mut plane = CPlane::new(normal, 0.0);
            plane.plane_type = axis as u8;
            self.planes.push(plane);

            normal[axis] = -1.0;
            let mut plane = CPlane::new(normal, 0.0);
            plane.plane_type = PLANE_ANYX + axis as u8;
            self.planes.push(plane);
        }
    }

    /// Distances of the twelve box hull planes for the given bounds, in slot order.
    pub fn box_plane_dists(mins: &Vec3, maxs: &Vec3) -> [f32; 12] {
        [
            maxs[0], -maxs[0], mins[0], -mins[0],
            maxs[1], -maxs[1], mins[1], -mins[1],
            maxs[2], -maxs[2], mins[2], -mins[2],
        ]
    }

    pub fn is_box_plane(&self, plane_idx: usize) -> bool {
        plane_idx >= self.box_planes_start && plane_idx < self.box_planes_start + 12
    }

    /// A headnode that can start a descent in this tile.
    pub fn valid_headnode(&self, headnode: i32) -> bool {
        headnode >= 0 && (headnode as usize) < self.nodes.len()
    }

    // ============================================================
    // Point / leaf queries
    // ============================================================

    fn grouping_child(&self, node: &CNode, p: &Vec3) -> i32 {
        // Pick the child whose bounds contain the point; the grouping halves never overlap
        for &child in &node.children {
            if child >= 0 {
                let c = &self.nodes[child as usize];
                if (0..3).all(|j| p[j] >= c.mins[j] && p[j] <= c.maxs[j]) {
                    return child;
                }
            }
        }
        node.children[0]
    }

    pub fn point_leafnum_r(&self, p: &Vec3, mut num: i32) -> usize {
        while num >= 0 {
            let node = &self.nodes[num as usize];
            let plane_idx = match node.plane_idx {
                Some(idx) => idx,
                None => {
                    num = self.grouping_child(node, p);
                    continue;
                }
            };
            let plane = &self.planes[plane_idx];

            let d = if plane.plane_type < 3 {
                p[plane.plane_type as usize] - plane.dist
            } else {
                dot_product(&plane.normal, p) - plane.dist
            };

            num = if d < 0.0 { node.children[1] } else { node.children[0] };
        }
        (-1 - num) as usize
    }

    /// Leaf containing `p` in the level 0 tree.
    pub fn point_leafnum(&self, p: &Vec3) -> usize {
        match self.models.first() {
            Some(m) if self.valid_headnode(m.headnode) => self.point_leafnum_r(p, m.headnode),
            _ => self.emptyleaf,
        }
    }

    pub fn point_contents(&self, p: &Vec3, headnode: i32) -> Contents {
        if !self.valid_headnode(headnode) {
            return Contents::empty();
        }
        let l = self.point_leafnum_r(p, headnode);
        self.leafs[l].contents
    }

    /// Point contents in the frame of a moved and rotated inline model.
    pub fn transformed_point_contents(
        &self,
        p: &Vec3,
        headnode: i32,
        origin: &Vec3,
        angles: &Vec3,
    ) -> Contents {
        let mut p_l = vector_subtract(p, origin);

        if headnode as usize != self.box_headnode && vector_not_empty(angles) {
            let (forward, right, up) = angle_vectors(angles);
            let temp = p_l;
            p_l[0] = dot_product(&temp, &forward);
            p_l[1] = -dot_product(&temp, &right);
            p_l[2] = dot_product(&temp, &up);
        }

        self.point_contents(&p_l, headnode)
    }

    // ============================================================
    // Box leaf enumeration
    // ============================================================

    pub fn box_leafnums_r(
        &self,
        mut nodenum: i32,
        leaf_list: &mut Vec<usize>,
        leaf_maxcount: usize,
        leaf_mins: &Vec3,
        leaf_maxs: &Vec3,
        leaf_topnode: &mut i32,
    ) {
        loop {
            if nodenum < 0 {
                if leaf_list.len() < leaf_maxcount {
                    leaf_list.push((-1 - nodenum) as usize);
                }
                return;
            }

            let node = &self.nodes[nodenum as usize];
            let s = match node.plane_idx {
                Some(idx) => {
                    let mut plane = self.planes[idx];
                    if self.is_box_plane(idx) {
                        // box nodes are only entered through box_leafnums_for_box
                        plane.dist = 0.0;
                    }
                    box_on_plane_side(leaf_mins, leaf_maxs, &plane)
                }
                None => 3,
            };

            if s == 1 {
                nodenum = node.children[0];
            } else if s == 2 {
                nodenum = node.children[1];
            } else {
                if *leaf_topnode == -1 {
                    *leaf_topnode = nodenum;
                }
                self.box_leafnums_r(
                    node.children[0],
                    leaf_list,
                    leaf_maxcount,
                    leaf_mins,
                    leaf_maxs,
                    leaf_topnode,
                );
                nodenum = node.children[1];
            }
        }
    }

    /// Collect up to `listsize` leafs touched by the box; returns the leafs and the top node.
    pub fn box_leafnums_headnode(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        listsize: usize,
        headnode: i32,
    ) -> (Vec<usize>, i32) {
        let mut leaf_list = Vec::with_capacity(listsize.min(64));
        let mut topnode: i32 = -1;
        if self.valid_headnode(headnode) {
            self.box_leafnums_r(headnode, &mut leaf_list, listsize, mins, maxs, &mut topnode);
        }
        (leaf_list, topnode)
    }

    /// Surface of a brush side, falling back to the null surface.
    pub fn side_surface(&self, side: &CBrushSide) -> CSurface {
        match side.surface_idx {
            Some(idx) => self.surfaces[idx].clone(),
            None => self.nullsurface.clone(),
        }
    }
}

/// Parse a tile from its BSP blob. `idx` is the slot it will occupy.
fn load_tile(
    name: &str,
    idx: usize,
    data: &[u8],
    shift: [i32; 3],
    inline_offset: usize,
) -> Result<MapTile, CModelError> {
    if data.len() < HEADER_SIZE {
        return Err(CModelError::Truncated("header"));
    }
    if read_i32_le(data, 0) != IDBSPHEADER {
        return Err(CModelError::BadMagic);
    }
    let version = read_i32_le(data, 4);
    if version != BSPVERSION {
        return Err(CModelError::BadVersion {
            found: version,
            expected: BSPVERSION,
        });
    }

    let mut lumps = [Lump::default(); HEADER_LUMPS];
    for (i, lump) in lumps.iter_mut().enumerate() {
        let base = 8 + i * 8;
        lump.fileofs = read_i32_le(data, base);
        lump.filelen = read_i32_le(data, base + 4);
    }

    let mut tile = MapTile {
        name: name.to_string(),
        idx,
        shift,
        world_shift: [
            (shift[0] * UNIT_SIZE) as f32,
            (shift[1] * UNIT_SIZE) as f32,
            (shift[2] * UNIT_HEIGHT) as f32,
        ],
        ..MapTile::default()
    };

    // Load in dependency order
    tile.load_surfaces(data, &lumps[LUMP_TEXINFO])?;
    tile.load_leafs(data, &lumps[LUMP_LEAFS])?;
    tile.load_leaf_brushes(data, &lumps[LUMP_LEAFBRUSHES])?;
    tile.load_planes(data, &lumps[LUMP_PLANES])?;
    tile.load_brushes(data, &lumps[LUMP_BRUSHES])?;
    tile.load_brush_sides(data, &lumps[LUMP_BRUSHSIDES])?;
    tile.load_submodels(data, &lumps[LUMP_MODELS])?;
    tile.load_nodes(data, &lumps[LUMP_NODES])?;
    tile.load_entity_string(data, &lumps[LUMP_ENTITIES])?;
    tile.load_routing(data, &lumps[LUMP_ROUTING])?;

    tile.init_box_hull();
    make_tnodes(&mut tile)?;

    tile.entity_string = shift_entity_string(&tile.entity_string, inline_offset, &tile.world_shift);
    tile.checksum = com_block_checksum(data);

    debug!(
        "tile {} ({}): {} planes, {} nodes, {} leafs, {} brushes, {} models, {} tnodes, {} cheads, routing {}",
        idx,
        name,
        tile.planes.len() - 12,
        tile.numnodes,
        tile.leafs.len() - 1,
        tile.brushes.len() - 1,
        tile.models.len(),
        tile.tnodes.len(),
        tile.cheads.len(),
        if tile.routing.is_some() { "baked" } else { "missing" },
    );

    Ok(tile)
}

/// Renumber inline model references and move origins by the tile shift.
pub fn shift_entity_string(text: &str, inline_offset: usize, shift: &Vec3) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    let mut rest = Some(text);
    let mut key: Option<String> = None;

    while let Some(data) = rest {
        let (token, remaining) = com_parse(data);
        rest = remaining;
        if token.is_empty() && remaining.is_none() {
            break;
        }

        match token.as_str() {
            "{" | "}" if key.is_none() => {
                out.push_str(&token);
                out.push('\n');
            }
            _ => match key.take() {
                None => key = Some(token),
                Some(k) => {
                    let value = match k.as_str() {
                        "model" if token.starts_with('*') => match token[1..].parse::<usize>() {
                            Ok(n) => format!("*{}", n + inline_offset),
                            Err(_) => token,
                        },
                        "origin" => {
                            let parts: Vec<f32> = token
                                .split_whitespace()
                                .filter_map(|s| s.parse::<f32>().ok())
                                .collect();
                            if parts.len() == 3 {
                                format!(
                                    "{} {} {}",
                                    parts[0] + shift[0],
                                    parts[1] + shift[1],
                                    parts[2] + shift[2]
                                )
                            } else {
                                token
                            }
                        }
                        _ => token,
                    };
                    out.push_str(&format!("\"{}\" \"{}\"\n", k, value));
                }
            },
        }
    }
    out
}

/// World bounds of an inline model after its origin and angles are applied.
pub fn inline_model_bounds(model: &CModel) -> (Vec3, Vec3) {
    if vector_not_empty(&model.angles) {
        let center = vector_center_from_mins_maxs(&model.mins, &model.maxs);
        let half = vector_subtract(&model.maxs, &center);
        let m = create_rotation_matrix(&model.angles);
        let new_center = rotate_vector(&m, &center);
        let mins = vector_add(&vector_subtract(&new_center, &half), &model.origin);
        let maxs = vector_add(&vector_add(&new_center, &half), &model.origin);
        (mins, maxs)
    } else {
        (
            vector_add(&model.mins, &model.origin),
            vector_add(&model.maxs, &model.origin),
        )
    }
}

// ============================================================
// Tile collection
// ============================================================

/// Placement of one tile in a map assembly.
#[derive(Debug, Clone, Copy)]
pub struct TileSpec<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
    pub shift: [i32; 3],
}

/// All tiles of the current map.
#[derive(Debug, Default)]
pub struct MapTiles {
    tiles: Vec<MapTile>,
    num_inline: usize,
    entity_string: String,
}

impl MapTiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a BSP blob into the next tile slot at the given cell shift.
    pub fn add_tile(&mut self, name: &str, data: &[u8], shift: [i32; 3]) -> Result<usize, CModelError> {
        if self.tiles.len() >= MAX_MAPTILES {
            return Err(CModelError::TooManyTiles);
        }
        let half = (crate::q_shared::PATHFINDING_WIDTH / 2) as i32;
        if shift[0].abs() >= half
            || shift[1].abs() >= half
            || shift[2] < 0
            || shift[2] >= PATHFINDING_HEIGHT as i32
        {
            return Err(CModelError::BadShift(shift));
        }

        let idx = self.tiles.len();
        let tile = load_tile(name, idx, data, shift, self.num_inline)?;

        self.num_inline += tile.models.len() - NUM_REGULAR_MODELS;
        self.entity_string.push_str(&tile.entity_string);
        self.tiles.push(tile);
        Ok(idx)
    }

    /// Free everything and load the given tiles in order. Returns the combined checksum.
    pub fn load_map(&mut self, specs: &[TileSpec<'_>]) -> Result<u32, CModelError> {
        self.free_all();
        let mut checksum = 0u32;
        for spec in specs {
            let idx = self.add_tile(spec.name, spec.data, spec.shift)?;
            checksum = checksum.wrapping_add(self.tiles[idx].checksum);
        }
        info!(
            "loaded map of {} tiles, {} inline models",
            self.tiles.len(),
            self.num_inline
        );
        Ok(checksum)
    }

    pub fn free_all(&mut self) {
        self.tiles.clear();
        self.num_inline = 0;
        self.entity_string.clear();
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile(&self, idx: usize) -> Option<&MapTile> {
        self.tiles.get(idx)
    }

    pub fn tiles(&self) -> &[MapTile] {
        &self.tiles
    }

    pub fn num_inline_models(&self) -> usize {
        self.num_inline
    }

    pub fn entity_string(&self) -> &str {
        &self.entity_string
    }

    pub fn checksum(&self) -> u32 {
        self.tiles.iter().fold(0u32, |acc, t| acc.wrapping_add(t.checksum))
    }

    fn inline_model_slot(&self, name: &str) -> Result<(usize, usize), CModelError> {
        let number = name
            .strip_prefix('*')
            .ok_or_else(|| CModelError::BadInlineName(name.to_string()))?;
        let n: usize = number
            .parse()
            .map_err(|_| CModelError::BadInlineNumber(name.to_string()))?;
        if n < 1 || n > self.num_inline {
            return Err(CModelError::BadInlineNumber(name.to_string()));
        }

        let mut num = n - 1;
        for (i, tile) in self.tiles.iter().enumerate() {
            let count = tile.models.len() - NUM_REGULAR_MODELS;
            if num >= count {
                num -= count;
                continue;
            }
            return Ok((i, NUM_REGULAR_MODELS + num));
        }
        Err(CModelError::BadInlineNumber(name.to_string()))
    }

    /// Resolve `*N` to its model record, scanning tiles in load order.
    pub fn inline_model(&self, name: &str) -> Result<&CModel, CModelError> {
        let (tile, slot) = self.inline_model_slot(name)?;
        Ok(&self.tiles[tile].models[slot])
    }

    pub fn set_inline_model_orientation(
        &mut self,
        name: &str,
        origin: &Vec3,
        angles: &Vec3,
    ) -> Result<(), CModelError> {
        let (tile, slot) = self.inline_model_slot(name)?;
        let model = &mut self.tiles[tile].models[slot];
        model.origin = *origin;
        model.angles = *angles;
        Ok(())
    }

    /// Union of the level model bounds of every tile.
    pub fn map_bounds(&self) -> Option<(Vec3, Vec3)> {
        let mut bounds: Option<(Vec3, Vec3)> = None;
        for tile in &self.tiles {
            for model in tile.models.iter().take(NUM_REGULAR_MODELS) {
                if !tile.valid_headnode(model.headnode) {
                    continue;
                }
                let (mins, maxs) = bounds.get_or_insert((model.mins, model.maxs));
                for j in 0..3 {
                    mins[j] = mins[j].min(model.mins[j]);
                    maxs[j] = maxs[j].max(model.maxs[j]);
                }
            }
        }
        bounds
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapbuilder::MapBuilder;
    use crate::qfiles::{assemble_bsp, LUMP_MODELS};

    fn floor_tile() -> Vec<u8> {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_brush(1, [0.0, 0.0, 0.0], [32.0, 32.0, 64.0], Contents::SOLID);
        b.add_inline_model("func_door", &[([64.0, 64.0, 0.0], [96.0, 96.0, 64.0])]);
        b.build()
    }

    #[test]
    fn test_add_tile_shifts_geometry() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        let idx = tiles.add_tile("floor", &data, [2, 0, 1]).unwrap();
        let tile = tiles.tile(idx).unwrap();

        assert_eq!(tile.world_shift, [64.0, 0.0, 64.0]);
        let world = &tile.models[0];
        assert_eq!(world.mins, [63.0, -1.0, 47.0]);
        assert_eq!(world.maxs, [193.0, 129.0, 65.0]);

        // the floor top moved up one band
        let c = tile.point_contents(&[100.0, 10.0, 60.0], world.headnode);
        assert_eq!(c, Contents::SOLID);
        let c = tile.point_contents(&[100.0, 10.0, 70.0], world.headnode);
        assert!(c.is_empty());
    }

    #[test]
    fn test_box_hull_slots_follow_loaded_data() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        tiles.add_tile("floor", &data, [0, 0, 0]).unwrap();
        let tile = tiles.tile(0).unwrap();

        assert_eq!(tile.box_headnode, tile.numnodes);
        assert_eq!(tile.nodes.len(), tile.numnodes + 6);
        assert_eq!(tile.brushes[tile.box_brush].contents, Contents::WEAPONCLIP);
        assert_eq!(tile.leafs[tile.box_leaf].contents, Contents::WEAPONCLIP);
        assert!(tile.is_box_plane(tile.box_planes_start + 11));
        assert!(!tile.is_box_plane(tile.box_planes_start + 12));
        assert!(tile.leafs[tile.emptyleaf].contents.is_empty());
    }

    #[test]
    fn test_inline_model_resolution_across_tiles() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        tiles.add_tile("a", &data, [0, 0, 0]).unwrap();
        tiles.add_tile("b", &data, [4, 0, 0]).unwrap();
        assert_eq!(tiles.num_inline_models(), 2);

        let first = tiles.inline_model("*1").unwrap();
        let second = tiles.inline_model("*2").unwrap();
        assert_eq!(first.tile, 0);
        assert_eq!(second.tile, 1);
        assert_eq!(second.mins[0] - first.mins[0], 128.0);

        assert!(matches!(tiles.inline_model("1"), Err(CModelError::BadInlineName(_))));
        assert!(matches!(tiles.inline_model("*0"), Err(CModelError::BadInlineNumber(_))));
        assert!(matches!(tiles.inline_model("*3"), Err(CModelError::BadInlineNumber(_))));
        assert!(matches!(tiles.inline_model("*x"), Err(CModelError::BadInlineNumber(_))));
    }

    #[test]
    fn test_entity_string_renumbers_models() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        tiles.add_tile("a", &data, [0, 0, 0]).unwrap();
        tiles.add_tile("b", &data, [0, 2, 0]).unwrap();
        let ents = tiles.entity_string();
        assert!(ents.contains("\"model\" \"*1\""), "entities: {}", ents);
        assert!(ents.contains("\"model\" \"*2\""), "entities: {}", ents);
    }

    #[test]
    fn test_shift_entity_string_origin() {
        let out = shift_entity_string(
            "{\n\"classname\" \"info_player_start\"\n\"origin\" \"16 16 8\"\n}\n",
            0,
            &[32.0, 0.0, 64.0],
        );
        assert!(out.contains("\"origin\" \"48 16 72\""), "got {}", out);
    }

    #[test]
    fn test_set_inline_model_orientation() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        tiles.add_tile("a", &data, [0, 0, 0]).unwrap();
        tiles
            .set_inline_model_orientation("*1", &[0.0, 32.0, 0.0], &[0.0, 0.0, 0.0])
            .unwrap();
        let model = tiles.inline_model("*1").unwrap();
        let (mins, maxs) = inline_model_bounds(model);
        assert_eq!(mins, [63.0, 95.0, -1.0]);
        assert_eq!(maxs, [97.0, 129.0, 65.0]);
    }

    #[test]
    fn test_load_map_replaces_previous_tiles() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        tiles.add_tile("old", &data, [0, 0, 0]).unwrap();
        let sum = tiles
            .load_map(&[TileSpec { name: "new", data: &data, shift: [0, 0, 0] }])
            .unwrap();
        assert_eq!(tiles.num_tiles(), 1);
        assert_eq!(tiles.num_inline_models(), 1);
        assert_eq!(sum, tiles.checksum());
        assert_eq!(sum, com_block_checksum(&data));

        tiles.free_all();
        assert_eq!(tiles.num_tiles(), 0);
        assert!(tiles.map_bounds().is_none());
    }

    #[test]
    fn test_corrupt_blobs_are_errors() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();

        assert_eq!(tiles.add_tile("short", &data[..20], [0, 0, 0]), Err(CModelError::Truncated("header")));

        let mut bad_magic = data.clone();
        bad_magic[0] = b'X';
        assert_eq!(tiles.add_tile("magic", &bad_magic, [0, 0, 0]), Err(CModelError::BadMagic));

        let mut bad_version = data.clone();
        bad_version[4..8].copy_from_slice(&38i32.to_le_bytes());
        assert_eq!(
            tiles.add_tile("version", &bad_version, [0, 0, 0]),
            Err(CModelError::BadVersion { found: 38, expected: BSPVERSION })
        );

        assert_eq!(tiles.add_tile("shift", &data, [200, 0, 0]), Err(CModelError::BadShift([200, 0, 0])));

        // a truncated model lump length
        let mut funny = data.clone();
        let base = 8 + LUMP_MODELS * 8 + 4;
        let len = read_i32_le(&funny, base);
        funny[base..base + 4].copy_from_slice(&(len - 3).to_le_bytes());
        assert_eq!(tiles.add_tile("funny", &funny, [0, 0, 0]), Err(CModelError::FunnyLumpSize("submodels")));

        assert_eq!(tiles.num_tiles(), 0);
    }

    #[test]
    fn test_node_cycle_rejected() {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_brush(0, [0.0, 0.0, 0.0], [32.0, 32.0, 64.0], Contents::SOLID);
        let data = b.build();

        // point the first child of node 0 back at node 0
        let mut looped = data.clone();
        let nodes = read_i32_le(&looped, 8 + LUMP_NODES * 8) as usize;
        assert!(read_i32_le(&looped, nodes + 4) > 0 || read_i32_le(&looped, nodes + 8) > 0);
        looped[nodes + 4..nodes + 8].copy_from_slice(&0i32.to_le_bytes());

        let mut tiles = MapTiles::new();
        assert_eq!(
            tiles.add_tile("looped", &looped, [0, 0, 0]),
            Err(CModelError::BadReference { what: "node child", index: 0 })
        );
        assert_eq!(tiles.num_tiles(), 0);
        assert!(tiles.add_tile("intact", &data, [0, 0, 0]).is_ok());
    }

    #[test]
    fn test_missing_level_models_rejected() {
        let mut lumps: [Vec<u8>; HEADER_LUMPS] = Default::default();
        let mut leafs = Vec::new();
        crate::qfiles::DLeaf { contents: 1, ..Default::default() }.write(&mut leafs);
        crate::qfiles::DLeaf::default().write(&mut leafs);
        lumps[LUMP_LEAFS] = leafs;
        let mut planes = Vec::new();
        crate::qfiles::DPlane { normal: [1.0, 0.0, 0.0], dist: 0.0, plane_type: 0 }.write(&mut planes);
        lumps[LUMP_PLANES] = planes;
        let mut models = Vec::new();
        crate::qfiles::DModel::default().write(&mut models);
        lumps[LUMP_MODELS] = models;

        let blob = assemble_bsp(&lumps);
        let mut tiles = MapTiles::new();
        assert_eq!(tiles.add_tile("tiny", &blob, [0, 0, 0]), Err(CModelError::MissingLevels(1)));
    }

    #[test]
    fn test_point_leafnum_and_rotated_contents() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        tiles.add_tile("floor", &data, [0, 0, 0]).unwrap();
        let tile = tiles.tile(0).unwrap();

        assert_eq!(tile.leafs[tile.point_leafnum(&[10.0, 10.0, -8.0])].contents, Contents::SOLID);
        assert!(tile.leafs[tile.point_leafnum(&[100.0, 100.0, 32.0])].contents.is_empty());

        let door = tiles.inline_model("*1").unwrap().headnode;
        let none = [0.0; 3];
        assert_eq!(tile.transformed_point_contents(&[80.0, 80.0, 32.0], door, &none, &none), Contents::SOLID);
        // turned a quarter around the origin the door sits at negative x
        let yaw = [0.0, 90.0, 0.0];
        assert!(tile.transformed_point_contents(&[80.0, 80.0, 32.0], door, &none, &yaw).is_empty());
        assert_eq!(tile.transformed_point_contents(&[-80.0, 80.0, 32.0], door, &none, &yaw), Contents::SOLID);
        // moved up a band
        let up = [0.0, 0.0, 64.0];
        assert!(tile.transformed_point_contents(&[80.0, 80.0, 32.0], door, &up, &none).is_empty());
    }

    #[test]
    fn test_box_leafnums_collects_floor_leafs() {
        let data = floor_tile();
        let mut tiles = MapTiles::new();
        tiles.add_tile("floor", &data, [0, 0, 0]).unwrap();
        let tile = tiles.tile(0).unwrap();
        let head = tile.models[0].headnode;

        let (leafs, top) = tile.box_leafnums_headnode(&[10.0, 10.0, -4.0], &[20.0, 20.0, 4.0], MAX_BOX_LEAFS, head);
        assert!(top >= 0);
        assert!(leafs.iter().any(|&l| tile.leafs[l].contents == Contents::SOLID));
        assert!(leafs.iter().any(|&l| tile.leafs[l].contents.is_empty()));
    }
}
