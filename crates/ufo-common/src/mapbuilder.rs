// mapbuilder.rs — compile axis-aligned box brushes into a BSP tile
//
// Brushes are assigned to level models (slots 0..NUM_REGULAR_MODELS) or to
// inline models. Each level's brushes are first split into groups that are
// separated by a gap on x or y; every group gets its own plane tree under a
// planeless grouping node, the layout the line test accelerator expects.

use crate::q_shared::{Contents, Vec3, NUM_REGULAR_MODELS};
use crate::qfiles::{
    assemble_bsp, DBrush, DBrushSide, DLeaf, DModel, DNode, DPlane, TexInfo, HEADER_LUMPS,
    LUMP_BRUSHES, LUMP_BRUSHSIDES, LUMP_ENTITIES, LUMP_LEAFBRUSHES, LUMP_LEAFS, LUMP_MODELS,
    LUMP_NODES, LUMP_PLANES, LUMP_ROUTING, LUMP_TEXINFO, PLANENUM_LEAF,
};
use crate::routing::{compress_routing, RoutingLump};

#[derive(Debug, Clone, Copy)]
struct BrushDef {
    model: usize,
    mins: Vec3,
    maxs: Vec3,
    contents: Contents,
}

#[derive(Debug, Clone)]
struct InlineDef {
    classname: String,
}

/// In-memory map compiler for box brushes.
#[derive(Debug, Clone, Default)]
pub struct MapBuilder {
    brushes: Vec<BrushDef>,
    inline: Vec<InlineDef>,
    routing: Option<Vec<u8>>,
}

#[derive(Default)]
struct Writer {
    planes: Vec<DPlane>,
    nodes: Vec<DNode>,
    leafs: Vec<DLeaf>,
    leafbrushes: Vec<u16>,
}

/// Leaf index shared by every empty region.
const EMPTY_LEAF: i32 = 1;

fn to_i16(v: &Vec3) -> [i16; 3] {
    [
        v[0].clamp(i16::MIN as f32, i16::MAX as f32) as i16,
        v[1].clamp(i16::MIN as f32, i16::MAX as f32) as i16,
        v[2].clamp(i16::MIN as f32, i16::MAX as f32) as i16,
    ]
}

impl Writer {
    /// Plane index for an axial plane; `sign` -1 stores the flipped plane.
    fn plane(&mut self, axis: usize, sign: f32, dist: f32) -> usize {
        let mut normal = [0.0f32; 3];
        normal[axis] = sign;
        let dist = dist * sign;
        if let Some(idx) = self
            .planes
            .iter()
            .position(|p| p.normal == normal && p.dist == dist)
        {
            return idx;
        }
        let plane_type = if sign > 0.0 { axis } else { 3 + axis } as i32;
        self.planes.push(DPlane {
            normal,
            dist,
            plane_type,
        });
        self.planes.len() - 1
    }

    fn emit_leaf(&mut self, defs: &[BrushDef], ids: &[usize]) -> i32 {
        if ids.is_empty() {
            return -1 - EMPTY_LEAF;
        }
        let contents = ids
            .iter()
            .fold(Contents::empty(), |acc, &b| acc | defs[b].contents);
        let first = self.leafbrushes.len();
        self.leafbrushes.extend(ids.iter().map(|&b| b as u16));
        self.leafs.push(DLeaf {
            contents: contents.bits() as i32,
            firstleafbrush: first as u16,
            numleafbrushes: ids.len() as u16,
            ..DLeaf::default()
        });
        -(self.leafs.len() as i32)
    }

    /// Plane tree over `ids` inside the region mins..maxs.
    fn build_bsp(&mut self, defs: &[BrushDef], ids: &[usize], mins: Vec3, maxs: Vec3) -> i32 {
        let split = ids.iter().find_map(|&b| {
            let brush = &defs[b];
            (0..3).find_map(|axis| {
                [brush.mins[axis], brush.maxs[axis]]
                    .into_iter()
                    .find(|&v| v > mins[axis] && v < maxs[axis])
                    .map(|v| (axis, v))
            })
        });

        let Some((axis, v)) = split else {
            return self.emit_leaf(defs, ids);
        };

        let idx = self.nodes.len();
        let planenum = self.plane(axis, 1.0, v) as i32;
        self.nodes.push(DNode {
            planenum,
            mins: to_i16(&mins),
            maxs: to_i16(&maxs),
            ..DNode::default()
        });

        let front: Vec<usize> = ids.iter().copied().filter(|&b| defs[b].maxs[axis] > v).collect();
        let back: Vec<usize> = ids.iter().copied().filter(|&b| defs[b].mins[axis] < v).collect();

        let mut front_mins = mins;
        front_mins[axis] = v;
        let mut back_maxs = maxs;
        back_maxs[axis] = v;

        let front_child = self.build_bsp(defs, &front, front_mins, maxs);
        let back_child = self.build_bsp(defs, &back, mins, back_maxs);
        self.nodes[idx].children = [front_child, back_child];
        idx as i32
    }

    /// Split brushes into x/y separated groups, then build a plane tree per group.
    fn build_group(&mut self, defs: &[BrushDef], ids: &[usize]) -> i32 {
        let (mins, maxs) = bounds(defs, ids);

        for axis in 0..2 {
            let mut sorted = ids.to_vec();
            sorted.sort_by(|&a, &b| defs[a].mins[axis].total_cmp(&defs[b].mins[axis]));
            let mut reach = f32::MIN;
            for k in 1..sorted.len() {
                reach = reach.max(defs[sorted[k - 1]].maxs[axis]);
                if reach < defs[sorted[k]].mins[axis] {
                    let idx = self.nodes.len();
                    self.nodes.push(DNode {
                        planenum: PLANENUM_LEAF,
                        mins: to_i16(&mins),
                        maxs: to_i16(&maxs),
                        ..DNode::default()
                    });
                    let low = self.build_group(defs, &sorted[..k]);
                    let high = self.build_group(defs, &sorted[k..]);
                    self.nodes[idx].children = [low, high];
                    return idx as i32;
                }
            }
        }

        let region_mins = [mins[0] - 1.0, mins[1] - 1.0, mins[2] - 1.0];
        let region_maxs = [maxs[0] + 1.0, maxs[1] + 1.0, maxs[2] + 1.0];
        let root = self.build_bsp(defs, ids, region_mins, region_maxs);
        if root >= 0 {
            // grouping nodes above compare the tight bounds of their children
            self.nodes[root as usize].mins = to_i16(&mins);
            self.nodes[root as usize].maxs = to_i16(&maxs);
        }
        root
    }
}

fn bounds(defs: &[BrushDef], ids: &[usize]) -> (Vec3, Vec3) {
    let mut mins = [f32::MAX; 3];
    let mut maxs = [f32::MIN; 3];
    for &b in ids {
        for j in 0..3 {
            mins[j] = mins[j].min(defs[b].mins[j]);
            maxs[j] = maxs[j].max(defs[b].maxs[j]);
        }
    }
    (mins, maxs)
}

impl MapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a box brush to the level model in slot `level`.
    pub fn add_brush(&mut self, level: usize, mins: Vec3, maxs: Vec3, contents: Contents) -> &mut Self {
        debug_assert!(level < NUM_REGULAR_MODELS);
        self.brushes.push(BrushDef {
            model: level,
            mins,
            maxs,
            contents,
        });
        self
    }

    /// Add an inline model made of solid box brushes; returns its `*N` name.
    pub fn add_inline_model(&mut self, classname: &str, boxes: &[(Vec3, Vec3)]) -> String {
        let slot = NUM_REGULAR_MODELS + self.inline.len();
        for (mins, maxs) in boxes {
            self.brushes.push(BrushDef {
                model: slot,
                mins: *mins,
                maxs: *maxs,
                contents: Contents::SOLID,
            });
        }
        self.inline.push(InlineDef {
            classname: classname.to_string(),
        });
        format!("*{}", self.inline.len())
    }

    /// Embed a baked routing lump.
    pub fn set_routing(&mut self, lump: &RoutingLump) -> &mut Self {
        self.routing = Some(compress_routing(lump));
        self
    }

    fn entity_string(&self) -> String {
        let mut out = String::from("{\n\"classname\" \"worldspawn\"\n}\n");
        for (i, def) in self.inline.iter().enumerate() {
            out.push_str(&format!(
                "{{\n\"classname\" \"{}\"\n\"model\" \"*{}\"\n}}\n",
                def.classname,
                i + 1
            ));
        }
        out
    }

    /// Compile everything into a BSP blob.
    pub fn build(&self) -> Vec<u8> {
        let defs = &self.brushes;
        let mut w = Writer::default();

        // leaf 0 is the solid outside leaf, leaf 1 the shared empty leaf
        w.leafs.push(DLeaf {
            contents: Contents::SOLID.bits() as i32,
            ..DLeaf::default()
        });
        w.leafs.push(DLeaf::default());

        // brushes and their six sides, in definition order
        let mut dbrushes = Vec::with_capacity(defs.len());
        let mut dsides = Vec::with_capacity(defs.len() * 6);
        for def in defs {
            dbrushes.push(DBrush {
                firstside: dsides.len() as i32,
                numsides: 6,
                contents: def.contents.bits() as i32,
            });
            for axis in 0..3 {
                dsides.push(DBrushSide {
                    planenum: w.plane(axis, 1.0, def.maxs[axis]) as u16,
                    texinfo: 0,
                });
                dsides.push(DBrushSide {
                    planenum: w.plane(axis, -1.0, def.mins[axis]) as u16,
                    texinfo: 0,
                });
            }
        }

        let num_models = NUM_REGULAR_MODELS + self.inline.len();
        let mut models = Vec::with_capacity(num_models);
        for slot in 0..num_models {
            let ids: Vec<usize> = (0..defs.len()).filter(|&b| defs[b].model == slot).collect();
            if ids.is_empty() {
                models.push(DModel {
                    headnode: -1,
                    ..DModel::default()
                });
                continue;
            }
            let (mins, maxs) = bounds(defs, &ids);
            let headnode = w.build_group(defs, &ids);
            models.push(DModel {
                mins,
                maxs,
                headnode,
                ..DModel::default()
            });
        }

        let mut lumps: [Vec<u8>; HEADER_LUMPS] = Default::default();

        let mut ents = self.entity_string().into_bytes();
        ents.push(0);
        lumps[LUMP_ENTITIES] = ents;

        for p in &w.planes {
            p.write(&mut lumps[LUMP_PLANES]);
        }
        for n in &w.nodes {
            n.write(&mut lumps[LUMP_NODES]);
        }
        TexInfo::named("tex_common/nodraw", 0, 0).write(&mut lumps[LUMP_TEXINFO]);
        for l in &w.leafs {
            l.write(&mut lumps[LUMP_LEAFS]);
        }
        for lb in &w.leafbrushes {
            lumps[LUMP_LEAFBRUSHES].extend_from_slice(&lb.to_le_bytes());
        }
        for m in &models {
            m.write(&mut lumps[LUMP_MODELS]);
        }
        for b in &dbrushes {
            b.write(&mut lumps[LUMP_BRUSHES]);
        }
        for s in &dsides {
            s.write(&mut lumps[LUMP_BRUSHSIDES]);
        }
        if let Some(routing) = &self.routing {
            lumps[LUMP_ROUTING] = routing.clone();
        }

        assemble_bsp(&lumps)
    }
}

// =============================================================================
// Tests
// =============================================================================
