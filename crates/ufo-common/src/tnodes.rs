// tnodes.rs — compact line-of-sight trees built from the level models
//
// Each regular level model of a tile is flattened into a tree of tnodes: the
// plane of every BSP node plus a single bit per leaf telling whether a line
// reaching it is blocked. Level grouping nodes become axial separation planes
// where the two groups do not overlap, or PLANE_NONE nodes where they do.

use crate::cmodel::{inline_model_bounds, CModelError, MapTile, MapTiles};
use crate::q_shared::{
    dot_product, level_is_traced, vector_compare, vector_lerp, vector_nearer, Contents,
    TraceLevels, Vec3, NUM_REGULAR_MODELS, PLANE_NONE, PLANE_X, PLANE_Y, PLANE_Z,
};
use crate::tracing::{swept_box_overlaps, transformed_box_trace};
use log::debug;

/// Child bit marking a leaf; the low bits are 1 for blocked leafs.
pub const TNODE_LEAF: u32 = 1 << 31;

pub const ON_EPSILON: f32 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TNode {
    pub plane_type: u8,
    pub normal: Vec3,
    pub dist: f32,
    pub children: [u32; 2],
}

/// Root of one level's tnode tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct THead {
    pub node: u32,
    pub level: usize,
}

/// Root of a plane subtree, used by complete box traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CHead {
    pub cnode: usize,
    pub level: usize,
}

struct TNodeBuilder<'a> {
    tile: &'a MapTile,
    tnodes: Vec<TNode>,
    cheads: Vec<CHead>,
}

impl TNodeBuilder<'_> {
    fn next_index(&self) -> u32 {
        self.tnodes.len() as u32
    }

    /// Convert a plane subtree.
    fn make_tnode(&mut self, nodenum: usize, level: usize) -> Result<(), CModelError> {
        let tile = self.tile;
        let node = &tile.nodes[nodenum];
        let Some(plane_idx) = node.plane_idx else {
            return self.build_tnode_r(nodenum, level);
        };
        let plane = &tile.planes[plane_idx];

        let t = self.tnodes.len();
        self.tnodes.push(TNode {
            plane_type: plane.plane_type,
            normal: plane.normal,
            dist: plane.dist,
            children: [0; 2],
        });

        for i in 0..2 {
            let child = node.children[i];
            if child < 0 {
                let leaf = &tile.leafs[(-1 - child) as usize];
                let blocked = leaf.contents.blocks_line();
                self.tnodes[t].children[i] = TNODE_LEAF | blocked as u32;
            } else {
                self.tnodes[t].children[i] = self.next_index();
                self.make_tnode(child as usize, level)?;
            }
        }
        Ok(())
    }

    fn build_tnode_r(&mut self, nodenum: usize, level: usize) -> Result<(), CModelError> {
        let tile = self.tile;
        let node = &tile.nodes[nodenum];

        if node.plane_idx.is_some() {
            self.cheads.push(CHead { cnode: nodenum, level });
            return self.make_tnode(nodenum, level);
        }

        // level grouping node
        let t = self.tnodes.len();
        self.tnodes.push(TNode::default());

        if node.children[0] < 0 || node.children[1] < 0 {
            return Err(CModelError::UnexpectedLeaf(nodenum));
        }
        let c0 = node.children[0] as usize;
        let c1 = node.children[1] as usize;
        let c0maxs = tile.nodes[c0].maxs;
        let c1mins = tile.nodes[c1].mins;

        for axis in 0..2 {
            if c0maxs[axis] <= c1mins[axis] {
                // create a separation plane
                let mut normal = [0.0; 3];
                normal[axis] = 1.0;
                self.tnodes[t].plane_type = axis as u8;
                self.tnodes[t].normal = normal;
                self.tnodes[t].dist = (c0maxs[axis] + c1mins[axis]) / 2.0;

                self.tnodes[t].children[1] = self.next_index();
                self.build_tnode_r(c0, level)?;
                self.tnodes[t].children[0] = self.next_index();
                self.build_tnode_r(c1, level)?;
                return Ok(());
            }
        }

        // can't construct such a separation plane
        self.tnodes[t].plane_type = PLANE_NONE;
        for (i, child) in [c0, c1].into_iter().enumerate() {
            self.tnodes[t].children[i] = self.next_index();
            self.build_tnode_r(child, level)?;
        }
        Ok(())
    }
}

/// Build the tnodes, theads and cheads of a freshly loaded tile.
pub fn make_tnodes(tile: &mut MapTile) -> Result<(), CModelError> {
    let mut theads = Vec::new();
    let (tnodes, cheads) = {
        let mut builder = TNodeBuilder {
            tile: &*tile,
            tnodes: Vec::with_capacity(tile.numnodes + 1),
            cheads: Vec::new(),
        };

        for (level, model) in tile.models.iter().enumerate().take(NUM_REGULAR_MODELS) {
            if model.headnode < 0 || model.headnode as usize >= tile.numnodes {
                continue;
            }
            theads.push(THead {
                node: builder.next_index(),
                level,
            });
            builder.build_tnode_r(model.headnode as usize, level)?;
        }
        (builder.tnodes, builder.cheads)
    };

    debug!(
        "tile {}: {} tnodes, {} theads, {} cheads",
        tile.idx,
        tnodes.len(),
        theads.len(),
        cheads.len()
    );
    tile.tnodes = tnodes;
    tile.theads = theads;
    tile.cheads = cheads;
    Ok(())
}

// ============================================================
// Line tests
// ============================================================

fn plane_distances(t: &TNode, start: &Vec3, stop: &Vec3) -> (f32, f32) {
    match t.plane_type {
        PLANE_X | PLANE_Y | PLANE_Z => {
            let axis = t.plane_type as usize;
            (start[axis] - t.dist, stop[axis] - t.dist)
        }
        _ => (
            dot_product(start, &t.normal) - t.dist,
            dot_product(stop, &t.normal) - t.dist,
        ),
    }
}

fn test_line_r(tnodes: &[TNode], node: u32, start: &Vec3, stop: &Vec3) -> bool {
    if node & TNODE_LEAF != 0 {
        return node & !TNODE_LEAF != 0;
    }

    let t = &tnodes[node as usize];
    if t.plane_type == PLANE_NONE {
        return test_line_r(tnodes, t.children[0], start, stop)
            || test_line_r(tnodes, t.children[1], start, stop);
    }

    let (front, back) = plane_distances(t, start, stop);
    if front >= -ON_EPSILON && back >= -ON_EPSILON {
        test_line_r(tnodes, t.children[0], start, stop)
    } else if front < ON_EPSILON && back < ON_EPSILON {
        test_line_r(tnodes, t.children[1], start, stop)
    } else {
        let side = (front < 0.0) as usize;
        let frac = front / (front - back);
        let mid = vector_lerp(start, stop, frac);

        test_line_r(tnodes, t.children[side], start, &mid)
            || test_line_r(tnodes, t.children[side ^ 1], &mid, stop)
    }
}

/// Like test_line_r, but returns where the line first enters a blocked leaf.
fn test_line_dist_r(tnodes: &[TNode], node: u32, start: &Vec3, stop: &Vec3) -> Option<Vec3> {
    if node & TNODE_LEAF != 0 {
        return if node & !TNODE_LEAF != 0 { Some(*start) } else { None };
    }

    let t = &tnodes[node as usize];
    if t.plane_type == PLANE_NONE {
        let a = test_line_dist_r(tnodes, t.children[0], start, stop);
        let b = test_line_dist_r(tnodes, t.children[1], start, stop);
        return match (a, b) {
            (Some(a), Some(b)) => Some(if vector_nearer(&a, &b, start) { a } else { b }),
            (a, b) => a.or(b),
        };
    }

    let (front, back) = plane_distances(t, start, stop);
    if front >= -ON_EPSILON && back >= -ON_EPSILON {
        test_line_dist_r(tnodes, t.children[0], start, stop)
    } else if front < ON_EPSILON && back < ON_EPSILON {
        test_line_dist_r(tnodes, t.children[1], start, stop)
    } else {
        let side = (front < 0.0) as usize;
        let frac = front / (front - back);
        let mid = vector_lerp(start, stop, frac);

        test_line_dist_r(tnodes, t.children[side], start, &mid)
            .or_else(|| test_line_dist_r(tnodes, t.children[side ^ 1], &mid, stop))
    }
}

fn tile_test_line(tile: &MapTile, start: &Vec3, stop: &Vec3, levels: TraceLevels) -> bool {
    tile.theads
        .iter()
        .filter(|head| level_is_traced(head.level, levels))
        .any(|head| test_line_r(&tile.tnodes, head.node, start, stop))
}

/// Is the line between start and stop blocked by any level selected in `levels`?
pub fn test_line(tiles: &MapTiles, start: &Vec3, stop: &Vec3, levels: TraceLevels) -> bool {
    tiles
        .tiles()
        .iter()
        .any(|tile| tile_test_line(tile, start, stop, levels))
}

/// First contact of the line with blocking geometry, or None when the line is clear.
pub fn test_line_dm(tiles: &MapTiles, start: &Vec3, stop: &Vec3, levels: TraceLevels) -> Option<Vec3> {
    let mut end = *stop;
    for tile in tiles.tiles() {
        for head in &tile.theads {
            if !level_is_traced(head.level, levels) {
                continue;
            }
            if let Some(contact) = test_line_dist_r(&tile.tnodes, head.node, start, stop) {
                if vector_nearer(&contact, &end, start) {
                    end = contact;
                }
            }
        }
    }

    if vector_compare(&end, stop) {
        None
    } else {
        Some(end)
    }
}

/// World line test followed by the listed inline models.
pub fn ent_test_line(
    tiles: &MapTiles,
    start: &Vec3,
    stop: &Vec3,
    levels: TraceLevels,
    inline_list: &[&str],
) -> Result<bool, CModelError> {
    if test_line(tiles, start, stop, levels) {
        return Ok(true);
    }
    for name in inline_list {
        if inline_contact(tiles, name, start, stop)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// World line test with contact, shortened by the listed inline models.
pub fn ent_test_line_dm(
    tiles: &MapTiles,
    start: &Vec3,
    stop: &Vec3,
    levels: TraceLevels,
    inline_list: &[&str],
) -> Result<Option<Vec3>, CModelError> {
    let mut contact = test_line_dm(tiles, start, stop, levels);
    for name in inline_list {
        if let Some(hit) = inline_contact(tiles, name, start, stop)? {
            contact = match contact {
                Some(c) if !vector_nearer(&hit, &c, start) => Some(c),
                _ => Some(hit),
            };
        }
    }
    Ok(contact)
}

fn inline_contact(
    tiles: &MapTiles,
    name: &str,
    start: &Vec3,
    stop: &Vec3,
) -> Result<Option<Vec3>, CModelError> {
    let model = tiles.inline_model(name)?;
    let (mins, maxs) = inline_model_bounds(model);
    if !swept_box_overlaps(start, stop, &[0.0; 3], &[0.0; 3], &mins, &maxs) {
        return Ok(None);
    }
    let Some(tile) = tiles.tile(model.tile) else {
        return Ok(None);
    };

    let tr = transformed_box_trace(
        tile,
        start,
        stop,
        &[0.0; 3],
        &[0.0; 3],
        model.headnode,
        Contents::MASK_IMPASSABLE,
        Contents::PASSABLE,
        &model.origin,
        &model.angles,
    );
    Ok(if tr.startsolid {
        Some(*start)
    } else if tr.fraction < 1.0 {
        Some(tr.endpos)
    } else {
        None
    })
}

// =============================================================================
// Tests
// =============================================================================
