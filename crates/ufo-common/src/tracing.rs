// tracing.rs — swept box traces against tile BSP trees
//
// Every query owns a TraceContext, so tiles stay immutable and traces are
// reentrant. Brushes already clipped during a query are stamped with the
// query's generation in a per-thread table indexed by brush number.

use crate::cmodel::{inline_model_bounds, CModelError, MapTile, MapTiles, MAX_BOX_LEAFS};
use crate::q_shared::{
    angle_vectors, dot_product, level_is_traced, vector_add, vector_compare, vector_lerp,
    vector_not_empty, vector_scale, vector_subtract, CPlane, Contents, TraceLevels, Trace, Vec3,
};
use log::warn;
use smallvec::SmallVec;
use std::cell::RefCell;

/// 1/32 epsilon to keep floating point happy
pub const DIST_EPSILON: f32 = 0.03125;

/// Check stamps of the brushes tested by traces on this thread.
struct BrushStamps {
    generation: u32,
    stamps: Vec<u32>,
}

thread_local! {
    static BRUSH_STAMPS: RefCell<BrushStamps> = const {
        RefCell::new(BrushStamps {
            generation: 0,
            stamps: Vec::new(),
        })
    };
}

fn next_generation() -> u32 {
    BRUSH_STAMPS.with(|s| {
        let mut s = s.borrow_mut();
        s.generation = s.generation.wrapping_add(1);
        if s.generation == 0 {
            s.stamps.fill(0);
            s.generation = 1;
        }
        s.generation
    })
}

/// Per-query trace state.
pub struct TraceContext<'a> {
    tile: &'a MapTile,
    start: Vec3,
    end: Vec3,
    mins: Vec3,
    maxs: Vec3,
    extents: Vec3,
    ispoint: bool,
    contents: Contents,
    reject: Contents,
    generation: u32,
    box_dists: Option<[f32; 12]>,
    pub trace: Trace,
}

impl<'a> TraceContext<'a> {
    pub fn new(tile: &'a MapTile, contents: Contents, reject: Contents) -> Self {
        Self {
            tile,
            start: [0.0; 3],
            end: [0.0; 3],
            mins: [0.0; 3],
            maxs: [0.0; 3],
            extents: [0.0; 3],
            ispoint: true,
            contents,
            reject,
            generation: next_generation(),
            box_dists: None,
            trace: Trace {
                map_tile: tile.idx,
                ..Trace::default()
            },
        }
    }

    /// Give the box hull the bounds of the box to trace against.
    pub fn with_box(mut self, box_mins: &Vec3, box_maxs: &Vec3) -> Self {
        self.box_dists = Some(MapTile::box_plane_dists(box_mins, box_maxs));
        self
    }

    fn plane(&self, idx: usize) -> CPlane {
        let mut plane = self.tile.planes[idx];
        if self.tile.is_box_plane(idx) {
            // a box hull without bounds is a degenerate box at the origin
            plane.dist = match &self.box_dists {
                Some(dists) => dists[idx - self.tile.box_planes_start],
                None => 0.0,
            };
        }
        plane
    }

    /// Remember a brush for this query; false if it was already tested.
    fn mark_brush(&mut self, brushnum: usize) -> bool {
        let generation = self.generation;
        let numbrushes = self.tile.brushes.len();
        BRUSH_STAMPS.with(|s| {
            let mut s = s.borrow_mut();
            if s.stamps.len() <= brushnum {
                s.stamps.resize(numbrushes.max(brushnum + 1), 0);
            }
            if s.stamps[brushnum] == generation {
                return false;
            }
            s.stamps[brushnum] = generation;
            true
        })
    }

    fn clip_box_to_brush(&mut self, brush_idx: usize, leafnum: usize) {
        let tile = self.tile;
        let brush = &tile.brushes[brush_idx];
        if brush.numsides == 0 {
            return;
        }

        let mut enterfrac: f32 = -1.0;
        let mut leavefrac: f32 = 1.0;
        let mut clipplane: Option<CPlane> = None;
        let mut leadside: Option<usize> = None;

        let mut getout = false;
        let mut startout = false;

        for i in 0..brush.numsides {
            let side_idx = brush.firstbrushside + i;
            let plane = self.plane(tile.brushsides[side_idx].plane_idx);

            let dist = if !self.ispoint {
                // push the plane out appropriately for mins/maxs
                let mut ofs = [0.0f32; 3];
                for j in 0..3 {
                    ofs[j] = if plane.normal[j] < 0.0 {
                        self.maxs[j]
                    } else {
                        self.mins[j]
                    };
                }
                plane.dist - dot_product(&ofs, &plane.normal)
            } else {
                plane.dist
            };

            let d1 = dot_product(&self.start, &plane.normal) - dist;
            let d2 = dot_product(&self.end, &plane.normal) - dist;

            if d2 > 0.0 {
                getout = true; // endpoint is not in solid
            }
            if d1 > 0.0 {
                startout = true;
            }

            // completely in front of face, no intersection
            if d1 > 0.0 && d2 >= d1 {
                return;
            }
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }

            if d1 > d2 {
                let f = (d1 - DIST_EPSILON) / (d1 - d2);
                if f > enterfrac {
                    enterfrac = f;
                    clipplane = Some(plane);
                    leadside = Some(side_idx);
                }
            } else {
                let f = (d1 + DIST_EPSILON) / (d1 - d2);
                if f < leavefrac {
                    leavefrac = f;
                }
            }
        }

        if !startout {
            // original point was inside brush
            self.trace.startsolid = true;
            if !getout {
                self.trace.allsolid = true;
            }
            self.trace.leafnum = leafnum;
            return;
        }

        if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < self.trace.fraction {
            self.trace.fraction = enterfrac.max(0.0);
            if let Some(plane) = clipplane {
                self.trace.plane = plane;
            }
            if let Some(side) = leadside {
                self.trace.surface = Some(tile.side_surface(&tile.brushsides[side]));
            }
            self.trace.contents = brush.contents;
            self.trace.leafnum = leafnum;
        }
    }

    fn test_box_in_brush(&mut self, brush_idx: usize) {
        let tile = self.tile;
        let brush = &tile.brushes[brush_idx];
        if brush.numsides == 0 {
            return;
        }

        for i in 0..brush.numsides {
            let plane = self.plane(tile.brushsides[brush.firstbrushside + i].plane_idx);

            let mut ofs = [0.0f32; 3];
            for j in 0..3 {
                ofs[j] = if plane.normal[j] < 0.0 {
                    self.maxs[j]
                } else {
                    self.mins[j]
                };
            }
            let dist = plane.dist - dot_product(&ofs, &plane.normal);
            let d1 = dot_product(&self.start, &plane.normal) - dist;

            // if completely in front of face, no intersection
            if d1 > 0.0 {
                return;
            }
        }

        // inside this brush
        self.trace.startsolid = true;
        self.trace.allsolid = true;
        self.trace.fraction = 0.0;
        self.trace.contents = brush.contents;
    }

    /// Brushes of a leaf that pass the mask and have not been tested yet.
    fn leaf_brushes(&mut self, leafnum: usize) -> SmallVec<[usize; 16]> {
        let tile = self.tile;
        let leaf = &tile.leafs[leafnum];
        let mut out = SmallVec::new();
        if !leaf.contents.intersects(self.contents) {
            return out;
        }
        let first = leaf.firstleafbrush as usize;
        let count = leaf.numleafbrushes as usize;
        for &brushnum in &tile.leafbrushes[first..first + count] {
            let brushnum = brushnum as usize;
            if !self.mark_brush(brushnum) {
                continue;
            }
            let contents = tile.brushes[brushnum].contents;
            if !contents.intersects(self.contents) || contents.intersects(self.reject) {
                continue;
            }
            out.push(brushnum);
        }
        out
    }

    fn trace_to_leaf(&mut self, leafnum: usize) {
        // a zero fraction can not get any better
        for brushnum in self.leaf_brushes(leafnum) {
            self.clip_box_to_brush(brushnum, leafnum);
            if self.trace.fraction == 0.0 {
                return;
            }
        }
    }

    fn test_in_leaf(&mut self, leafnum: usize) {
        for brushnum in self.leaf_brushes(leafnum) {
            self.test_box_in_brush(brushnum);
            if self.trace.fraction == 0.0 {
                return;
            }
        }
    }

    fn recursive_hull_check(&mut self, num: i32, p1f: f32, p2f: f32, p1: &Vec3, p2: &Vec3) {
        if self.trace.fraction <= p1f {
            return; // already hit something nearer
        }

        // if < 0, we are in a leaf node
        if num < 0 {
            self.trace_to_leaf((-1 - num) as usize);
            return;
        }

        let node = &self.tile.nodes[num as usize];
        let children = node.children;
        let plane = match node.plane_idx {
            Some(idx) => self.plane(idx),
            None => {
                // level grouping node: both halves may hold brushes on the path
                self.recursive_hull_check(children[0], p1f, p2f, p1, p2);
                self.recursive_hull_check(children[1], p1f, p2f, p1, p2);
                return;
            }
        };

        // find the point distances to the separating plane
        // and the offset for the size of the box
        let (t1, t2, offset);
        if plane.plane_type < 3 {
            let pt = plane.plane_type as usize;
            t1 = p1[pt] - plane.dist;
            t2 = p2[pt] - plane.dist;
            offset = self.extents[pt];
        } else {
            t1 = dot_product(&plane.normal, p1) - plane.dist;
            t2 = dot_product(&plane.normal, p2) - plane.dist;
            offset = if self.ispoint {
                0.0
            } else {
                (self.extents[0] * plane.normal[0]).abs()
                    + (self.extents[1] * plane.normal[1]).abs()
                    + (self.extents[2] * plane.normal[2]).abs()
            };
        }

        // see which sides we need to consider
        if t1 >= offset && t2 >= offset {
            self.recursive_hull_check(children[0], p1f, p2f, p1, p2);
            return;
        }
        if t1 < -offset && t2 < -offset {
            self.recursive_hull_check(children[1], p1f, p2f, p1, p2);
            return;
        }

        // put the crosspoint DIST_EPSILON pixels on the near side
        let (side, frac, frac2);
        if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            side = 1usize;
            frac2 = ((t1 + offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
            frac = ((t1 - offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            side = 0usize;
            frac2 = ((t1 - offset - DIST_EPSILON) * idist).clamp(0.0, 1.0);
            frac = ((t1 + offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
        } else {
            side = 0;
            frac = 1.0;
            frac2 = 0.0;
        }

        // move up to the node
        let midf = p1f + (p2f - p1f) * frac;
        let mid = vector_lerp(p1, p2, frac);
        self.recursive_hull_check(children[side], p1f, midf, p1, &mid);

        // go past the node
        let midf2 = p1f + (p2f - p1f) * frac2;
        let mid2 = vector_lerp(p1, p2, frac2);
        self.recursive_hull_check(children[side ^ 1], midf2, p2f, &mid2, p2);
    }

    /// Run the sweep from `start` to `end` through the tree at `headnode`.
    fn run(mut self, start: &Vec3, end: &Vec3, mins: &Vec3, maxs: &Vec3, headnode: i32) -> Trace {
        let tile = self.tile;
        if !tile.valid_headnode(headnode) {
            self.trace.endpos = *end;
            return self.trace;
        }

        // recenter the box so the sweep runs with symmetric bounds
        let offset = vector_scale(&vector_add(mins, maxs), 0.5);
        let half = vector_subtract(maxs, &offset);
        let start_c = vector_add(start, &offset);
        let end_c = vector_add(end, &offset);

        self.start = start_c;
        self.end = end_c;
        self.mins = [-half[0], -half[1], -half[2]];
        self.maxs = half;

        // position test special case
        if vector_compare(start, end) {
            let c1 = vector_subtract(&vector_add(&start_c, &self.mins), &[1.0; 3]);
            let c2 = vector_add(&vector_add(&start_c, &self.maxs), &[1.0; 3]);

            let leafs = self.position_leafs(&c1, &c2, headnode);
            for leafnum in leafs {
                self.test_in_leaf(leafnum);
                if self.trace.allsolid {
                    break;
                }
            }
            self.trace.endpos = *start;
            return self.trace;
        }

        // point special case
        if !vector_not_empty(&half) {
            self.ispoint = true;
            self.extents = [0.0; 3];
        } else {
            self.ispoint = false;
            self.extents = half;
        }

        self.recursive_hull_check(headnode, 0.0, 1.0, &start_c, &end_c);

        if self.trace.fraction == 1.0 {
            self.trace.endpos = *end;
        } else {
            self.trace.endpos = vector_lerp(start, end, self.trace.fraction);
        }
        self.trace
    }

    fn position_leafs(&self, c1: &Vec3, c2: &Vec3, headnode: i32) -> Vec<usize> {
        if headnode as usize == self.tile.box_headnode && self.box_dists.is_some() {
            // the box hull leafs are fixed; only the box leaf can hold a brush
            return vec![self.tile.box_leaf];
        }
        self.tile
            .box_leafnums_headnode(c1, c2, MAX_BOX_LEAFS, headnode)
            .0
    }
}

// ============================================================
// Public trace entry points
// ============================================================

/// Sweep an axis aligned box through one tile tree.
#[allow(clippy::too_many_arguments)]
pub fn box_trace(
    tile: &MapTile,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    headnode: i32,
    brushmask: Contents,
    brushreject: Contents,
) -> Trace {
    TraceContext::new(tile, brushmask, brushreject).run(start, end, mins, maxs, headnode)
}

/// Sweep a box against a temporary box brush (the tile's box hull).
#[allow(clippy::too_many_arguments)]
pub fn box_trace_against_box(
    tile: &MapTile,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    box_mins: &Vec3,
    box_maxs: &Vec3,
    brushmask: Contents,
) -> Trace {
    TraceContext::new(tile, brushmask, Contents::empty())
        .with_box(box_mins, box_maxs)
        .run(start, end, mins, maxs, tile.box_headnode as i32)
}

/// Trace against a tree that was moved to `origin` and rotated by `angles`.
#[allow(clippy::too_many_arguments)]
pub fn transformed_box_trace(
    tile: &MapTile,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    headnode: i32,
    brushmask: Contents,
    brushreject: Contents,
    origin: &Vec3,
    angles: &Vec3,
) -> Trace {
    if !tile.valid_headnode(headnode) {
        warn!("transformed_box_trace: invalid headnode {} in tile {}", headnode, tile.idx);
        return Trace {
            endpos: *end,
            map_tile: tile.idx,
            ..Trace::default()
        };
    }

    // subtract origin offset
    let mut start_l = vector_subtract(start, origin);
    let mut end_l = vector_subtract(end, origin);

    // rotate start and end into the model's frame of reference
    let rotated = headnode as usize != tile.box_headnode && vector_not_empty(angles);
    if rotated {
        let (forward, right, up) = angle_vectors(angles);

        let temp = start_l;
        start_l[0] = dot_product(&temp, &forward);
        start_l[1] = -dot_product(&temp, &right);
        start_l[2] = dot_product(&temp, &up);

        let temp = end_l;
        end_l[0] = dot_product(&temp, &forward);
        end_l[1] = -dot_product(&temp, &right);
        end_l[2] = dot_product(&temp, &up);
    }

    let mut trace = box_trace(tile, &start_l, &end_l, mins, maxs, headnode, brushmask, brushreject);

    if rotated && trace.fraction != 1.0 {
        let a = [-angles[0], -angles[1], -angles[2]];
        let (forward, right, up) = angle_vectors(&a);

        let temp = trace.plane.normal;
        trace.plane.normal[0] = dot_product(&temp, &forward);
        trace.plane.normal[1] = -dot_product(&temp, &right);
        trace.plane.normal[2] = dot_product(&temp, &up);
    }

    trace.endpos = vector_lerp(start, end, trace.fraction);
    trace
}

/// Trace through every tile and every level head selected by `levels`.
#[allow(clippy::too_many_arguments)]
pub fn complete_box_trace(
    tiles: &MapTiles,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    levels: TraceLevels,
    brushmask: Contents,
    brushreject: Contents,
) -> Trace {
    let mut best = Trace {
        fraction: 2.0,
        ..Trace::default()
    };

    for tile in tiles.tiles() {
        for head in &tile.cheads {
            if !level_is_traced(head.level, levels) {
                continue;
            }
            let tr = box_trace(tile, start, end, mins, maxs, head.cnode as i32, brushmask, brushreject);
            if tr.fraction < best.fraction {
                best = tr;
                if best.fraction == 0.0 {
                    return best;
                }
            }
        }
    }

    if best.fraction > 1.0 {
        return Trace {
            endpos: *end,
            ..Trace::default()
        };
    }
    best
}

/// Does the swept box between start and end touch the given bounds?
pub fn swept_box_overlaps(
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    box_mins: &Vec3,
    box_maxs: &Vec3,
) -> bool {
    (0..3).all(|j| {
        let lo = start[j].min(end[j]) + mins[j];
        let hi = start[j].max(end[j]) + maxs[j];
        lo <= box_maxs[j] && hi >= box_mins[j]
    })
}

/// World trace plus every listed inline model whose bounds the sweep touches.
#[allow(clippy::too_many_arguments)]
pub fn ent_complete_box_trace(
    tiles: &MapTiles,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    levels: TraceLevels,
    brushmask: Contents,
    brushreject: Contents,
    inline_list: &[&str],
) -> Result<Trace, CModelError> {
    let mut best = complete_box_trace(tiles, start, end, mins, maxs, levels, brushmask, brushreject);
    if best.fraction == 0.0 {
        return Ok(best);
    }

    for name in inline_list {
        let model = tiles.inline_model(name)?;
        let (bmins, bmaxs) = inline_model_bounds(model);
        if !swept_box_overlaps(start, end, mins, maxs, &bmins, &bmaxs) {
            continue;
        }
        let Some(tile) = tiles.tile(model.tile) else {
            continue;
        };
        let tr = transformed_box_trace(
            tile,
            start,
            end,
            mins,
            maxs,
            model.headnode,
            brushmask,
            brushreject,
            &model.origin,
            &model.angles,
        );
        let startsolid = best.startsolid || tr.startsolid;
        let allsolid = best.allsolid || tr.allsolid;
        if tr.fraction < best.fraction {
            best = tr;
        }
        best.startsolid = startsolid;
        best.allsolid = allsolid;
        if best.fraction == 0.0 {
            break;
        }
    }
    Ok(best)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapbuilder::MapBuilder;
    use crate::q_shared::LEVEL_STEPON;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn load(builder: &MapBuilder) -> MapTiles {
        let data = builder.build();
        let mut tiles = MapTiles::new();
        tiles.add_tile("test", &data, [0, 0, 0]).unwrap();
        tiles
    }

    /// Floor across x/y 0..128 plus a wall at x 60..68 standing on it.
    fn wall_map() -> MapTiles {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_brush(0, [60.0, 0.0, 0.0], [68.0, 128.0, 64.0], Contents::SOLID);
        load(&b)
    }

    fn world_head(tiles: &MapTiles) -> (&MapTile, i32) {
        let tile = tiles.tile(0).unwrap();
        (tile, tile.models[0].headnode)
    }

    // ============================================================
    // box_trace
    // ============================================================

    #[test]
    fn test_box_trace_hits_wall_face() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);

        let tr = box_trace(
            tile,
            &[40.0, 48.0, 16.0],
            &[90.0, 48.0, 16.0],
            &[-4.0, -4.0, -4.0],
            &[4.0, 4.0, 4.0],
            head,
            Contents::MASK_SOLID,
            Contents::empty(),
        );
        assert!(tr.fraction < 1.0, "trace should hit the wall");
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
        assert!((tr.endpos[0] - 56.0).abs() < 0.1, "endpos {:?}", tr.endpos);
        assert_eq!(tr.contents, Contents::SOLID);
        assert!(!tr.startsolid);
    }

    #[test]
    fn test_box_trace_recenters_asymmetric_box() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);

        // box hanging 8 units in front of the origin point
        let tr = box_trace(
            tile,
            &[20.0, 48.0, 16.0],
            &[59.0, 48.0, 16.0],
            &[0.0, -2.0, -2.0],
            &[8.0, 2.0, 2.0],
            head,
            Contents::MASK_SOLID,
            Contents::empty(),
        );
        assert!(tr.fraction < 1.0);
        assert!((tr.endpos[0] - 52.0).abs() < 0.1, "endpos {:?}", tr.endpos);
    }

    #[test]
    fn test_point_trace_lands_on_floor() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);

        let tr = box_trace(
            tile,
            &[16.0, 16.0, 40.0],
            &[16.0, 16.0, -40.0],
            &[0.0; 3],
            &[0.0; 3],
            head,
            Contents::MASK_ALL,
            Contents::empty(),
        );
        assert!(tr.fraction < 1.0);
        assert_eq!(tr.plane.normal, [0.0, 0.0, 1.0]);
        assert!(tr.endpos[2].abs() < 0.1);
        assert!(tr.surface.is_some());
    }

    #[test]
    fn test_reject_mask_skips_brushes() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);
        let tr = box_trace(
            tile,
            &[40.0, 48.0, 16.0],
            &[90.0, 48.0, 16.0],
            &[0.0; 3],
            &[0.0; 3],
            head,
            Contents::MASK_SOLID,
            Contents::SOLID,
        );
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.endpos, [90.0, 48.0, 16.0]);
    }

    #[test]
    fn test_position_test_inside_and_outside() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);
        let small = [-2.0, -2.0, -2.0];
        let small_max = [2.0, 2.0, 2.0];

        let p = [64.0, 48.0, 32.0];
        let inside = box_trace(tile, &p, &p, &small, &small_max, head, Contents::MASK_ALL, Contents::empty());
        assert!(inside.startsolid && inside.allsolid);
        assert_eq!(inside.fraction, 0.0);
        assert_eq!(inside.endpos, p);

        let q = [20.0, 48.0, 32.0];
        let outside = box_trace(tile, &q, &q, &small, &small_max, head, Contents::MASK_ALL, Contents::empty());
        assert!(!outside.startsolid);
        assert_eq!(outside.fraction, 1.0);
    }

    #[test]
    fn test_invalid_headnode_gives_default_trace() {
        let tiles = wall_map();
        let tile = tiles.tile(0).unwrap();
        let end = [10.0, 0.0, 0.0];
        for head in [-1, tile.nodes.len() as i32, 1 << 20] {
            let tr = box_trace(tile, &[0.0; 3], &end, &[0.0; 3], &[0.0; 3], head, Contents::MASK_ALL, Contents::empty());
            assert_eq!(tr.fraction, 1.0, "headnode {}", head);
            assert_eq!(tr.endpos, end);
        }
    }

    #[test]
    fn test_trace_start_inside_brush_sets_startsolid() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);
        let tr = box_trace(
            tile,
            &[64.0, 48.0, 32.0],
            &[100.0, 48.0, 32.0],
            &[0.0; 3],
            &[0.0; 3],
            head,
            Contents::MASK_ALL,
            Contents::empty(),
        );
        assert!(tr.startsolid);
        assert!(!tr.allsolid);
    }

    #[test]
    fn test_brushes_tested_once_per_query() {
        let tiles = wall_map();
        let (tile, _) = world_head(&tiles);

        let mut first = TraceContext::new(tile, Contents::MASK_ALL, Contents::empty());
        assert!(first.mark_brush(1));
        assert!(!first.mark_brush(1));
        assert!(first.mark_brush(tile.box_brush));

        // a later query starts with a clean slate
        let mut second = TraceContext::new(tile, Contents::MASK_ALL, Contents::empty());
        assert!(second.generation != first.generation);
        assert!(second.mark_brush(1));
        assert!(!second.mark_brush(1));
        assert!(second.mark_brush(0));
    }

    #[test]
    fn test_box_trace_is_idempotent() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);
        let run = || {
            box_trace(
                tile,
                &[10.0, 10.0, 30.0],
                &[120.0, 90.0, -5.0],
                &[-3.0, -3.0, -3.0],
                &[3.0, 3.0, 3.0],
                head,
                Contents::MASK_ALL,
                Contents::empty(),
            )
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_random_traces_keep_fraction_bounds() {
        let tiles = wall_map();
        let (tile, head) = world_head(&tiles);
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..500 {
            let mut start = [0.0f32; 3];
            let mut end = [0.0f32; 3];
            for j in 0..3 {
                start[j] = rng.gen_range(-40.0..170.0);
                end[j] = rng.gen_range(-40.0..170.0);
            }
            let ext: f32 = rng.gen_range(0.0..6.0);
            let tr = box_trace(
                tile,
                &start,
                &end,
                &[-ext; 3],
                &[ext; 3],
                head,
                Contents::MASK_ALL,
                Contents::empty(),
            );
            assert!(
                (0.0..=1.0).contains(&tr.fraction),
                "fraction {} out of range for {:?} -> {:?}",
                tr.fraction, start, end
            );
            if tr.fraction == 1.0 {
                assert_eq!(tr.endpos, end);
            }
        }
    }

    // ============================================================
    // box hull / transformed / complete
    // ============================================================

    #[test]
    fn test_trace_against_box_hull() {
        let tiles = wall_map();
        let tile = tiles.tile(0).unwrap();

        let tr = box_trace_against_box(
            tile,
            &[-100.0, 8.0, 8.0],
            &[100.0, 8.0, 8.0],
            &[0.0; 3],
            &[0.0; 3],
            &[0.0, 0.0, 0.0],
            &[16.0, 16.0, 16.0],
            Contents::MASK_ALL,
        );
        assert!((tr.fraction - 0.5).abs() < 0.01, "fraction {}", tr.fraction);
        assert_eq!(tr.plane.normal, [-1.0, 0.0, 0.0]);
        assert_eq!(tr.contents, Contents::WEAPONCLIP);

        // the hull keeps no state between queries
        let miss = box_trace_against_box(
            tile,
            &[-100.0, 40.0, 8.0],
            &[100.0, 40.0, 8.0],
            &[0.0; 3],
            &[0.0; 3],
            &[0.0, 0.0, 0.0],
            &[16.0, 16.0, 16.0],
            Contents::MASK_ALL,
        );
        assert_eq!(miss.fraction, 1.0);

        let p = [8.0, 8.0, 8.0];
        let inside = box_trace_against_box(tile, &p, &p, &[0.0; 3], &[0.0; 3], &[0.0; 3], &[16.0; 3], Contents::MASK_ALL);
        assert!(inside.startsolid);
    }

    #[test]
    fn test_transformed_trace_follows_origin() {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_inline_model("func_door", &[([0.0, 0.0, 0.0], [8.0, 32.0, 64.0])]);
        let mut tiles = load(&b);

        let model = *tiles.inline_model("*1").unwrap();
        let tile = tiles.tile(0).unwrap();
        let start = [-20.0, 16.0, 32.0];
        let end = [60.0, 16.0, 32.0];

        let tr = transformed_box_trace(tile, &start, &end, &[0.0; 3], &[0.0; 3], model.headnode,
            Contents::MASK_ALL, Contents::empty(), &model.origin, &model.angles);
        assert!((tr.endpos[0] - 0.0).abs() < 0.1, "endpos {:?}", tr.endpos);

        tiles.set_inline_model_orientation("*1", &[40.0, 0.0, 0.0], &[0.0, 0.0, 0.0]).unwrap();
        let model = *tiles.inline_model("*1").unwrap();
        let tile = tiles.tile(0).unwrap();
        let tr = transformed_box_trace(tile, &start, &end, &[0.0; 3], &[0.0; 3], model.headnode,
            Contents::MASK_ALL, Contents::empty(), &model.origin, &model.angles);
        assert!((tr.endpos[0] - 40.0).abs() < 0.1, "endpos {:?}", tr.endpos);
    }

    #[test]
    fn test_transformed_trace_rotates_normal_back() {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_inline_model("func_rotating", &[([-4.0, -16.0, 0.0], [4.0, 16.0, 64.0])]);
        let mut tiles = load(&b);
        tiles.set_inline_model_orientation("*1", &[64.0, 64.0, 0.0], &[0.0, 90.0, 0.0]).unwrap();

        let model = *tiles.inline_model("*1").unwrap();
        let tile = tiles.tile(0).unwrap();
        // rotated by 90 degrees the slab runs along x, so a trace along +y hits it
        let tr = transformed_box_trace(tile, &[64.0, 0.0, 32.0], &[64.0, 128.0, 32.0], &[0.0; 3], &[0.0; 3],
            model.headnode, Contents::MASK_ALL, Contents::empty(), &model.origin, &model.angles);
        assert!(tr.fraction < 1.0);
        assert!((tr.endpos[1] - 60.0).abs() < 0.2, "endpos {:?}", tr.endpos);
        assert!((tr.plane.normal[1] + 1.0).abs() < 1e-4, "normal {:?}", tr.plane.normal);
    }

    #[test]
    fn test_complete_trace_filters_levels() {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_brush(LEVEL_STEPON, [32.0, 32.0, 0.0], [64.0, 64.0, 8.0], Contents::STEPON);
        let tiles = load(&b);

        let start = [48.0, 48.0, 60.0];
        let end = [48.0, 48.0, -8.0];
        let world = complete_box_trace(&tiles, &start, &end, &[0.0; 3], &[0.0; 3],
            TraceLevels::walking(), Contents::MASK_ALL, Contents::empty());
        assert!(world.endpos[2].abs() < 0.1, "walking trace should reach the floor: {:?}", world.endpos);

        let step = complete_box_trace(&tiles, &start, &end, &[0.0; 3], &[0.0; 3],
            TraceLevels::STEPON, Contents::STEPON, Contents::empty());
        assert!(step.fraction < 1.0);
        assert!((step.endpos[2] - 8.0).abs() < 0.1);
        assert_eq!(step.contents, Contents::STEPON);
        assert_eq!(step.map_tile, 0);
    }

    #[test]
    fn test_complete_trace_without_tiles() {
        let tiles = MapTiles::new();
        let end = [1.0, 2.0, 3.0];
        let tr = complete_box_trace(&tiles, &[0.0; 3], &end, &[0.0; 3], &[0.0; 3],
            TraceLevels::empty(), Contents::MASK_ALL, Contents::empty());
        assert_eq!(tr.fraction, 1.0);
        assert_eq!(tr.endpos, end);
    }

    #[test]
    fn test_ent_trace_includes_listed_models() {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_inline_model("func_door", &[([64.0, 0.0, 0.0], [72.0, 128.0, 64.0])]);
        let tiles = load(&b);

        let start = [16.0, 48.0, 32.0];
        let end = [120.0, 48.0, 32.0];
        let open = ent_complete_box_trace(&tiles, &start, &end, &[0.0; 3], &[0.0; 3],
            TraceLevels::walking(), Contents::MASK_ALL, Contents::empty(), &[]).unwrap();
        assert_eq!(open.fraction, 1.0);

        let closed = ent_complete_box_trace(&tiles, &start, &end, &[0.0; 3], &[0.0; 3],
            TraceLevels::walking(), Contents::MASK_ALL, Contents::empty(), &["*1"]).unwrap();
        assert!((closed.endpos[0] - 64.0).abs() < 0.1, "endpos {:?}", closed.endpos);

        let bad = ent_complete_box_trace(&tiles, &start, &end, &[0.0; 3], &[0.0; 3],
            TraceLevels::walking(), Contents::MASK_ALL, Contents::empty(), &["*7"]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_swept_box_overlap() {
        assert!(swept_box_overlaps(&[0.0; 3], &[10.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], &[5.0, -1.0, -1.0], &[6.0, 1.0, 1.0]));
        assert!(!swept_box_overlaps(&[0.0; 3], &[10.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], &[5.0, 2.0, -1.0], &[6.0, 3.0, 1.0]));
        assert!(swept_box_overlaps(&[0.0; 3], &[10.0, 0.0, 0.0], &[-2.0; 3], &[2.0; 3], &[5.0, 2.0, -1.0], &[6.0, 3.0, 1.0]));
    }
}
