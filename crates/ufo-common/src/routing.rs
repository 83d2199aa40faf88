// routing.rs — routing grid: per-cell floor heights and walk connections
//
// The grid covers 256x256 columns of 8 bands. Each cell byte holds the floor
// height in QUANT units (low nibble) and one connection bit per cardinal
// direction (high nibble). Fall and step flags are kept per column, one bit
// per band.

use crate::cmodel::{inline_model_bounds, CModelError, MapTiles};
use crate::crc::crc_blocks;
use crate::cvar::{CvarContext, CvarFlags};
use crate::q_shared::{
    pos_to_vec, vec_to_pos, CModel, Contents, Pos3, TraceLevels, Vec3, CORE_DIRECTIONS, DVECS,
    PATHFINDING_HEIGHT, PATHFINDING_WIDTH, QUANT, UNIT_HEIGHT, UNIT_SIZE,
};
use crate::tnodes::{ent_test_line, ent_test_line_dm};
use crate::tracing::{complete_box_trace, DIST_EPSILON};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::time::Instant;

/// Columns per band.
pub const ROUTING_BLOCK: usize = PATHFINDING_WIDTH * PATHFINDING_WIDTH;
pub const ROUTE_SIZE: usize = PATHFINDING_HEIGHT * ROUTING_BLOCK;
/// Decoded size of a routing lump: route, fall and step.
pub const ROUTING_TOTAL: usize = ROUTE_SIZE + 2 * ROUTING_BLOCK;

// ============================================================
// Cells
// ============================================================

/// Cardinal move directions, in DVECS order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    East = 0,
    West = 1,
    North = 2,
    South = 3,
}

impl Direction {
    pub const ALL: [Direction; CORE_DIRECTIONS] =
        [Direction::East, Direction::West, Direction::North, Direction::South];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn dvec(self) -> [i32; 2] {
        DVECS[self as usize]
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::North => Direction::South,
            Direction::South => Direction::North,
        }
    }

    /// Connection bit of this direction in a cell byte.
    pub fn bit(self) -> u8 {
        0x10 << (self as u8)
    }
}

/// One routing cell byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RoutingCell(pub u8);

impl RoutingCell {
    /// No floor an actor can stand on.
    pub const FILLED: RoutingCell = RoutingCell(0x0F);

    pub fn with_height(height: u8) -> Self {
        RoutingCell(height & 0x0F)
    }

    pub fn with_connection(self, dir: Direction, open: bool) -> Self {
        if open {
            RoutingCell(self.0 | dir.bit())
        } else {
            RoutingCell(self.0 & !dir.bit())
        }
    }

    /// Floor height in QUANT units above the band base.
    pub fn height(self) -> u8 {
        self.0 & 0x0F
    }

    pub fn height_units(self) -> i32 {
        self.height() as i32 * QUANT
    }

    pub fn connects(self, dir: Direction) -> bool {
        self.0 & dir.bit() != 0
    }

    pub fn is_filled(self) -> bool {
        self == RoutingCell::FILLED
    }
}

fn neighbour(x: usize, y: usize, dv: [i32; 2]) -> Option<(usize, usize)> {
    let nx = x as i32 + dv[0];
    let ny = y as i32 + dv[1];
    let range = 0..PATHFINDING_WIDTH as i32;
    if range.contains(&nx) && range.contains(&ny) {
        Some((nx as usize, ny as usize))
    } else {
        None
    }
}

// ============================================================
// Routing lump
// ============================================================

/// Decoded routing data of one tile, in tile-local cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingLump {
    pub sh_low: u8,
    pub sh_big: u8,
    pub route: Vec<u8>,
    pub fall: Vec<u8>,
    pub step: Vec<u8>,
}

fn decompress_block(
    src: &[u8],
    pos: &mut usize,
    expected: usize,
    decoded: &mut usize,
) -> Result<Vec<u8>, CModelError> {
    let mut out = Vec::with_capacity(expected);
    loop {
        let Some(&b) = src.get(*pos) else {
            return Err(CModelError::BadRouting { decoded: *decoded });
        };
        *pos += 1;
        if b == 0 {
            break;
        }

        if b & 0x80 != 0 {
            // repetitions
            let Some(&value) = src.get(*pos) else {
                return Err(CModelError::BadRouting { decoded: *decoded });
            };
            *pos += 1;
            let count = (b & 0x7F) as usize + 1;
            out.resize(out.len() + count, value);
            *decoded += count;
        } else {
            // identities
            let count = b as usize;
            let Some(run) = src.get(*pos..*pos + count) else {
                return Err(CModelError::BadRouting { decoded: *decoded });
            };
            out.extend_from_slice(run);
            *pos += count;
            *decoded += count;
        }

        if out.len() > expected {
            return Err(CModelError::BadRouting { decoded: *decoded });
        }
    }

    if out.len() != expected {
        return Err(CModelError::BadRouting { decoded: *decoded });
    }
    Ok(out)
}

/// Decode a routing lump: two step heights, then RLE route, fall and step blocks.
pub fn decompress_routing(src: &[u8]) -> Result<RoutingLump, CModelError> {
    if src.len() < 2 {
        return Err(CModelError::BadRouting { decoded: 0 });
    }
    let mut pos = 2;
    let mut decoded = 0;
    let route = decompress_block(src, &mut pos, ROUTE_SIZE, &mut decoded)?;
    let fall = decompress_block(src, &mut pos, ROUTING_BLOCK, &mut decoded)?;
    let step = decompress_block(src, &mut pos, ROUTING_BLOCK, &mut decoded)?;
    debug_assert_eq!(decoded, ROUTING_TOTAL);

    Ok(RoutingLump {
        sh_low: src[0],
        sh_big: src[1],
        route,
        fall,
        step,
    })
}

fn compress_block(src: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < src.len() {
        let value = src[i];
        let mut run = 1;
        while i + run < src.len() && src[i + run] == value && run < 0x80 {
            run += 1;
        }
        if run >= 3 {
            out.push(0x80 | (run - 1) as u8);
            out.push(value);
            i += run;
            continue;
        }

        let start = i;
        while i < src.len() && i - start < 0x7F {
            if i + 2 < src.len() && src[i] == src[i + 1] && src[i] == src[i + 2] {
                break;
            }
            i += 1;
        }
        out.push((i - start) as u8);
        out.extend_from_slice(&src[start..i]);
    }
    out.push(0);
}

/// Encode a routing lump in the format `decompress_routing` reads.
pub fn compress_routing(lump: &RoutingLump) -> Vec<u8> {
    let mut out = vec![lump.sh_low, lump.sh_big];
    compress_block(&lump.route, &mut out);
    compress_block(&lump.fall, &mut out);
    compress_block(&lump.step, &mut out);
    out
}

// ============================================================
// Configuration
// ============================================================

pub const CVAR_STEP_LOW: &str = "rt_step_low";
pub const CVAR_STEP_BIG: &str = "rt_step_big";
pub const CVAR_ACTOR_HEIGHT: &str = "rt_actor_height";
pub const CVAR_CROUCH_HEIGHT: &str = "rt_crouch_height";
pub const CVAR_SAMPLE_INSET: &str = "rt_sample_inset";

/// Tunables of the routing builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingConfig {
    /// Climbable height in QUANT units.
    pub step_low: u8,
    /// Climbable height from a cell over a stepon brush.
    pub step_big: u8,
    pub actor_height: f32,
    pub crouch_height: f32,
    pub sample_inset: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            step_low: 4,
            step_big: 8,
            actor_height: 48.0,
            crouch_height: 32.0,
            sample_inset: 8.0,
        }
    }
}

impl RoutingConfig {
    /// Create the routing cvars with their defaults. They are latched: a
    /// change only reaches the grid when the next map is routed.
    pub fn register(cvars: &mut CvarContext) {
        let d = RoutingConfig::default();
        let flags = CvarFlags::ARCHIVE | CvarFlags::LATCH;
        cvars.register(CVAR_STEP_LOW, &d.step_low.to_string(), flags);
        cvars.register(CVAR_STEP_BIG, &d.step_big.to_string(), flags);
        cvars.register(CVAR_ACTOR_HEIGHT, &d.actor_height.to_string(), flags);
        cvars.register(CVAR_CROUCH_HEIGHT, &d.crouch_height.to_string(), flags);
        cvars.register(CVAR_SAMPLE_INSET, &d.sample_inset.to_string(), flags);
    }

    /// Read the routing cvars; unset variables keep their defaults.
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let d = RoutingConfig::default();
        let value = |name: &str, default: f32| cvars.value(name).unwrap_or(default);
        let max_step = 0x0F as f32;
        Self {
            step_low: value(CVAR_STEP_LOW, d.step_low as f32).clamp(0.0, max_step) as u8,
            step_big: value(CVAR_STEP_BIG, d.step_big as f32).clamp(0.0, max_step) as u8,
            actor_height: value(CVAR_ACTOR_HEIGHT, d.actor_height).max(QUANT as f32),
            crouch_height: value(CVAR_CROUCH_HEIGHT, d.crouch_height).max(QUANT as f32),
            sample_inset: value(CVAR_SAMPLE_INSET, d.sample_inset)
                .clamp(0.0, (UNIT_SIZE / 2) as f32),
        }
    }
}

// ============================================================
// Grid
// ============================================================

/// The routing grid of the whole map.
#[derive(Clone)]
pub struct RoutingGrid {
    /// Cell bytes indexed `(z, y, x)`.
    pub route: Vec<u8>,
    /// Per column, bit z set when band z has no floor.
    pub fall: Vec<u8>,
    /// Per column, bit z set when band z stands on a stepon brush.
    pub step: Vec<u8>,
    pub sh_low: u8,
    pub sh_big: u8,
    pub map_min: Vec3,
    pub map_max: Vec3,
}

impl std::fmt::Debug for RoutingGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingGrid")
            .field("sh_low", &self.sh_low)
            .field("sh_big", &self.sh_big)
            .field("map_min", &self.map_min)
            .field("map_max", &self.map_max)
            .field("checksum", &self.checksum())
            .finish()
    }
}

#[inline]
fn route_index(x: usize, y: usize, z: usize) -> usize {
    z * ROUTING_BLOCK + y * PATHFINDING_WIDTH + x
}

#[inline]
fn column_index(x: usize, y: usize) -> usize {
    y * PATHFINDING_WIDTH + x
}

impl RoutingGrid {
    pub fn new(sh_low: u8, sh_big: u8) -> Self {
        Self {
            route: vec![0; ROUTE_SIZE],
            fall: vec![0; ROUTING_BLOCK],
            step: vec![0; ROUTING_BLOCK],
            sh_low,
            sh_big,
            map_min: [0.0; 3],
            map_max: [0.0; 3],
        }
    }

    pub fn with_config(cfg: &RoutingConfig) -> Self {
        Self::new(cfg.step_low, cfg.step_big)
    }

    pub fn cell(&self, x: usize, y: usize, z: usize) -> RoutingCell {
        RoutingCell(self.route[route_index(x, y, z)])
    }

    pub fn set_cell(&mut self, x: usize, y: usize, z: usize, cell: RoutingCell) {
        self.route[route_index(x, y, z)] = cell.0;
    }

    pub fn falls(&self, x: usize, y: usize, z: usize) -> bool {
        self.fall[column_index(x, y)] & (1 << z) != 0
    }

    pub fn big_step(&self, x: usize, y: usize, z: usize) -> bool {
        self.step[column_index(x, y)] & (1 << z) != 0
    }

    fn set_column_bit(bits: &mut [u8], x: usize, y: usize, z: usize, on: bool) {
        let idx = column_index(x, y);
        if on {
            bits[idx] |= 1 << z;
        } else {
            bits[idx] &= !(1 << z);
        }
    }

    /// Climbable height out of a cell, in QUANT units.
    pub fn step_height(&self, x: usize, y: usize, z: usize) -> u8 {
        if self.big_step(x, y, z) {
            self.sh_big
        } else {
            self.sh_low
        }
    }

    /// Floor height of a cell in world units above its band base.
    pub fn height(&self, pos: &Pos3) -> i32 {
        self.cell(pos[0] as usize, pos[1] as usize, pos[2] as usize)
            .height_units()
    }

    /// Cell center lifted by the floor height.
    pub fn pos_to_vec_on_floor(&self, pos: &Pos3) -> Vec3 {
        let mut v = pos_to_vec(pos);
        v[2] += self.height(pos) as f32;
        v
    }

    /// Band reached when stepping into column (nx, ny) from band z with
    /// floor height `h` and climb `sh`.
    fn settle(&self, nx: usize, ny: usize, z: usize, h: u8, sh: u8) -> usize {
        let mut nz = (z + (h as usize + sh as usize) / 0x10).min(PATHFINDING_HEIGHT - 1);
        while nz > 0 && self.falls(nx, ny, nz) {
            nz -= 1;
        }
        nz
    }

    fn step_cardinal(&self, pos: Pos3, dir: Direction) -> Option<Pos3> {
        let [x, y, z] = [pos[0] as usize, pos[1] as usize, pos[2] as usize];
        let cell = self.cell(x, y, z);
        if !cell.connects(dir) {
            return None;
        }
        let (nx, ny) = neighbour(x, y, dir.dvec())?;
        let nz = self.settle(nx, ny, z, cell.height(), self.step_height(x, y, z));
        Some([nx as u8, ny as u8, nz as u8])
    }

    /// Cell reached by a single move from `pos` in direction `dir` (0..8).
    /// Diagonals need both cardinal paths around the corner.
    pub fn step_target(&self, pos: Pos3, dir: usize) -> Option<Pos3> {
        if pos[2] as usize >= PATHFINDING_HEIGHT {
            return None;
        }
        if dir < CORE_DIRECTIONS {
            return self.step_cardinal(pos, Direction::ALL[dir]);
        }

        let [dx, dy] = *DVECS.get(dir)?;
        let xdir = if dx > 0 { Direction::East } else { Direction::West };
        let ydir = if dy > 0 { Direction::North } else { Direction::South };
        let target = self
            .step_cardinal(pos, xdir)
            .and_then(|p| self.step_cardinal(p, ydir))?;
        self.step_cardinal(pos, ydir)
            .and_then(|p| self.step_cardinal(p, xdir))?;
        Some(target)
    }

    /// CRC over route, fall and step; server and client compare grids with it.
    pub fn checksum(&self) -> u16 {
        crc_blocks(&[&self.route, &self.fall, &self.step])
    }

    /// Copy a baked lump into the grid at a tile's cell shift.
    pub fn merge_lump(&mut self, lump: &RoutingLump, shift: [i32; 3]) {
        self.sh_low = lump.sh_low;
        self.sh_big = lump.sh_big;

        for y in 0..PATHFINDING_WIDTH {
            for x in 0..PATHFINDING_WIDTH {
                let src = column_index(x, y);
                let covered = lump.fall[src] != 0
                    || (0..PATHFINDING_HEIGHT).any(|z| lump.route[route_index(x, y, z)] != 0);
                if !covered {
                    continue;
                }
                let Some((dx, dy)) = neighbour(x, y, [shift[0], shift[1]]) else {
                    continue;
                };

                let sz = shift[2].clamp(0, PATHFINDING_HEIGHT as i32) as usize;
                for z in 0..PATHFINDING_HEIGHT - sz {
                    self.route[route_index(dx, dy, z + sz)] = lump.route[route_index(x, y, z)];
                }
                let dst = column_index(dx, dy);
                self.fall[dst] = ((lump.fall[src] as u16) << sz) as u8;
                self.step[dst] = ((lump.step[src] as u16) << sz) as u8;
            }
        }
    }

    /// Snapshot the grid as a lump, for embedding into a tile.
    pub fn to_lump(&self) -> RoutingLump {
        RoutingLump {
            sh_low: self.sh_low,
            sh_big: self.sh_big,
            route: self.route.clone(),
            fall: self.fall.clone(),
            step: self.step.clone(),
        }
    }

    /// Recompute map_min/map_max from the border of routed columns, pulled
    /// in by 100 units. An axis narrower than that collapses to its middle;
    /// a grid without routed columns gets empty bounds at the origin.
    pub fn update_map_size(&mut self) {
        let top = (PATHFINDING_WIDTH - 1) as u8;
        let mut min: Pos3 = [top, top, 0];
        let mut max: Pos3 = [0, 0, 0];
        let mut found = false;
        for y in 0..PATHFINDING_WIDTH {
            for x in 0..PATHFINDING_WIDTH {
                if self.fall[column_index(x, y)] != 0 {
                    found = true;
                    min[0] = min[0].min(x as u8);
                    min[1] = min[1].min(y as u8);
                    max[0] = max[0].max(x as u8);
                    max[1] = max[1].max(y as u8);
                }
            }
        }
        if !found {
            self.map_min = [0.0; 3];
            self.map_max = [0.0; 3];
            return;
        }

        let offset = 100.0;
        self.map_min = pos_to_vec(&min).map(|v| v + offset);
        self.map_max = pos_to_vec(&max).map(|v| v - offset);
        for i in 0..3 {
            if self.map_min[i] > self.map_max[i] {
                let mid = (self.map_min[i] + self.map_max[i]) / 2.0;
                self.map_min[i] = mid;
                self.map_max[i] = mid;
            }
        }
    }

    /// Build the grid for a loaded map. Tiles with a baked lump are merged;
    /// if any tile has none, the whole map is rerouted.
    pub fn from_tiles(
        tiles: &MapTiles,
        cfg: &RoutingConfig,
        inline_list: &[&str],
    ) -> Result<Self, CModelError> {
        let mut grid = RoutingGrid::with_config(cfg);
        let mut unbaked = false;
        for tile in tiles.tiles() {
            match &tile.routing {
                Some(lump) => grid.merge_lump(lump, tile.shift),
                None => unbaked = true,
            }
        }

        if unbaked {
            grid.sh_low = cfg.step_low;
            grid.sh_big = cfg.step_big;
            reroute_map(tiles, &mut grid, cfg, inline_list)?;
        } else {
            grid.update_map_size();
        }
        Ok(grid)
    }
}

// ============================================================
// Builder
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct UnitSample {
    cell: RoutingCell,
    falls: bool,
    step: bool,
}

impl UnitSample {
    const FALL: UnitSample = UnitSample {
        cell: RoutingCell(0),
        falls: true,
        step: false,
    };
    const FILLED: UnitSample = UnitSample {
        cell: RoutingCell::FILLED,
        falls: false,
        step: false,
    };
}

fn sample_unit(
    tiles: &MapTiles,
    cfg: &RoutingConfig,
    x: usize,
    y: usize,
    z: usize,
    inline_list: &[&str],
) -> Result<UnitSample, CModelError> {
    let center = pos_to_vec(&[x as u8, y as u8, z as u8]);
    let base = (z as i32 * UNIT_HEIGHT) as f32;
    let top = base + (UNIT_HEIGHT - QUANT) as f32;
    let bottom = base - 2.0;
    let d = (UNIT_SIZE / 2) as f32 - cfg.sample_inset;
    let samples = [[0.0, 0.0], [-d, -d], [d, -d], [-d, d], [d, d]];

    let mut floor: Option<f32> = None;
    let mut center_floor: Option<f32> = None;
    for (i, off) in samples.iter().enumerate() {
        let start = [center[0] + off[0], center[1] + off[1], top];
        let stop = [start[0], start[1], bottom];
        if let Some(hit) = ent_test_line_dm(tiles, &start, &stop, TraceLevels::walking(), inline_list)? {
            floor = Some(floor.map_or(hit[2], |f| f.min(hit[2])));
            if i == 0 {
                center_floor = Some(hit[2]);
            }
        }
    }

    let Some(floor) = floor else {
        return Ok(if z > 0 { UnitSample::FALL } else { UnitSample::FILLED });
    };
    let floor = floor.max(base);

    let height = ((floor - base - 2.0 * DIST_EPSILON) / QUANT as f32)
        .ceil()
        .clamp(0.0, 15.0) as u8;
    if height >= 0x0F {
        // the floor belongs to the band above
        return Ok(UnitSample::FILLED);
    }

    let clear_from = center_floor.map_or(floor, |c| c.max(floor)) + QUANT as f32;
    let clear_to = floor + cfg.actor_height;
    if clear_from >= clear_to {
        return Ok(UnitSample::FILLED);
    }
    let start = [center[0], center[1], clear_from];
    let stop = [center[0], center[1], clear_to];
    if ent_test_line(tiles, &start, &stop, TraceLevels::walking(), inline_list)? {
        return Ok(UnitSample::FILLED);
    }

    let tr = complete_box_trace(
        tiles,
        &[center[0], center[1], base + UNIT_HEIGHT as f32],
        &[center[0], center[1], base - QUANT as f32],
        &[0.0; 3],
        &[0.0; 3],
        TraceLevels::STEPON,
        Contents::STEPON,
        Contents::empty(),
    );

    Ok(UnitSample {
        cell: RoutingCell::with_height(height),
        falls: false,
        step: tr.fraction < 1.0,
    })
}

fn apply_sample(grid: &mut RoutingGrid, x: usize, y: usize, z: usize, sample: UnitSample) {
    grid.set_cell(x, y, z, sample.cell);
    RoutingGrid::set_column_bit(&mut grid.fall, x, y, z, sample.falls);
    RoutingGrid::set_column_bit(&mut grid.step, x, y, z, sample.step);
}

/// Sample the floor of one cell and store height, fall and step flags.
/// Connection bits are cleared; `test_connection` recomputes them.
pub fn check_unit(
    tiles: &MapTiles,
    grid: &mut RoutingGrid,
    cfg: &RoutingConfig,
    pos: Pos3,
    inline_list: &[&str],
) -> Result<(), CModelError> {
    let [x, y, z] = [pos[0] as usize, pos[1] as usize, pos[2] as usize];
    if z >= PATHFINDING_HEIGHT {
        return Ok(());
    }
    let sample = sample_unit(tiles, cfg, x, y, z, inline_list)?;
    apply_sample(grid, x, y, z, sample);
    Ok(())
}

fn connection_open(
    tiles: &MapTiles,
    grid: &RoutingGrid,
    cfg: &RoutingConfig,
    pos: Pos3,
    dir: Direction,
    inline_list: &[&str],
) -> Result<bool, CModelError> {
    let [x, y, z] = [pos[0] as usize, pos[1] as usize, pos[2] as usize];
    let src = grid.cell(x, y, z);
    if src.is_filled() || grid.falls(x, y, z) {
        return Ok(false);
    }
    let Some((nx, ny)) = neighbour(x, y, dir.dvec()) else {
        return Ok(false);
    };

    let sh = grid.step_height(x, y, z);
    let nz = grid.settle(nx, ny, z, src.height(), sh);
    let dst = grid.cell(nx, ny, nz);
    if dst.is_filled() || grid.falls(nx, ny, nz) {
        return Ok(false);
    }

    let f = z as i32 * UNIT_HEIGHT + src.height_units();
    let g = nz as i32 * UNIT_HEIGHT + dst.height_units();
    if g - f > sh as i32 * QUANT {
        return Ok(false);
    }

    let a = pos_to_vec(&pos);
    let b = pos_to_vec(&[nx as u8, ny as u8, nz as u8]);
    let floor = f.max(g) as f32;
    for lift in [QUANT as f32, cfg.crouch_height] {
        let start = [a[0], a[1], floor + lift];
        let stop = [b[0], b[1], floor + lift];
        if ent_test_line(tiles, &start, &stop, TraceLevels::walking(), inline_list)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Recompute one connection bit of a cell. Only the source cell changes.
pub fn test_connection(
    tiles: &MapTiles,
    grid: &mut RoutingGrid,
    cfg: &RoutingConfig,
    pos: Pos3,
    dir: Direction,
    inline_list: &[&str],
) -> Result<bool, CModelError> {
    if pos[2] as usize >= PATHFINDING_HEIGHT {
        return Ok(false);
    }
    let open = connection_open(tiles, grid, cfg, pos, dir, inline_list)?;
    let [x, y, z] = [pos[0] as usize, pos[1] as usize, pos[2] as usize];
    let cell = grid.cell(x, y, z).with_connection(dir, open);
    grid.set_cell(x, y, z, cell);
    Ok(open)
}

fn columns(min: Pos3, max: Pos3) -> Vec<(usize, usize)> {
    (min[1] as usize..=max[1] as usize)
        .flat_map(|y| (min[0] as usize..=max[0] as usize).map(move |x| (x, y)))
        .collect()
}

/// CheckUnit for every band of every column in the box, top band first.
fn check_columns(
    tiles: &MapTiles,
    grid: &mut RoutingGrid,
    cfg: &RoutingConfig,
    min: Pos3,
    max: Pos3,
    inline_list: &[&str],
) -> Result<(), CModelError> {
    let cols = columns(min, max);
    let samples_by_column = cols
        .par_iter()
        .map(|&(x, y)| -> Result<_, CModelError> {
            let mut column = [UnitSample::default(); PATHFINDING_HEIGHT];
            for z in (0..PATHFINDING_HEIGHT).rev() {
                column[z] = sample_unit(tiles, cfg, x, y, z, inline_list)?;
            }
            Ok(column)
        })
        .collect::<Result<Vec<_>, CModelError>>()?;

    for (&(x, y), column) in cols.iter().zip(&samples_by_column) {
        for (z, sample) in column.iter().enumerate().rev() {
            apply_sample(grid, x, y, z, *sample);
        }
    }
    Ok(())
}

/// TestConnection for every cell and direction in the box.
fn connect_columns(
    tiles: &MapTiles,
    grid: &mut RoutingGrid,
    cfg: &RoutingConfig,
    min: Pos3,
    max: Pos3,
    inline_list: &[&str],
) -> Result<(), CModelError> {
    let cols = columns(min, max);
    let shared: &RoutingGrid = grid;
    let masks = cols
        .par_iter()
        .map(|&(x, y)| -> Result<_, CModelError> {
            let mut column = [0u8; PATHFINDING_HEIGHT];
            for (z, mask) in column.iter_mut().enumerate().rev() {
                for dir in Direction::ALL {
                    let pos = [x as u8, y as u8, z as u8];
                    if connection_open(tiles, shared, cfg, pos, dir, inline_list)? {
                        *mask |= dir.bit();
                    }
                }
            }
            Ok(column)
        })
        .collect::<Result<Vec<_>, CModelError>>()?;

    for (&(x, y), column) in cols.iter().zip(&masks) {
        for (z, mask) in column.iter().enumerate() {
            let height = grid.cell(x, y, z).0 & 0x0F;
            grid.set_cell(x, y, z, RoutingCell(height | mask));
        }
    }
    Ok(())
}

fn pad(pos: Pos3, by: i32) -> Pos3 {
    let max = PATHFINDING_WIDTH as i32 - 1;
    [
        (pos[0] as i32 + by).clamp(0, max) as u8,
        (pos[1] as i32 + by).clamp(0, max) as u8,
        pos[2],
    ]
}

/// Reroute the columns between min and max, then refresh connections one
/// cell further out so walls facing into the box are updated.
pub fn recalc_box_routing(
    tiles: &MapTiles,
    grid: &mut RoutingGrid,
    cfg: &RoutingConfig,
    min: Pos3,
    max: Pos3,
    inline_list: &[&str],
) -> Result<(), CModelError> {
    debug!("recalc routing box {:?} - {:?}", min, max);
    check_columns(tiles, grid, cfg, min, max, inline_list)?;
    connect_columns(tiles, grid, cfg, pad(min, -1), pad(max, 1), inline_list)
}

/// Reroute the area around an inline model after it moved, opened or broke.
pub fn recalc_routing(
    tiles: &MapTiles,
    grid: &mut RoutingGrid,
    cfg: &RoutingConfig,
    name: &str,
    inline_list: &[&str],
) -> Result<(), CModelError> {
    if !name.starts_with('*') {
        warn!("recalc_routing: {} is not an inline model", name);
        return Err(CModelError::BadInlineName(name.to_string()));
    }
    let (min, max) = model_routing_box(tiles.inline_model(name)?);
    recalc_box_routing(tiles, grid, cfg, min, max, inline_list)
}

/// Columns an inline model can influence at its current placement.
pub fn model_routing_box(model: &CModel) -> (Pos3, Pos3) {
    let (mins, maxs) = inline_model_bounds(model);
    (pad(vec_to_pos(&mins), -1), pad(vec_to_pos(&maxs), 1))
}

/// Route the whole map from scratch.
pub fn reroute_map(
    tiles: &MapTiles,
    grid: &mut RoutingGrid,
    cfg: &RoutingConfig,
    inline_list: &[&str],
) -> Result<(), CModelError> {
    let Some((mins, maxs)) = tiles.map_bounds() else {
        return Ok(());
    };
    let start = Instant::now();
    let min = vec_to_pos(&mins);
    let max = vec_to_pos(&maxs);

    check_columns(tiles, grid, cfg, pad(min, -1), pad(max, 1), inline_list)?;
    connect_columns(tiles, grid, cfg, min, max, inline_list)?;
    grid.update_map_size();

    info!(
        "rerouted {}x{} columns in {:.1} ms",
        max[0] as usize - min[0] as usize + 3,
        max[1] as usize - min[1] as usize + 3,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapbuilder::MapBuilder;
    use crate::q_shared::LEVEL_STEPON;

    const ROW: usize = 129;

    fn floor(b: &mut MapBuilder) {
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
    }

    fn load(b: &MapBuilder) -> MapTiles {
        let mut tiles = MapTiles::new();
        tiles.add_tile("t", &b.build(), [0, 0, 0]).unwrap();
        tiles
    }

    fn routed(tiles: &MapTiles, inline_list: &[&str]) -> RoutingGrid {
        RoutingGrid::from_tiles(tiles, &RoutingConfig::default(), inline_list).unwrap()
    }

    /// Corridor along x in row 129 with a door filling cell 130.
    fn corridor() -> MapTiles {
        let mut b = MapBuilder::new();
        floor(&mut b);
        b.add_brush(0, [0.0, 24.0, 0.0], [128.0, 32.0, 64.0], Contents::SOLID);
        b.add_brush(0, [0.0, 64.0, 0.0], [128.0, 72.0, 64.0], Contents::SOLID);
        let door = b.add_inline_model("func_door", &[([64.0, 32.0, 0.0], [96.0, 64.0, 64.0])]);
        assert_eq!(door, "*1");
        load(&b)
    }

    #[test]
    fn test_cell_bits() {
        let cell = RoutingCell::with_height(5)
            .with_connection(Direction::East, true)
            .with_connection(Direction::South, true);
        assert_eq!(cell.height(), 5);
        assert_eq!(cell.height_units(), 20);
        assert!(cell.connects(Direction::East));
        assert!(!cell.connects(Direction::West));
        assert!(cell.connects(Direction::South));
        assert!(!cell.is_filled());
        assert!(RoutingCell::FILLED.is_filled());
        assert_eq!(Direction::North.bit(), 0x40);
        assert_eq!(Direction::West.opposite(), Direction::East);
        assert_eq!(Direction::South.dvec(), [0, -1]);
    }

    #[test]
    fn test_routing_lump_compresses_runs() {
        let mut lump = RoutingGrid::new(4, 8).to_lump();
        for (i, b) in lump.route.iter_mut().enumerate().take(1000) {
            *b = (i % 7) as u8;
        }
        lump.fall[300..900].fill(0xFE);
        lump.step[5] = 1;

        let packed = compress_routing(&lump);
        assert!(packed.len() < ROUTING_TOTAL / 50, "packed to {} bytes", packed.len());
        assert_eq!(decompress_routing(&packed).unwrap(), lump);
    }

    #[test]
    fn test_routing_lump_rejects_bad_length() {
        let lump = RoutingGrid::new(4, 8).to_lump();
        let mut packed = compress_routing(&lump);
        packed.truncate(packed.len() - 4);
        assert!(matches!(
            decompress_routing(&packed),
            Err(CModelError::BadRouting { .. })
        ));

        // a short first block misaligns everything after it
        let short = [4u8, 8, 0x83, 0, 0, 0, 0];
        assert!(matches!(
            decompress_routing(&short),
            Err(CModelError::BadRouting { decoded: 4 })
        ));
        assert!(decompress_routing(&[4]).is_err());
    }

    #[test]
    fn test_config_from_cvars() {
        let mut cvars = CvarContext::new();
        RoutingConfig::register(&mut cvars);
        assert_eq!(RoutingConfig::from_cvars(&cvars), RoutingConfig::default());

        cvars.set(CVAR_STEP_LOW, "5");
        cvars.set(CVAR_SAMPLE_INSET, "40");
        assert_eq!(RoutingConfig::from_cvars(&cvars), RoutingConfig::default());
        cvars.apply_latched();
        let cfg = RoutingConfig::from_cvars(&cvars);
        assert_eq!(cfg.step_low, 5);
        assert_eq!(cfg.sample_inset, 16.0);
        assert_eq!(RoutingConfig::from_cvars(&CvarContext::new()).step_big, 8);
    }

    #[test]
    fn test_flat_floor_cells() {
        let mut b = MapBuilder::new();
        floor(&mut b);
        let tiles = load(&b);
        let grid = routed(&tiles, &[]);

        let cell = grid.cell(ROW, ROW, 0);
        assert!(!cell.is_filled());
        assert_eq!(cell.height(), 0);
        for dir in Direction::ALL {
            assert!(cell.connects(dir), "{:?} should be open", dir);
        }
        assert!(grid.falls(ROW, ROW, 1));
        assert!(!grid.falls(ROW, ROW, 0));

        // off the floor there is nothing to stand on
        assert!(grid.cell(127, ROW, 0).is_filled());
        assert!(!grid.cell(128, ROW, 0).connects(Direction::West));
        assert!(!grid.cell(131, ROW, 0).connects(Direction::East));

        assert_eq!(grid.pos_to_vec_on_floor(&[129, 129, 0]), [48.0, 48.0, 32.0]);
        assert!(grid.map_min[0] < grid.map_max[0]);
    }

    #[test]
    fn test_map_size_from_routed_columns() {
        let mut grid = RoutingGrid::with_config(&RoutingConfig::default());
        grid.update_map_size();
        assert_eq!(grid.map_min, [0.0; 3]);
        assert_eq!(grid.map_max, [0.0; 3]);

        // 41 columns wide, 5 rows deep
        for y in 120..=124 {
            for x in 100..=140 {
                grid.fall[column_index(x, y)] = 0b10;
            }
        }
        grid.update_map_size();
        assert_eq!(grid.map_min, [-780.0, -176.0, 32.0]);
        assert_eq!(grid.map_max, [300.0, -176.0, 32.0]);

        // one floor tile routes columns 126..=133 on both axes
        let mut b = MapBuilder::new();
        floor(&mut b);
        let grid = routed(&load(&b), &[]);
        assert_eq!(grid.map_min, [52.0, 52.0, 32.0]);
        assert_eq!(grid.map_max, [76.0, 76.0, 32.0]);
    }

    #[test]
    fn test_wall_blocks_connection() {
        let mut b = MapBuilder::new();
        floor(&mut b);
        b.add_brush(0, [60.0, 0.0, 0.0], [68.0, 128.0, 64.0], Contents::SOLID);
        let tiles = load(&b);
        let grid = routed(&tiles, &[]);

        assert!(!grid.cell(129, ROW, 0).is_filled());
        assert!(!grid.cell(130, ROW, 0).is_filled());
        assert!(!grid.cell(129, ROW, 0).connects(Direction::East));
        assert!(!grid.cell(130, ROW, 0).connects(Direction::West));
        assert!(grid.cell(129, ROW, 0).connects(Direction::North));
        assert_eq!(grid.step_target([129, ROW as u8, 0], 0), None);
    }

    #[test]
    fn test_low_ledge_is_climbable() {
        let mut b = MapBuilder::new();
        floor(&mut b);
        b.add_brush(0, [64.0, 0.0, 0.0], [128.0, 128.0, 16.0], Contents::SOLID);
        let tiles = load(&b);
        let grid = routed(&tiles, &[]);

        assert_eq!(grid.cell(129, ROW, 0).height(), 0);
        assert_eq!(grid.cell(130, ROW, 0).height(), 4);
        assert!(grid.cell(129, ROW, 0).connects(Direction::East));
        assert!(grid.cell(130, ROW, 0).connects(Direction::West));
        assert_eq!(grid.step_target([129, ROW as u8, 0], 0), Some([130, ROW as u8, 0]));
        assert_eq!(grid.height(&[130, ROW as u8, 0]), 16);
    }

    #[test]
    fn test_high_ledge_needs_stepon() {
        let mut b = MapBuilder::new();
        floor(&mut b);
        b.add_brush(0, [64.0, 0.0, 0.0], [128.0, 128.0, 24.0], Contents::SOLID);
        let tiles = load(&b);
        let grid = routed(&tiles, &[]);

        assert_eq!(grid.cell(130, ROW, 0).height(), 6);
        assert!(!grid.cell(129, ROW, 0).connects(Direction::East));
        // stepping down is always allowed
        assert!(grid.cell(130, ROW, 0).connects(Direction::West));

        b.add_brush(LEVEL_STEPON, [32.0, 32.0, 0.0], [64.0, 64.0, 8.0], Contents::STEPON);
        let tiles = load(&b);
        let grid = routed(&tiles, &[]);
        assert!(grid.big_step(129, ROW, 0));
        assert!(!grid.big_step(129, ROW + 1, 0));
        assert_eq!(grid.cell(129, ROW, 0).height(), 0);
        assert!(grid.cell(129, ROW, 0).connects(Direction::East));
        assert!(!grid.cell(129, ROW + 1, 0).connects(Direction::East));
    }

    #[test]
    fn test_single_connection_only_touches_source() {
        let mut b = MapBuilder::new();
        floor(&mut b);
        let tiles = load(&b);
        let cfg = RoutingConfig::default();
        let mut grid = routed(&tiles, &[]);

        grid.set_cell(130, ROW, 0, RoutingCell::with_height(0));
        let before = grid.cell(131, ROW, 0);
        let open = test_connection(&tiles, &mut grid, &cfg, [130, ROW as u8, 0], Direction::East, &[]).unwrap();
        assert!(open);
        assert!(grid.cell(130, ROW, 0).connects(Direction::East));
        assert!(!grid.cell(130, ROW, 0).connects(Direction::West));
        assert_eq!(grid.cell(131, ROW, 0), before);

        check_unit(&tiles, &mut grid, &cfg, [130, ROW as u8, 0], &[]).unwrap();
        assert_eq!(grid.cell(130, ROW, 0), RoutingCell::with_height(0));
    }

    #[test]
    fn test_door_recalc() {
        let _ = env_logger::builder().is_test(true).try_init();
        let tiles = corridor();
        let cfg = RoutingConfig::default();
        let mut grid = routed(&tiles, &["*1"]);
        let closed = grid.clone();

        assert!(grid.cell(130, ROW, 0).is_filled());
        assert!(!grid.cell(129, ROW, 0).connects(Direction::East));
        assert!(!grid.cell(131, ROW, 0).connects(Direction::West));
        assert!(!grid.cell(129, ROW, 0).connects(Direction::North));

        // door opened
        recalc_routing(&tiles, &mut grid, &cfg, "*1", &[]).unwrap();
        assert!(!grid.cell(130, ROW, 0).is_filled());
        assert!(grid.cell(129, ROW, 0).connects(Direction::East));
        assert!(grid.cell(131, ROW, 0).connects(Direction::West));
        assert!(grid.cell(130, ROW, 0).connects(Direction::East));

        for z in 0..PATHFINDING_HEIGHT {
            for y in 0..PATHFINDING_WIDTH {
                for x in 0..PATHFINDING_WIDTH {
                    if (127..=133).contains(&x) && (126..=132).contains(&y) {
                        continue;
                    }
                    assert_eq!(grid.cell(x, y, z), closed.cell(x, y, z), "cell {x} {y} {z} changed");
                }
            }
        }

        // closing it again restores the original grid
        recalc_routing(&tiles, &mut grid, &cfg, "*1", &["*1"]).unwrap();
        assert_eq!(grid.checksum(), closed.checksum());

        assert!(matches!(
            recalc_routing(&tiles, &mut grid, &cfg, "door", &[]),
            Err(CModelError::BadInlineName(_))
        ));
        assert!(recalc_routing(&tiles, &mut grid, &cfg, "*2", &[]).is_err());
    }

    #[test]
    fn test_baked_lump_matches_reroute() {
        let mut b = MapBuilder::new();
        floor(&mut b);
        b.add_brush(0, [64.0, 0.0, 0.0], [128.0, 128.0, 16.0], Contents::SOLID);
        let rerouted = routed(&load(&b), &[]);

        b.set_routing(&rerouted.to_lump());
        let tiles = load(&b);
        assert!(tiles.tile(0).unwrap().routing.is_some());
        let baked = routed(&tiles, &[]);
        assert_eq!(baked.checksum(), rerouted.checksum());
        assert_eq!(baked.map_min, rerouted.map_min);
        assert_eq!(baked.map_max, rerouted.map_max);

        let mut shifted = RoutingGrid::new(4, 8);
        shifted.merge_lump(&rerouted.to_lump(), [2, 0, 1]);
        assert_eq!(shifted.cell(131, ROW, 1), rerouted.cell(129, ROW, 0));
        assert_eq!(shifted.falls(131, ROW, 2), rerouted.falls(129, ROW, 1));
        assert_eq!(shifted.cell(129, ROW, 0), RoutingCell(0));
    }

    #[test]
    fn test_diagonal_needs_both_paths() {
        let mut grid = RoutingGrid::new(4, 8);
        let open = RoutingCell::with_height(0)
            .with_connection(Direction::East, true)
            .with_connection(Direction::North, true);
        grid.set_cell(10, 10, 0, open);
        grid.set_cell(11, 10, 0, open);
        grid.set_cell(10, 11, 0, open);
        assert_eq!(grid.step_target([10, 10, 0], 4), Some([11, 11, 0]));

        grid.set_cell(10, 11, 0, RoutingCell::with_height(0));
        assert_eq!(grid.step_target([10, 10, 0], 4), None);
        assert_eq!(grid.step_target([10, 10, 0], 2), Some([10, 11, 0]));
        assert_eq!(grid.step_target([10, 10, 0], 9), None);
    }

    #[test]
    fn test_step_settles_through_fall_cells() {
        let mut grid = RoutingGrid::new(4, 8);
        grid.set_cell(10, 10, 2, RoutingCell::with_height(0).with_connection(Direction::East, true));
        grid.fall[column_index(11, 10)] = 0b0000_0110;
        assert_eq!(grid.step_target([10, 10, 2], 0), Some([11, 10, 0]));

        // a high floor plus the climb reaches the band above
        grid.set_cell(10, 10, 0, RoutingCell::with_height(12).with_connection(Direction::East, true));
        grid.fall[column_index(11, 10)] = 0;
        assert_eq!(grid.step_target([10, 10, 0], 0), Some([11, 10, 1]));
    }
}
