// q_shared.rs — foundational types and math shared by the collision and routing layers

use bitflags::bitflags;

// ============================================================
// Basic types
// ============================================================

pub type Vec3 = [f32; 3];

/// Grid position: (x, y, z) in routing cells.
pub type Pos3 = [u8; 3];

pub const PITCH: usize = 0; // up / down
pub const YAW: usize = 1; // left / right
pub const ROLL: usize = 2; // fall over

// ============================================================
// Plane types
// ============================================================

// 0-2 are axial planes
pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;

// 3-5 are non-axial planes snapped to the nearest
pub const PLANE_ANYX: u8 = 3;
pub const PLANE_ANYY: u8 = 4;
pub const PLANE_ANYZ: u8 = 5;

/// Grouping tnode without a separating plane.
pub const PLANE_NONE: u8 = 6;

// ============================================================
// Contents
// ============================================================

bitflags! {
    /// Brush and leaf contents. Lower bits are stronger and eat weaker brushes completely.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Contents: u32 {
        const SOLID = 0x1;
        const WINDOW = 0x2;
        const WATER = 0x20;
        const ACTORCLIP = 0x10000;
        const PASSABLE = 0x20000;
        const ORIGIN = 0x1000000;
        const WEAPONCLIP = 0x2000000;
        const DEADACTOR = 0x4000000;
        const DETAIL = 0x8000000;
        const TRANSLUCENT = 0x10000000;
        const STEPON = 0x40000000;
    }
}

impl Contents {
    pub const MASK_ALL: Contents = Contents::from_bits_retain(u32::MAX);
    pub const MASK_SOLID: Contents = Contents::SOLID.union(Contents::WINDOW);
    pub const MASK_IMPASSABLE: Contents = Contents::MASK_SOLID.union(Contents::ACTORCLIP);

    /// Reinterpret the signed contents word stored in a BSP record.
    pub fn from_file(value: i32) -> Self {
        Contents::from_bits_retain(value as u32)
    }

    /// Does a leaf with these contents stop a line of sight?
    pub fn blocks_line(self) -> bool {
        self.intersects(Contents::MASK_IMPASSABLE) && !self.contains(Contents::PASSABLE)
    }
}

// ============================================================
// Levels
// ============================================================

/// Model slots 0..=255 carry the regular level bitmasks; the clip levels follow.
pub const LEVEL_WEAPONCLIP: usize = 256;
pub const LEVEL_ACTORCLIP: usize = 257;
pub const LEVEL_STEPON: usize = 258;
pub const NUM_REGULAR_MODELS: usize = LEVEL_STEPON + 1;

bitflags! {
    /// Selects which level heads take part in a line test or complete trace.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TraceLevels: u32 {
        const REGULAR = 0xFF;
        const ACTORCLIP = 0x100;
        const WEAPONCLIP = 0x200;
        const STEPON = 0x400;
    }
}

impl TraceLevels {
    /// Only the given game levels (bit n = level n + 1).
    pub fn levels(bits: u8) -> Self {
        TraceLevels::from_bits_retain(bits as u32)
    }

    /// Everything an actor collides with while walking.
    pub fn walking() -> Self {
        TraceLevels::REGULAR | TraceLevels::ACTORCLIP
    }
}

/// Decide whether a head registered for model slot `level` is part of a query.
pub fn level_is_traced(level: usize, mask: TraceLevels) -> bool {
    match level {
        0 => true,
        LEVEL_WEAPONCLIP => mask.contains(TraceLevels::WEAPONCLIP),
        LEVEL_ACTORCLIP => mask.contains(TraceLevels::ACTORCLIP),
        LEVEL_STEPON => mask.contains(TraceLevels::STEPON),
        l => {
            let core = mask.bits() & TraceLevels::REGULAR.bits();
            core == 0 || (l as u32 & core) != 0
        }
    }
}

// ============================================================
// Grid geometry
// ============================================================

pub const UNIT_SIZE: i32 = 32;
pub const UNIT_HEIGHT: i32 = 64;
/// Height resolution of the routing grid in world units.
pub const QUANT: i32 = 4;

pub const PATHFINDING_WIDTH: usize = 256;
pub const PATHFINDING_HEIGHT: usize = 8;

pub const MAX_MOVELENGTH: u8 = 60;
pub const ROUTE_UNREACHED: u8 = 0x3F;

pub const TU_MOVE_STRAIGHT: u8 = 2;
pub const TU_MOVE_DIAGONAL: u8 = 3;

/// The eight move directions. The first four are cardinal.
pub const DVECS: [[i32; 2]; 8] = [
    [1, 0],
    [-1, 0],
    [0, 1],
    [0, -1],
    [1, 1],
    [-1, -1],
    [-1, 1],
    [1, -1],
];

pub const CORE_DIRECTIONS: usize = 4;

/// Convert a world position into a grid position, clamped into the grid.
pub fn vec_to_pos(v: &Vec3) -> Pos3 {
    let max_xy = (PATHFINDING_WIDTH - 1) as f32;
    let max_z = (PATHFINDING_HEIGHT - 1) as f32;
    [
        ((v[0] + 4096.0) / UNIT_SIZE as f32).floor().clamp(0.0, max_xy) as u8,
        ((v[1] + 4096.0) / UNIT_SIZE as f32).floor().clamp(0.0, max_xy) as u8,
        (v[2] / UNIT_HEIGHT as f32).floor().clamp(0.0, max_z) as u8,
    ]
}

/// Center of a grid cell in world space, half a band above its base.
pub fn pos_to_vec(p: &Pos3) -> Vec3 {
    [
        ((p[0] as i32 - 128) * UNIT_SIZE + UNIT_SIZE / 2) as f32,
        ((p[1] as i32 - 128) * UNIT_SIZE + UNIT_SIZE / 2) as f32,
        (p[2] as i32 * UNIT_HEIGHT + UNIT_HEIGHT / 2) as f32,
    ]
}

// ============================================================
// Collision primitives
// ============================================================

/// Plane with a precomputed type and sign mask for fast box tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    pub signbits: u8,
}

impl Default for CPlane {
    fn default() -> Self {
        Self {
            normal: [0.0; 3],
            dist: 0.0,
            plane_type: 0,
            signbits: 0,
        }
    }
}

impl CPlane {
    /// Build a plane and classify it. Negative axial normals are stored as
    /// non-axial so the single-coordinate fast paths stay correct.
    pub fn new(normal: Vec3, dist: f32) -> Self {
        let mut plane_type = PLANE_ANYZ;
        for axis in 0..3 {
            if normal[axis] == 1.0 {
                plane_type = axis as u8;
                break;
            }
        }
        if plane_type == PLANE_ANYZ {
            let ax = normal[0].abs();
            let ay = normal[1].abs();
            let az = normal[2].abs();
            plane_type = if ax >= ay && ax >= az {
                PLANE_ANYX
            } else if ay >= az {
                PLANE_ANYY
            } else {
                PLANE_ANYZ
            };
        }
        Self {
            normal,
            dist,
            plane_type,
            signbits: signbits_for_plane(&normal),
        }
    }
}

pub fn signbits_for_plane(normal: &Vec3) -> u8 {
    let mut bits = 0u8;
    for j in 0..3 {
        if normal[j] < 0.0 {
            bits |= 1 << j;
        }
    }
    bits
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CSurface {
    pub name: String,
    pub flags: i32,
    pub value: i32,
}

/// Inline or level model record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Runtime placement of doors and rotating geometry.
    pub origin: Vec3,
    pub angles: Vec3,
    pub headnode: i32,
    /// Index of the owning tile.
    pub tile: usize,
    pub shift: Vec3,
}

impl Default for CModel {
    fn default() -> Self {
        Self {
            mins: [0.0; 3],
            maxs: [0.0; 3],
            origin: [0.0; 3],
            angles: [0.0; 3],
            headnode: -1,
            tile: 0,
            shift: [0.0; 3],
        }
    }
}

// ============================================================
// Trace
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// The whole sweep was inside a brush.
    pub allsolid: bool,
    /// The start point was inside a brush.
    pub startsolid: bool,
    pub fraction: f32,
    pub endpos: Vec3,
    pub plane: CPlane,
    pub surface: Option<CSurface>,
    pub contents: Contents,
    pub leafnum: usize,
    /// Tile the hit belongs to.
    pub map_tile: usize,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: CPlane::default(),
            surface: None,
            contents: Contents::empty(),
            leafnum: 0,
            map_tile: 0,
        }
    }
}

// ============================================================
// Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

pub fn vector_not_empty(v: &Vec3) -> bool {
    v[0] != 0.0 || v[1] != 0.0 || v[2] != 0.0
}

pub fn vector_length(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Lerp between `start` and `end` by `frac`.
pub fn vector_lerp(start: &Vec3, end: &Vec3, frac: f32) -> Vec3 {
    [
        start[0] + frac * (end[0] - start[0]),
        start[1] + frac * (end[1] - start[1]),
        start[2] + frac * (end[2] - start[2]),
    ]
}

/// True if `v1` is nearer to `comp` than `v2` is.
pub fn vector_nearer(v1: &Vec3, v2: &Vec3, comp: &Vec3) -> bool {
    let d1 = vector_subtract(comp, v1);
    let d2 = vector_subtract(comp, v2);
    vector_length(&d1) < vector_length(&d2)
}

pub fn vector_center_from_mins_maxs(mins: &Vec3, maxs: &Vec3) -> Vec3 {
    [
        (mins[0] + maxs[0]) / 2.0,
        (mins[1] + maxs[1]) / 2.0,
        (mins[2] + maxs[2]) / 2.0,
    ]
}

// ============================================================
// Angle functions
// ============================================================

/// Returns (forward, right, up) for the given pitch/yaw/roll in degrees.
pub fn angle_vectors(angles: &Vec3) -> (Vec3, Vec3, Vec3) {
    let angle_yaw = angles[YAW].to_radians();
    let sy = angle_yaw.sin();
    let cy = angle_yaw.cos();

    let angle_pitch = angles[PITCH].to_radians();
    let sp = angle_pitch.sin();
    let cp = angle_pitch.cos();

    let angle_roll = angles[ROLL].to_radians();
    let sr = angle_roll.sin();
    let cr = angle_roll.cos();

    let forward = [cp * cy, cp * sy, -sp];
    let right = [
        -sr * sp * cy + -cr * -sy,
        -sr * sp * sy + -cr * cy,
        -sr * cp,
    ];
    let up = [
        cr * sp * cy + -sr * -sy,
        cr * sp * sy + -sr * cy,
        cr * cp,
    ];
    (forward, right, up)
}

/// Rotation matrix whose rows are forward, left and up.
pub fn create_rotation_matrix(angles: &Vec3) -> [Vec3; 3] {
    let (forward, right, up) = angle_vectors(angles);
    [forward, [-right[0], -right[1], -right[2]], up]
}

pub fn rotate_vector(m: &[Vec3; 3], v: &Vec3) -> Vec3 {
    [dot_product(&m[0], v), dot_product(&m[1], v), dot_product(&m[2], v)]
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &CPlane) -> i32 {
    // fast axial cases
    if p.plane_type < 3 {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // general case: pick the corners nearest and farthest along the normal
    let mut near = [0.0f32; 3];
    let mut far = [0.0f32; 3];
    for j in 0..3 {
        if p.signbits & (1 << j) != 0 {
            far[j] = emins[j];
            near[j] = emaxs[j];
        } else {
            far[j] = emaxs[j];
            near[j] = emins[j];
        }
    }
    let dist1 = dot_product(&p.normal, &far);
    let dist2 = dot_product(&p.normal, &near);

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

// ============================================================
// Parsing
// ============================================================

pub const MAX_TOKEN_CHARS: usize = 1024;

/// Parse one whitespace-delimited token from `data`, handling // comments
/// and "quoted strings". Returns `(token, remaining)` or `(token, None)`
/// if end of data.
pub fn com_parse(data: &str) -> (String, Option<&str>) {
    let mut chars = data.as_bytes();
    let mut token = Vec::new();

    // skip whitespace
    loop {
        while !chars.is_empty() && chars[0] <= b' ' {
            chars = &chars[1..];
        }
        if chars.is_empty() {
            return (String::new(), None);
        }

        // skip // comments
        if chars.len() >= 2 && chars[0] == b'/' && chars[1] == b'/' {
            while !chars.is_empty() && chars[0] != b'\n' {
                chars = &chars[1..];
            }
            continue;
        }
        break;
    }

    let quoted = chars[0] == b'"';
    if quoted {
        chars = &chars[1..];
        while !chars.is_empty() && chars[0] != b'"' {
            if token.len() < MAX_TOKEN_CHARS {
                token.push(chars[0]);
            }
            chars = &chars[1..];
        }
        if !chars.is_empty() {
            chars = &chars[1..]; // skip closing quote
        }
    } else {
        while !chars.is_empty() && chars[0] > b' ' {
            if token.len() < MAX_TOKEN_CHARS {
                token.push(chars[0]);
            }
            chars = &chars[1..];
        }
    }

    let offset = data.len() - chars.len();
    let remaining = if chars.is_empty() {
        None
    } else {
        Some(&data[offset..])
    };
    (String::from_utf8_lossy(&token).into_owned(), remaining)
}

// =============================================================================
// Tests
// =============================================================================
