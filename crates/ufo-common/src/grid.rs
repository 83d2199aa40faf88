// grid.rs — movement distance fields over the routing grid
//
// MoveCalc grows a distance field from the actor's cell in passes over a
// square that widens by one cell per pass. Each pass relaxes the cells
// touched by the previous pass into their eight neighbours.

use crate::q_shared::{
    Pos3, CORE_DIRECTIONS, DVECS, MAX_MOVELENGTH, PATHFINDING_HEIGHT, PATHFINDING_WIDTH,
    ROUTE_UNREACHED, TU_MOVE_DIAGONAL, TU_MOVE_STRAIGHT,
};
use crate::routing::{RoutingGrid, ROUTE_SIZE, ROUTING_BLOCK};
use log::{trace, warn};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridError {
    #[error("position {0:?} is outside the grid")]
    OutOfRange(Pos3),
}

/// Time units needed to move one cell in direction `dir`.
pub fn move_cost(dir: usize) -> u8 {
    if dir < CORE_DIRECTIONS {
        TU_MOVE_STRAIGHT
    } else {
        TU_MOVE_DIAGONAL
    }
}

/// One step of a reconstructed path: the direction of the move into the
/// queried cell and the band of the cell it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveStep {
    pub dir: u8,
    pub z: u8,
}

impl MoveStep {
    /// `dir | z << 3`, the byte form used on the wire.
    pub fn packed(self) -> u8 {
        self.dir | (self.z << 3)
    }

    pub fn from_packed(byte: u8) -> Self {
        Self {
            dir: byte & 0x07,
            z: byte >> 3,
        }
    }

    /// The cell this step leaves from, given the cell it arrives at.
    pub fn predecessor(self, to: &Pos3) -> Pos3 {
        let dv = DVECS[self.dir as usize];
        [
            (to[0] as i32 - dv[0]) as u8,
            (to[1] as i32 - dv[1]) as u8,
            self.z,
        ]
    }
}

#[inline]
fn area_index(pos: &Pos3) -> usize {
    pos[2] as usize * ROUTING_BLOCK + pos[1] as usize * PATHFINDING_WIDTH + pos[0] as usize
}

fn in_grid(pos: &Pos3) -> bool {
    (pos[2] as usize) < PATHFINDING_HEIGHT
}

/// Distance field state of one pathfinding user.
pub struct Pathing {
    area: Vec<u8>,
    area_stored: Vec<u8>,
    /// Pass number in which each cell was last improved.
    stamps: Vec<u32>,
    generation: u32,
    forbidden: Vec<Pos3>,
    budget: u8,
}

impl Default for Pathing {
    fn default() -> Self {
        Self::new()
    }
}

impl Pathing {
    pub fn new() -> Self {
        Self {
            area: vec![ROUTE_UNREACHED; ROUTE_SIZE],
            area_stored: vec![ROUTE_UNREACHED; ROUTE_SIZE],
            stamps: vec![0; ROUTE_SIZE],
            generation: 0,
            forbidden: Vec::new(),
            budget: 0,
        }
    }

    /// Compute the cost of reaching every cell from `from` within `budget`
    /// time units, never entering a cell of `forbidden`.
    pub fn move_calc(
        &mut self,
        grid: &RoutingGrid,
        from: &Pos3,
        budget: u8,
        forbidden: &[Pos3],
    ) -> Result<(), GridError> {
        if !in_grid(from) {
            return Err(GridError::OutOfRange(*from));
        }

        self.area.fill(ROUTE_UNREACHED);
        self.forbidden.clear();
        self.forbidden.extend_from_slice(forbidden);
        self.budget = budget.min(MAX_MOVELENGTH - 1);

        if self.generation > u32::MAX - PATHFINDING_WIDTH as u32 * 4 {
            self.stamps.fill(0);
            self.generation = 0;
        }
        self.generation += 1;

        let origin = area_index(from);
        self.area[origin] = 0;
        self.stamps[origin] = self.generation;

        let (mut xl, mut xh) = (from[0] as usize, from[0] as usize);
        let (mut yl, mut yh) = (from[1] as usize, from[1] as usize);
        let mut passes = 0;

        loop {
            xl = xl.saturating_sub(1);
            yl = yl.saturating_sub(1);
            xh = (xh + 1).min(PATHFINDING_WIDTH - 1);
            yh = (yh + 1).min(PATHFINDING_WIDTH - 1);

            let active = self.generation;
            let next = active + 1;
            let mut changed = false;

            for z in 0..PATHFINDING_HEIGHT {
                for y in yl..=yh {
                    for x in xl..=xh {
                        let pos = [x as u8, y as u8, z as u8];
                        let idx = area_index(&pos);
                        if self.stamps[idx] != active {
                            continue;
                        }
                        let l = self.area[idx];
                        for dir in 0..DVECS.len() {
                            changed |= self.move_mark(grid, &pos, dir, l, next);
                        }
                    }
                }
            }

            self.generation = next;
            passes += 1;
            if !changed {
                break;
            }
        }

        trace!("move_calc from {:?}: {} passes", from, passes);
        Ok(())
    }

    /// Relax the neighbour of `pos` in direction `dir` with cost `l` plus the
    /// move cost. Returns true when the neighbour improved; it is then
    /// scheduled for the pass numbered `stamp`.
    pub fn move_mark(&mut self, grid: &RoutingGrid, pos: &Pos3, dir: usize, l: u8, stamp: u32) -> bool {
        let Some(target) = grid.step_target(*pos, dir) else {
            return false;
        };
        let cost = l + move_cost(dir);
        if cost > self.budget {
            return false;
        }
        if self.forbidden.contains(&target) {
            return false;
        }

        let idx = area_index(&target);
        if self.area[idx] <= cost {
            return false;
        }
        self.area[idx] = cost;
        self.stamps[idx] = stamp;
        true
    }

    /// Keep the current field for later `move_length(.., true)` queries.
    pub fn move_store(&mut self) {
        self.area_stored.copy_from_slice(&self.area);
    }

    /// Cost to reach `to`, or ROUTE_UNREACHED.
    pub fn move_length(&self, to: &Pos3, stored: bool) -> u8 {
        if !in_grid(to) {
            return ROUTE_UNREACHED;
        }
        let idx = area_index(to);
        if stored {
            self.area_stored[idx]
        } else {
            self.area[idx]
        }
    }

    /// The step that led into `from` on a cheapest path, or None at the
    /// origin and for unreached cells.
    pub fn move_next(&self, grid: &RoutingGrid, from: &Pos3) -> Option<MoveStep> {
        let l = self.move_length(from, false);
        if l == 0 || l == ROUTE_UNREACHED {
            return None;
        }

        for z in 0..PATHFINDING_HEIGHT {
            for (dir, dv) in DVECS.iter().enumerate() {
                let cost = move_cost(dir);
                if l < cost {
                    continue;
                }
                let px = from[0] as i32 - dv[0];
                let py = from[1] as i32 - dv[1];
                if !(0..PATHFINDING_WIDTH as i32).contains(&px)
                    || !(0..PATHFINDING_WIDTH as i32).contains(&py)
                {
                    continue;
                }

                let pred = [px as u8, py as u8, z as u8];
                if self.area[area_index(&pred)] != l - cost {
                    continue;
                }
                if grid.step_target(pred, dir) == Some(*from) {
                    return Some(MoveStep {
                        dir: dir as u8,
                        z: z as u8,
                    });
                }
            }
        }

        warn!("move_next: no predecessor for {:?} at length {}", from, l);
        None
    }

    /// Cells from the origin to `to`, both included, following MoveNext.
    pub fn path_to(&self, grid: &RoutingGrid, to: &Pos3) -> Option<Vec<Pos3>> {
        let l = self.move_length(to, false);
        if l == ROUTE_UNREACHED {
            return None;
        }

        let mut path = vec![*to];
        let mut pos = *to;
        while self.move_length(&pos, false) != 0 {
            let step = self.move_next(grid, &pos)?;
            pos = step.predecessor(&pos);
            path.push(pos);
            if path.len() > MAX_MOVELENGTH as usize {
                return None;
            }
        }
        path.reverse();
        Some(path)
    }
}

// =============================================================================
// Tests
// =============================================================================
