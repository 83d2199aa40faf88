// sv_world.rs — authoritative map state: tiles, routing grid and moves
//
// The server keeps the list of inline models that still stand in the world
// (closed doors, unbroken walls). Every line test and trace honours that
// list, and every change to it reroutes the cells around the model.

use log::{debug, info};
use thiserror::Error;
use ufo_common::cmodel::{CModelError, MapTiles, TileSpec};
use ufo_common::cvar::CvarContext;
use ufo_common::grid::{GridError, Pathing};
use ufo_common::q_shared::{Contents, Pos3, Trace, TraceLevels, Vec3, ROUTE_UNREACHED};
use ufo_common::routing::{
    model_routing_box, recalc_box_routing, recalc_routing, RoutingConfig, RoutingGrid,
};
use ufo_common::tnodes::ent_test_line;
use ufo_common::tracing::ent_complete_box_trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoveError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("{0:?} cannot be reached")]
    Unreachable(Pos3),
    #[error("move to {to:?} costs {cost}, only {budget} left")]
    TooExpensive { to: Pos3, cost: u8, budget: u8 },
    #[error("no path back from {0:?}")]
    NoPath(Pos3),
}

pub struct ServerWorld {
    pub cvars: CvarContext,
    cfg: RoutingConfig,
    tiles: MapTiles,
    grid: RoutingGrid,
    pathing: Pathing,
    /// Inline models currently present, as `*N` names.
    inline_models: Vec<String>,
}

impl ServerWorld {
    pub fn new(mut cvars: CvarContext) -> Self {
        RoutingConfig::register(&mut cvars);
        let cfg = RoutingConfig::from_cvars(&cvars);
        Self {
            cvars,
            cfg,
            tiles: MapTiles::new(),
            grid: RoutingGrid::with_config(&cfg),
            pathing: Pathing::new(),
            inline_models: Vec::new(),
        }
    }

    fn inline_list(&self) -> Vec<&str> {
        self.inline_models.iter().map(String::as_str).collect()
    }

    /// Load the tiles and build the routing grid with every inline model present.
    pub fn load_map(&mut self, specs: &[TileSpec<'_>]) -> Result<u32, CModelError> {
        self.cvars.apply_latched();
        self.cfg = RoutingConfig::from_cvars(&self.cvars);

        let checksum = self.tiles.load_map(specs)?;
        self.inline_models = (1..=self.tiles.num_inline_models())
            .map(|n| format!("*{}", n))
            .collect();

        let list = self.inline_list();
        let mut grid = RoutingGrid::from_tiles(&self.tiles, &self.cfg, &list)?;
        // baked lumps know nothing about inline models
        for name in &list {
            recalc_routing(&self.tiles, &mut grid, &self.cfg, name, &list)?;
        }
        self.grid = grid;

        info!(
            "server map: {} tiles, {} inline models, routing checksum {:04x}",
            self.tiles.num_tiles(),
            self.inline_models.len(),
            self.grid.checksum()
        );
        Ok(checksum)
    }

    /// Place, open or remove an inline model and reroute the cells it
    /// left and the cells it now covers.
    pub fn set_inline_model_state(
        &mut self,
        name: &str,
        present: bool,
        origin: &Vec3,
        angles: &Vec3,
    ) -> Result<(), CModelError> {
        let (old_min, old_max) = model_routing_box(self.tiles.inline_model(name)?);
        self.tiles.set_inline_model_orientation(name, origin, angles)?;

        self.inline_models.retain(|n| n != name);
        if present {
            self.inline_models.push(name.to_string());
        }
        debug!("inline model {} present={} at {:?}", name, present, origin);

        let list: Vec<&str> = self.inline_models.iter().map(String::as_str).collect();
        let (new_min, new_max) = model_routing_box(self.tiles.inline_model(name)?);
        if (old_min, old_max) != (new_min, new_max) {
            recalc_box_routing(&self.tiles, &mut self.grid, &self.cfg, old_min, old_max, &list)?;
        }
        recalc_routing(&self.tiles, &mut self.grid, &self.cfg, name, &list)
    }

    pub fn inline_model_present(&self, name: &str) -> bool {
        self.inline_models.iter().any(|n| n == name)
    }

    pub fn move_calc(&mut self, from: &Pos3, budget: u8, occupied: &[Pos3]) -> Result<(), GridError> {
        self.pathing.move_calc(&self.grid, from, budget, occupied)
    }

    pub fn move_length(&self, to: &Pos3) -> u8 {
        self.pathing.move_length(to, false)
    }

    /// Check an actor move and return the cells it walks through, origin first.
    pub fn validate_move(
        &mut self,
        from: &Pos3,
        to: &Pos3,
        budget: u8,
        occupied: &[Pos3],
    ) -> Result<Vec<Pos3>, MoveError> {
        self.move_calc(from, budget, occupied)?;
        let cost = self.pathing.move_length(to, false);
        if cost == ROUTE_UNREACHED {
            return Err(MoveError::Unreachable(*to));
        }
        if cost > budget {
            return Err(MoveError::TooExpensive {
                to: *to,
                cost,
                budget,
            });
        }
        self.pathing
            .path_to(&self.grid, to)
            .ok_or(MoveError::NoPath(*to))
    }

    /// Box trace through the world and the present inline models.
    pub fn trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        levels: TraceLevels,
        mask: Contents,
    ) -> Result<Trace, CModelError> {
        ent_complete_box_trace(
            &self.tiles,
            start,
            end,
            mins,
            maxs,
            levels,
            mask,
            Contents::empty(),
            &self.inline_list(),
        )
    }

    /// Is the line of sight between start and stop blocked?
    pub fn test_line(&self, start: &Vec3, stop: &Vec3, levels: TraceLevels) -> Result<bool, CModelError> {
        ent_test_line(&self.tiles, start, stop, levels, &self.inline_list())
    }

    pub fn routing_checksum(&self) -> u16 {
        self.grid.checksum()
    }

    pub fn tiles(&self) -> &MapTiles {
        &self.tiles
    }

    pub fn grid(&self) -> &RoutingGrid {
        &self.grid
    }
}
