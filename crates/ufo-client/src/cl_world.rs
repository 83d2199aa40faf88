// cl_world.rs — client map state and move previews
// The client routes the same tiles as the server on its own grid; the
// routing checksums tell whether both sides still agree.

use log::{info, warn};
use ufo_common::cmodel::{CModelError, MapTiles, TileSpec};
use ufo_common::cvar::CvarContext;
use ufo_common::grid::{GridError, MoveStep, Pathing};
use ufo_common::q_shared::{Pos3, TraceLevels, Vec3};
use ufo_common::routing::{
    model_routing_box, recalc_box_routing, recalc_routing, RoutingConfig, RoutingGrid,
};
use ufo_common::tnodes::ent_test_line;

pub struct ClientWorld {
    pub cvars: CvarContext,
    cfg: RoutingConfig,
    tiles: MapTiles,
    grid: RoutingGrid,
    pathing: Pathing,
    inline_models: Vec<String>,
}

impl ClientWorld {
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

    pub fn load_map(&mut self, specs: &[TileSpec<'_>]) -> Result<u32, CModelError> {
        self.cvars.apply_latched();
        self.cfg = RoutingConfig::from_cvars(&self.cvars);

        let checksum = self.tiles.load_map(specs)?;
        self.inline_models = (1..=self.tiles.num_inline_models())
            .map(|n| format!("*{}", n))
            .collect();

        let list: Vec<&str> = self.inline_models.iter().map(String::as_str).collect();
        let mut grid = RoutingGrid::from_tiles(&self.tiles, &self.cfg, &list)?;
        for name in &list {
            recalc_routing(&self.tiles, &mut grid, &self.cfg, name, &list)?;
        }
        self.grid = grid;

        info!("client map loaded, routing checksum {:04x}", self.grid.checksum());
        Ok(checksum)
    }

    /// Mirror of the server's inline model update.
    pub fn set_inline_model_state(
        &mut self,
        name: &str,
        present: bool,
        origin: &Vec3,
        angles: &Vec3,
    ) -> Result<(), CModelError> {
        let old = model_routing_box(self.tiles.inline_model(name)?);
        self.tiles.set_inline_model_orientation(name, origin, angles)?;
        self.inline_models.retain(|n| n != name);
        if present {
            self.inline_models.push(name.to_string());
        }

        let list: Vec<&str> = self.inline_models.iter().map(String::as_str).collect();
        if old != model_routing_box(self.tiles.inline_model(name)?) {
            recalc_box_routing(&self.tiles, &mut self.grid, &self.cfg, old.0, old.1, &list)?;
        }
        recalc_routing(&self.tiles, &mut self.grid, &self.cfg, name, &list)
    }

    /// Distance field for the selected actor.
    pub fn preview_move(&mut self, from: &Pos3, budget: u8, occupied: &[Pos3]) -> Result<(), GridError> {
        self.pathing.move_calc(&self.grid, from, budget, occupied)
    }

    pub fn move_length(&self, to: &Pos3) -> u8 {
        self.pathing.move_length(to, false)
    }

    /// Keep the current preview; the HUD reads it while new previews run.
    pub fn store_preview(&mut self) {
        self.pathing.move_store();
    }

    pub fn stored_length(&self, to: &Pos3) -> u8 {
        self.pathing.move_length(to, true)
    }

    pub fn next_step(&self, from: &Pos3) -> Option<MoveStep> {
        self.pathing.move_next(&self.grid, from)
    }

    pub fn path_to(&self, to: &Pos3) -> Option<Vec<Pos3>> {
        self.pathing.path_to(&self.grid, to)
    }

    /// Floor position of a cell in world space, for placing path markers.
    pub fn floor_position(&self, pos: &Pos3) -> Vec3 {
        self.grid.pos_to_vec_on_floor(pos)
    }

    pub fn can_see(&self, from: &Vec3, to: &Vec3) -> Result<bool, CModelError> {
        let list: Vec<&str> = self.inline_models.iter().map(String::as_str).collect();
        let blocked = ent_test_line(&self.tiles, from, to, TraceLevels::walking(), &list)?;
        Ok(!blocked)
    }

    pub fn routing_checksum(&self) -> u16 {
        self.grid.checksum()
    }

    /// Compare against the checksum the server reported.
    pub fn grid_matches(&self, server_checksum: u16) -> bool {
        let ours = self.grid.checksum();
        if ours != server_checksum {
            warn!("routing mismatch: client {:04x}, server {:04x}", ours, server_checksum);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufo_common::mapbuilder::MapBuilder;
    use ufo_common::q_shared::{Contents, ROUTE_UNREACHED};
    use ufo_server::sv_world::ServerWorld;

    fn ledge_map() -> Vec<u8> {
        let mut b = MapBuilder::new();
        b.add_brush(0, [0.0, 0.0, -16.0], [128.0, 128.0, 0.0], Contents::SOLID);
        b.add_brush(0, [64.0, 0.0, 0.0], [128.0, 128.0, 16.0], Contents::SOLID);
        b.add_inline_model("func_breakable", &[([0.0, 96.0, 0.0], [32.0, 128.0, 32.0])]);
        b.build()
    }

    fn spec(data: &[u8]) -> [TileSpec<'_>; 1] {
        [TileSpec {
            name: "ledge",
            data,
            shift: [0, 0, 0],
        }]
    }

    #[test]
    fn test_client_and_server_agree() {
        let _ = env_logger::builder().is_test(true).try_init();
        let data = ledge_map();
        let mut sv = ServerWorld::new(CvarContext::new());
        let mut cl = ClientWorld::new(CvarContext::new());
        let a = sv.load_map(&spec(&data)).unwrap();
        let b = cl.load_map(&spec(&data)).unwrap();
        assert_eq!(a, b);
        assert!(cl.grid_matches(sv.routing_checksum()));

        // the crate breaks on both sides
        sv.set_inline_model_state("*1", false, &[0.0; 3], &[0.0; 3]).unwrap();
        assert!(!cl.grid_matches(sv.routing_checksum()));
        cl.set_inline_model_state("*1", false, &[0.0; 3], &[0.0; 3]).unwrap();
        assert!(cl.grid_matches(sv.routing_checksum()));
    }

    #[test]
    fn test_preview_and_stored_field() {
        let data = ledge_map();
        let mut cl = ClientWorld::new(CvarContext::new());
        cl.load_map(&spec(&data)).unwrap();

        cl.preview_move(&[129, 129, 0], 10, &[]).unwrap();
        assert_eq!(cl.move_length(&[130, 129, 0]), 2);
        assert_eq!(cl.move_length(&[131, 131, 0]), 6);
        // the crate in cell (128, 131) is too high to climb
        assert_eq!(cl.move_length(&[128, 131, 0]), ROUTE_UNREACHED);
        cl.store_preview();

        cl.preview_move(&[131, 129, 0], 10, &[]).unwrap();
        assert_eq!(cl.stored_length(&[130, 129, 0]), 2);
        assert_eq!(cl.move_length(&[130, 129, 0]), 2);
        assert_eq!(cl.stored_length(&[131, 129, 0]), 4);
        assert_eq!(cl.move_length(&[131, 129, 0]), 0);

        let path = cl.path_to(&[128, 129, 0]).unwrap();
        assert_eq!(path.first(), Some(&[131, 129, 0]));
        assert_eq!(path.len(), 4);
        assert_eq!(cl.floor_position(&[130, 129, 0]), [80.0, 48.0, 48.0]);
        assert_eq!(cl.next_step(&[131, 129, 0]), None);
    }

    #[test]
    fn test_line_of_sight_follows_inline_models() {
        let data = ledge_map();
        let mut cl = ClientWorld::new(CvarContext::new());
        cl.load_map(&spec(&data)).unwrap();

        let from = [16.0, 80.0, 16.0];
        let to = [16.0, 120.0, 16.0];
        assert!(!cl.can_see(&from, &to).unwrap());
        cl.set_inline_model_state("*1", false, &[0.0; 3], &[0.0; 3]).unwrap();
        assert!(cl.can_see(&from, &to).unwrap());
    }
}
