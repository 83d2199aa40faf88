// Client side of the battlescape: its own copy of the tiles and routing
// grid for move previews and path display.

pub mod cl_world;
