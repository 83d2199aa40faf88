#![allow(clippy::too_many_arguments)]

// Server side of the battlescape: authoritative tiles, routing grid and
// move validation.

pub mod sv_world;
