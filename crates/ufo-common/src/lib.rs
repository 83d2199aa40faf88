#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp)]

// Battlescape collision, line-of-sight and routing engine shared by the
// server and the client.

pub mod q_shared;
pub mod qfiles;
pub mod crc;
pub mod md4;
pub mod cvar;
pub mod cmodel;
pub mod tracing;
pub mod tnodes;
pub mod routing;
pub mod grid;
pub mod mapbuilder;
