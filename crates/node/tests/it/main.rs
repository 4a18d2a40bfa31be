//! Multi-validator scenarios on a deterministic fake network.

mod allegro_floor;
mod certificates;
mod corrupted_datadir;
mod empty_blocks;
mod single_proposer;
mod transfers;
mod utils;
