pub mod command;
pub mod constants;
pub mod entity;
pub mod runner;
pub mod script;
pub mod simulation;
pub mod snapshot;
pub mod store;
pub mod tick_loop;
pub mod view;

/// Discrete simulation step; the server's counter increases by one per tick
pub type Tick = u32;
