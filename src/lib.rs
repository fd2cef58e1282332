#[macro_use]
mod macros;

pub mod config;
pub mod fastpath;
pub mod phy;
pub mod shm;
pub mod slowpath;
pub mod time;
pub mod wire;
