//! Nested-loop simulation harness.
//!
//! A simulation is driven by stacks of counters (`looper`), one per mode,
//! whose level boundaries fire named hooks. Stats hooks turn those
//! boundaries into per-level series (`stats`, `tensorfs`), with every level
//! above the one observed directly being a reduction of the level inside it.
//! `sim` binds a network, its environments and the stats together and runs
//! them headless.

#[path = "core/time.rs"]
pub mod time;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/tensorfs.rs"]
pub mod tensorfs;

#[path = "core/looper.rs"]
pub mod looper;

#[path = "core/stats.rs"]
pub mod stats;

#[path = "core/env.rs"]
pub mod env;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/sim.rs"]
pub mod sim;

pub mod experiments;
pub mod observer;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::env::{Env, Envs, FixedTable, Table};
    pub use crate::error::{Result, SimError};
    pub use crate::looper::{Count, LoopEvent, RunState, Stacks, StopHandle};
    pub use crate::network::{LayerRole, Network};
    pub use crate::sim::{Model, Sim, SimState};
    pub use crate::stats::{Reduction, StatEvent, StatFunc, StatRegistry};
    pub use crate::tensorfs::Stats;
    pub use crate::time::{Level, Mode, Phase};
}
