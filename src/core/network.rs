//! The model executor as seen by the scheduler.
//!
//! The loops only push inputs in and read values out; the dynamics behind
//! these calls are the executor's business.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::prng::Prng;
use crate::time::Mode;

/// How a layer takes external input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerRole {
    /// Driven by the pattern applied to it.
    Input,
    /// Receives the pattern as a target to compare against.
    Target,
    /// Takes no external input.
    Hidden,
}

pub trait Network {
    fn name(&self) -> &str;

    fn layer_names(&self) -> Vec<String>;

    fn layer_role(&self, layer: &str) -> Option<LayerRole>;

    fn set_layer_role(&mut self, layer: &str, role: LayerRole) -> Result<()>;

    /// Names of every layer with one of `roles`, in network order.
    fn layers_by_role(&self, roles: &[LayerRole]) -> Vec<String> {
        self.layer_names()
            .into_iter()
            .filter(|l| self.layer_role(l).is_some_and(|r| roles.contains(&r)))
            .collect()
    }

    /// Make the base parameter sheet live, then `sheet` on top of it when
    /// it is not empty. An unknown sheet is a configuration error.
    fn apply_params(&mut self, sheet: &str) -> Result<()>;

    fn init_weights(&mut self, rng: &mut Prng);

    /// Reset time-keeping state at the start of a run.
    fn reset_context(&mut self);

    /// Prepare for a new trial.
    fn new_state(&mut self, mode: Mode);

    /// Clear all external input.
    fn init_ext(&mut self);

    fn apply_ext(&mut self, layer: &str, pattern: &[f32]) -> Result<()>;

    /// Commit the external inputs applied since `init_ext`.
    fn apply_exts(&mut self);

    /// Advance the dynamics by one cycle.
    fn cycle(&mut self);

    /// End of the settling phase of a trial.
    fn plus_phase_end(&mut self) {}

    /// Per-unit values of `var` for `layer`.
    fn layer_state(&self, layer: &str, var: &str) -> Result<Vec<f32>>;

    /// Network-level scalar by name (e.g. "Harmony").
    fn stat(&self, name: &str) -> Option<f64>;
}
