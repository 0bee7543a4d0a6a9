//! A small rate-coded network with symmetric, bidirectional projections.
//!
//! Each cycle every layer integrates the average weighted activity of the
//! layers it is connected to and moves its activation toward a sigmoid of
//! that input. Input-role layers with an applied pattern are clamped.
//! Harmony is the mean of `a_i * w_ij * b_j` over every connection, so with
//! activations and weights in [0, 1] it stays in [0, 1].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SimError};
use crate::network::{LayerRole, Network};
use crate::prng::Prng;
use crate::time::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetParams {
    /// Sigmoid gain.
    pub gain: f32,
    /// Input at which a free unit settles to 0.5.
    pub thr: f32,
    /// Integration rate per cycle.
    pub dt: f32,
    /// Random initial weights are drawn from `wt_mean ± wt_var`.
    pub wt_mean: f32,
    pub wt_var: f32,
}

impl Default for NetParams {
    fn default() -> Self {
        Self {
            gain: 8.0,
            thr: 0.25,
            dt: 0.3,
            wt_mean: 0.5,
            wt_var: 0.25,
        }
    }
}

/// Sheet applied before any other.
pub const BASE_SHEET: &str = "Base";

/// Per-layer overrides; unset fields keep the net-wide value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerParams {
    pub gain: Option<f32>,
    pub thr: Option<f32>,
    pub dt: Option<f32>,
}

/// One entry of a parameter sheet. `sel` is `Layer` (every layer) or
/// `#Name` (one layer); named entries win over `Layer` within a sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSel {
    pub sel: String,
    pub set: LayerParams,
}

impl ParamSel {
    pub fn new(sel: &str, set: LayerParams) -> Self {
        Self {
            sel: sel.to_string(),
            set,
        }
    }

    fn specificity(&self) -> Option<u8> {
        if self.sel == "Layer" {
            Some(0)
        } else if self.sel.len() > 1 && self.sel.starts_with('#') {
            Some(1)
        } else {
            None
        }
    }

    fn matches(&self, layer: &str) -> bool {
        self.sel == "Layer" || self.sel.strip_prefix('#') == Some(layer)
    }
}

/// Rate-code parameters in effect for one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveParams {
    pub gain: f32,
    pub thr: f32,
    pub dt: f32,
}

impl From<&NetParams> for LiveParams {
    fn from(p: &NetParams) -> Self {
        Self {
            gain: p.gain,
            thr: p.thr,
            dt: p.dt,
        }
    }
}

impl LiveParams {
    fn apply(&mut self, set: &LayerParams) {
        if let Some(v) = set.gain {
            self.gain = v;
        }
        if let Some(v) = set.thr {
            self.thr = v;
        }
        if let Some(v) = set.dt {
            self.dt = v;
        }
    }
}

#[derive(Debug, Clone)]
struct Layer {
    name: String,
    role: LayerRole,
    live: LiveParams,
    shape: (usize, usize),
    act: Vec<f32>,
    /// Activation at the end of the settling phase.
    act_m: Vec<f32>,
    net: Vec<f32>,
    ext: Vec<f32>,
    pending: Option<Vec<f32>>,
    has_ext: bool,
}

impl Layer {
    fn units(&self) -> usize {
        self.shape.0 * self.shape.1
    }
}

#[derive(Debug, Clone)]
struct Projection {
    from: usize,
    to: usize,
    /// `w[i * n_to + j]` connects unit `i` of `from` with unit `j` of `to`.
    w: Vec<f32>,
    pretrained: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct HarmonyNet {
    name: String,
    /// Configured parameters; `apply_params` makes them live.
    pub params: NetParams,
    live: NetParams,
    sheets: Vec<(String, Vec<ParamSel>)>,
    layers: Vec<Layer>,
    projections: Vec<Projection>,
    cycle: usize,
    harmony: f64,
}

impl HarmonyNet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: NetParams::default(),
            live: NetParams::default(),
            sheets: vec![(BASE_SHEET.to_string(), Vec::new())],
            layers: Vec::new(),
            projections: Vec::new(),
            cycle: 0,
            harmony: 0.0,
        }
    }

    pub fn add_layer(&mut self, name: &str, role: LayerRole, rows: usize, cols: usize) -> &mut Self {
        let n = rows * cols;
        self.layers.push(Layer {
            name: name.to_string(),
            role,
            live: LiveParams::from(&self.live),
            shape: (rows, cols),
            act: vec![0.0; n],
            act_m: vec![0.0; n],
            net: vec![0.0; n],
            ext: vec![0.0; n],
            pending: None,
            has_ext: false,
        });
        self
    }

    fn layer_index(&self, name: &str) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| SimError::UnknownLayer(name.to_string()))
    }

    pub fn shape(&self, layer: &str) -> Result<(usize, usize)> {
        Ok(self.layers[self.layer_index(layer)?].shape)
    }

    /// Fully connect two layers in both directions with one shared weight matrix.
    pub fn bidir_connect(&mut self, from: &str, to: &str) -> Result<()> {
        let (a, b) = (self.layer_index(from)?, self.layer_index(to)?);
        let n = self.layers[a].units() * self.layers[b].units();
        self.projections.push(Projection {
            from: a,
            to: b,
            w: vec![self.params.wt_mean; n],
            pretrained: None,
        });
        Ok(())
    }

    /// Weights that `init_weights` loads instead of random ones.
    pub fn set_pretrained(&mut self, from: &str, to: &str, w: Vec<f32>) -> Result<()> {
        let (a, b) = (self.layer_index(from)?, self.layer_index(to)?);
        let expect = self.layers[a].units() * self.layers[b].units();
        if w.len() != expect {
            return Err(SimError::Configuration(format!(
                "{} -> {}: {} weights, expected {}",
                from,
                to,
                w.len(),
                expect
            )));
        }
        let prj = self
            .projections
            .iter_mut()
            .find(|p| p.from == a && p.to == b)
            .ok_or_else(|| SimError::Configuration(format!("no projection {} -> {}", from, to)))?;
        prj.pretrained = Some(w);
        Ok(())
    }

    /// Add or replace the sheet `name`. Takes effect on the next `apply_params`.
    pub fn add_sheet(&mut self, name: &str, sels: Vec<ParamSel>) -> Result<()> {
        if let Some(bad) = sels.iter().find(|s| s.specificity().is_none()) {
            return Err(SimError::Configuration(format!(
                "sheet {}: bad selector {:?}, want Layer or #Name",
                name, bad.sel
            )));
        }
        match self.sheets.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = sels,
            None => self.sheets.push((name.to_string(), sels)),
        }
        Ok(())
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|(n, _)| n.as_str()).collect()
    }

    fn sheet(&self, name: &str) -> Result<&[ParamSel]> {
        self.sheets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_slice())
            .ok_or_else(|| SimError::Configuration(format!("unknown param sheet: {}", name)))
    }

    /// Parameters currently in effect for `layer`.
    pub fn live_params(&self, layer: &str) -> Result<LiveParams> {
        Ok(self.layers[self.layer_index(layer)?].live)
    }

    pub fn harmony(&self) -> f64 {
        self.harmony
    }

    fn compute_harmony(&self) -> f64 {
        let mut sum = 0.0f64;
        let mut n = 0usize;
        for p in &self.projections {
            let (a, b) = (&self.layers[p.from].act, &self.layers[p.to].act);
            for (i, ai) in a.iter().enumerate() {
                let row = &p.w[i * b.len()..(i + 1) * b.len()];
                for (wij, bj) in row.iter().zip(b) {
                    sum += f64::from(ai * wij * bj);
                }
            }
            n += p.w.len();
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Network for HarmonyNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    fn layer_role(&self, layer: &str) -> Option<LayerRole> {
        self.layers.iter().find(|l| l.name == layer).map(|l| l.role)
    }

    fn set_layer_role(&mut self, layer: &str, role: LayerRole) -> Result<()> {
        let i = self.layer_index(layer)?;
        self.layers[i].role = role;
        Ok(())
    }

    fn apply_params(&mut self, sheet: &str) -> Result<()> {
        let mut sels = self.sheet(BASE_SHEET)?.to_vec();
        if !sheet.is_empty() && sheet != BASE_SHEET {
            sels.extend(self.sheet(sheet)?.iter().cloned());
        }
        self.live = self.params;
        let base = LiveParams::from(&self.live);
        for l in &mut self.layers {
            l.live = base;
        }
        // later sheets win; within a sheet, #Name wins over Layer
        let n_base = self.sheet(BASE_SHEET)?.len();
        for part in [&sels[..n_base], &sels[n_base..]] {
            for spec in 0..=1 {
                for sel in part.iter().filter(|s| s.specificity() == Some(spec)) {
                    for l in self.layers.iter_mut().filter(|l| sel.matches(&l.name)) {
                        l.live.apply(&sel.set);
                    }
                }
            }
        }
        debug!(net = %self.name, sheet, "params applied");
        Ok(())
    }

    fn init_weights(&mut self, rng: &mut Prng) {
        let (mean, var) = (self.live.wt_mean, self.live.wt_var);
        for p in &mut self.projections {
            match &p.pretrained {
                Some(w) => p.w.clone_from(w),
                None => {
                    for w in &mut p.w {
                        *w = rng.gen_range_f32(mean - var, mean + var).clamp(0.0, 1.0);
                    }
                }
            }
        }
        for l in &mut self.layers {
            l.act.fill(0.0);
            l.act_m.fill(0.0);
        }
        self.harmony = 0.0;
    }

    fn reset_context(&mut self) {
        self.cycle = 0;
    }

    fn new_state(&mut self, _mode: Mode) {
        for l in &mut self.layers {
            l.act.fill(0.0);
            l.net.fill(0.0);
        }
        self.harmony = 0.0;
    }

    fn init_ext(&mut self) {
        for l in &mut self.layers {
            l.ext.fill(0.0);
            l.pending = None;
            l.has_ext = false;
        }
    }

    fn apply_ext(&mut self, layer: &str, pattern: &[f32]) -> Result<()> {
        let i = self.layer_index(layer)?;
        let l = &mut self.layers[i];
        if pattern.len() != l.units() {
            return Err(SimError::Configuration(format!(
                "layer {}: pattern has {} values, layer has {} units",
                layer,
                pattern.len(),
                l.units()
            )));
        }
        l.pending = Some(pattern.to_vec());
        Ok(())
    }

    fn apply_exts(&mut self) {
        for l in &mut self.layers {
            if let Some(p) = l.pending.take() {
                l.ext = p;
                l.has_ext = true;
            }
        }
    }

    fn cycle(&mut self) {
        for l in &mut self.layers {
            l.net.fill(0.0);
        }
        // inputs are computed from last cycle's activations, then applied together
        let mut incoming: Vec<Vec<f32>> = self.layers.iter().map(|l| vec![0.0; l.units()]).collect();
        let mut fan_in = vec![0usize; self.layers.len()];
        for p in &self.projections {
            let (a, b) = (&self.layers[p.from].act, &self.layers[p.to].act);
            let (na, nb) = (a.len(), b.len());
            for i in 0..na {
                for j in 0..nb {
                    let w = p.w[i * nb + j];
                    incoming[p.to][j] += w * a[i] / na as f32;
                    incoming[p.from][i] += w * b[j] / nb as f32;
                }
            }
            fan_in[p.to] += 1;
            fan_in[p.from] += 1;
        }

        for (li, l) in self.layers.iter_mut().enumerate() {
            let LiveParams { gain, thr, dt } = l.live;
            let k = fan_in[li].max(1) as f32;
            for (u, net) in incoming[li].iter().enumerate() {
                l.net[u] = net / k;
            }
            if l.role == LayerRole::Input && l.has_ext {
                l.act.clone_from(&l.ext);
                continue;
            }
            for u in 0..l.act.len() {
                let target = sigmoid(gain * (l.net[u] - thr));
                l.act[u] += dt * (target - l.act[u]);
            }
        }
        self.cycle += 1;
        self.harmony = self.compute_harmony();
    }

    fn plus_phase_end(&mut self) {
        for l in &mut self.layers {
            l.act_m.clone_from(&l.act);
        }
    }

    fn layer_state(&self, layer: &str, var: &str) -> Result<Vec<f32>> {
        let l = &self.layers[self.layer_index(layer)?];
        match var {
            "Act" => Ok(l.act.clone()),
            "ActM" => Ok(l.act_m.clone()),
            "Net" => Ok(l.net.clone()),
            "Ext" => Ok(l.ext.clone()),
            _ => Err(SimError::Configuration(format!("layer {}: unknown variable {}", layer, var))),
        }
    }

    fn stat(&self, name: &str) -> Option<f64> {
        match name {
            "Harmony" => Some(self.harmony),
            "Cycle" => Some(self.cycle as f64),
            _ => None,
        }
    }
}
