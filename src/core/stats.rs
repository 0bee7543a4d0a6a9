//! Stat functions and the registry that runs them at level boundaries.
//!
//! Every stat is called with a phase:
//! - `Start` when a level is (re)entered: reset the series it owns.
//! - `Step` when one iteration of a level ends: compute a value, write it to
//!   `Current`, append it to the level's series.
//!
//! Above the level where a stat is observed directly, its value at level `L`
//! is the reduction of the level `L-1` series accumulated since that level's
//! last `Start`. One stat body therefore serves every level of a stack.

use tracing::trace;

use crate::error::{Result, SimError};
use crate::looper::Counter;
use crate::tensorfs::Stats;
use crate::time::{Level, Mode, Phase};

#[derive(Debug, Clone, Copy)]
pub struct StatEvent<'a> {
    pub mode: Mode,
    pub level: Level,
    pub phase: Phase,
    pub counters: &'a [Counter],
}

/// How an inner level's series collapses into one outer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
    Last,
}

impl Reduction {
    /// Reduce `xs`. Empty input gives `NaN`, except `Sum` which gives 0.
    pub fn apply(self, xs: &[f64]) -> f64 {
        if xs.is_empty() {
            return match self {
                Reduction::Sum => 0.0,
                _ => f64::NAN,
            };
        }
        match self {
            Reduction::Mean => xs.iter().sum::<f64>() / xs.len() as f64,
            Reduction::Sum => xs.iter().sum(),
            Reduction::Min => xs.iter().copied().fold(f64::INFINITY, f64::min),
            Reduction::Max => xs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reduction::Last => xs[xs.len() - 1],
        }
    }
}

/// A statistic computed at level boundaries.
///
/// `O` is the live observation source (network, environment, ...), read-only
/// to stats. All writes go to `Stats`.
pub trait StatFunc<O: ?Sized> {
    fn name(&self) -> &str;

    /// Level whose series named `self.name()` must exist before stepping
    /// `level`. `None` when the value at `level` comes from live observations.
    fn source(&self, _level: Level) -> Option<Level> {
        None
    }

    fn start(&mut self, stats: &mut Stats, obs: &O, ev: &StatEvent<'_>) -> Result<()>;

    fn step(&mut self, stats: &mut Stats, obs: &O, ev: &StatEvent<'_>) -> Result<()>;
}

/// Ordered stat functions, run in registration order.
pub struct StatRegistry<O: ?Sized> {
    funcs: Vec<Box<dyn StatFunc<O>>>,
}

impl<O: ?Sized> StatRegistry<O> {
    pub fn new() -> Self {
        Self { funcs: Vec::new() }
    }

    pub fn add(&mut self, f: impl StatFunc<O> + 'static) {
        self.funcs.push(Box::new(f));
    }

    pub fn names(&self) -> Vec<&str> {
        self.funcs.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Run every stat for `ev`. The first failure aborts, wrapped with the
    /// mode, level, phase and stat name it came from.
    pub fn run(&mut self, stats: &mut Stats, obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        trace!(mode = %ev.mode, level = %ev.level, phase = %ev.phase, "run stats");
        for f in &mut self.funcs {
            let res = match ev.phase {
                Phase::Start => f.start(stats, obs, ev),
                Phase::Step => check_source(stats, &**f, ev).and_then(|_| f.step(stats, obs, ev)),
            };
            res.map_err(|e| SimError::Stat {
                mode: ev.mode,
                level: ev.level,
                phase: ev.phase,
                stat: f.name().to_string(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }
}

impl<O: ?Sized> Default for StatRegistry<O> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_source<O: ?Sized>(stats: &Stats, f: &dyn StatFunc<O>, ev: &StatEvent<'_>) -> Result<()> {
    if let Some(src) = f.source(ev.level) {
        stats.get_level_dir(ev.mode, src)?.value(f.name())?;
    }
    Ok(())
}

/// Numeric stat observed live at one level and reduced at every level above.
pub struct Reduced<O: ?Sized> {
    name: String,
    live_level: Level,
    reduction: Reduction,
    range: Option<(f64, f64)>,
    read: Box<dyn Fn(&O) -> Result<f64>>,
}

impl<O: ?Sized> Reduced<O> {
    pub fn new(name: &str, live_level: Level, read: impl Fn(&O) -> Result<f64> + 'static) -> Self {
        Self {
            name: name.to_string(),
            live_level,
            reduction: Reduction::Mean,
            range: None,
            read: Box::new(read),
        }
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }
}

impl<O: ?Sized> StatFunc<O> for Reduced<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self, level: Level) -> Option<Level> {
        if level > self.live_level {
            level.inner()
        } else {
            None
        }
    }

    fn start(&mut self, stats: &mut Stats, _obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        if ev.level < self.live_level {
            return Ok(());
        }
        let tsr = stats.level_dir(ev.mode, ev.level).float64(&self.name, 1)?;
        tsr.set_num_rows(0);
        if let Some((min, max)) = self.range {
            tsr.set_range(min, max);
        }
        Ok(())
    }

    fn step(&mut self, stats: &mut Stats, obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        let value = match self.source(ev.level) {
            Some(src) => {
                let sub = stats.get_level_dir(ev.mode, src)?.value(&self.name)?;
                self.reduction.apply(sub.floats())
            }
            None if ev.level == self.live_level => (self.read)(obs)?,
            None => return Ok(()),
        };
        stats
            .current(ev.mode)
            .float64(&self.name, 1)?
            .set_float1d(value, 0);
        stats
            .level_dir(ev.mode, ev.level)
            .float64(&self.name, 1)?
            .append_row_float(value);
        Ok(())
    }
}

/// Records the stack counters of every level at or above the stepped level,
/// one series per counter (named after the level).
pub struct LoopCounters {
    exclude: Vec<Level>,
}

impl LoopCounters {
    pub fn new(exclude: &[Level]) -> Self {
        Self {
            exclude: exclude.to_vec(),
        }
    }

    fn recorded<'a>(&'a self, ev: &StatEvent<'a>) -> impl Iterator<Item = &'a Counter> + 'a {
        let level = ev.level;
        ev.counters
            .iter()
            .filter(move |c| c.level >= level && !self.exclude.contains(&c.level))
    }
}

impl<O: ?Sized> StatFunc<O> for LoopCounters {
    fn name(&self) -> &str {
        "LoopCounters"
    }

    fn start(&mut self, stats: &mut Stats, _obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        for c in self.recorded(ev) {
            stats
                .level_dir(ev.mode, ev.level)
                .float64(c.level.as_str(), 1)?
                .set_num_rows(0);
        }
        Ok(())
    }

    fn step(&mut self, stats: &mut Stats, _obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        for c in self.recorded(ev) {
            let value = c.cur as f64;
            stats
                .current(ev.mode)
                .float64(c.level.as_str(), 1)?
                .set_float1d(value, 0);
            stats
                .level_dir(ev.mode, ev.level)
                .float64(c.level.as_str(), 1)?
                .append_row_float(value);
        }
        Ok(())
    }
}

/// Copies the `TrialName` that input application left in `Current` into the
/// trial-level series.
pub struct TrialName {
    trial_level: Level,
}

impl TrialName {
    pub const NAME: &'static str = "TrialName";

    pub fn new(trial_level: Level) -> Self {
        Self { trial_level }
    }
}

impl<O: ?Sized> StatFunc<O> for TrialName {
    fn name(&self) -> &str {
        TrialName::NAME
    }

    fn start(&mut self, stats: &mut Stats, _obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        if ev.level == self.trial_level {
            stats
                .level_dir(ev.mode, ev.level)
                .string_value(TrialName::NAME, 1)?
                .set_num_rows(0);
        }
        Ok(())
    }

    fn step(&mut self, stats: &mut Stats, _obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        if ev.level != self.trial_level {
            return Ok(());
        }
        let name = stats
            .get_current(ev.mode)?
            .value(TrialName::NAME)?
            .string1d(0)
            .unwrap_or_default();
        stats
            .level_dir(ev.mode, ev.level)
            .string_value(TrialName::NAME, 1)?
            .append_row_string(&name);
        Ok(())
    }
}

/// Per-iteration snapshot of a variable over each named layer, for one
/// mode and level. Series are named `<layer>_<var>`, one column per unit.
pub struct LayerState<O: ?Sized> {
    mode: Mode,
    level: Level,
    var: String,
    layers: Vec<String>,
    read: Box<dyn Fn(&O, &str, &str) -> Result<Vec<f64>>>,
}

impl<O: ?Sized> LayerState<O> {
    pub fn new(
        mode: Mode,
        level: Level,
        var: &str,
        layers: &[&str],
        read: impl Fn(&O, &str, &str) -> Result<Vec<f64>> + 'static,
    ) -> Self {
        Self {
            mode,
            level,
            var: var.to_string(),
            layers: layers.iter().map(|s| s.to_string()).collect(),
            read: Box::new(read),
        }
    }

    fn series_name(&self, layer: &str) -> String {
        format!("{}_{}", layer, self.var)
    }
}

impl<O: ?Sized> StatFunc<O> for LayerState<O> {
    fn name(&self) -> &str {
        "LayerState"
    }

    fn start(&mut self, stats: &mut Stats, _obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        if ev.mode != self.mode || ev.level != self.level {
            return Ok(());
        }
        for layer in &self.layers {
            let name = self.series_name(layer);
            if let Ok(tsr) = stats.level_dir(ev.mode, ev.level).value_mut(&name) {
                tsr.set_num_rows(0);
            }
        }
        Ok(())
    }

    fn step(&mut self, stats: &mut Stats, obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        if ev.mode != self.mode || ev.level != self.level {
            return Ok(());
        }
        for layer in &self.layers {
            let row = (self.read)(obs, layer, &self.var)?;
            let name = self.series_name(layer);
            stats
                .level_dir(ev.mode, ev.level)
                .float64(&name, row.len())?
                .append_row_floats(&row)?;
        }
        Ok(())
    }
}

/// Ad-hoc stat from a closure that handles both phases itself.
pub struct FnStat<O: ?Sized> {
    name: String,
    source: Option<Level>,
    f: Box<dyn FnMut(&mut Stats, &O, &StatEvent<'_>) -> Result<()>>,
}

impl<O: ?Sized> FnStat<O> {
    pub fn new(name: &str, f: impl FnMut(&mut Stats, &O, &StatEvent<'_>) -> Result<()> + 'static) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            f: Box::new(f),
        }
    }

    /// Declare that stepping any level above `level` reads this stat's series at
    /// the next level in.
    pub fn reducing_above(mut self, level: Level) -> Self {
        self.source = Some(level);
        self
    }
}

impl<O: ?Sized> StatFunc<O> for FnStat<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self, level: Level) -> Option<Level> {
        match self.source {
            Some(base) if level > base => level.inner(),
            _ => None,
        }
    }

    fn start(&mut self, stats: &mut Stats, obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        (self.f)(stats, obs, ev)
    }

    fn step(&mut self, stats: &mut Stats, obs: &O, ev: &StatEvent<'_>) -> Result<()> {
        (self.f)(stats, obs, ev)
    }
}
