//! The run driver: owns the network, environments, stats and loop stacks,
//! and binds them together through loop hooks.
//!
//! Hooks get `&mut SimState`; the stacks themselves live beside it in `Sim`
//! so that driving a stack and mutating the state never alias.

use std::rc::Rc;
use std::sync::mpsc::Sender;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::env::{Env, Envs};
use crate::error::Result;
use crate::looper::{Count, Counter, Hook, LoopEvent, RunState, Stacks, StopHandle};
use crate::network::{LayerRole, Network};
use crate::observer::{Display, DisplayEvent, LogFiles};
use crate::prng::{Prng, Seeds};
use crate::stats::{LoopCounters, StatEvent, StatFunc, StatRegistry, TrialName};
use crate::tensorfs::Stats;
use crate::time::{Level, Mode, Phase};

/// Everything stats may observe: read-only to stat functions.
pub struct Model<N, E> {
    pub net: N,
    pub envs: Envs<E>,
}

pub struct SimState<N, E> {
    pub config: Config,
    pub model: Model<N, E>,
    pub stats: Stats,
    pub stat_funcs: StatRegistry<Model<N, E>>,
    pub logs: LogFiles,
    pub display: Display,
    seeds: Seeds,
    rng: Prng,
    run: usize,
    env_exhausted: bool,
    /// Input and target layers as configured, for switching direction.
    bottom_up: (Vec<String>, Vec<String>),
}

impl<N: Network, E: Env> SimState<N, E> {
    /// Reseed the simulation generator for run `run`.
    pub fn init_rand_seed(&mut self, run: usize) -> Result<u64> {
        let seed = self.seeds.set(run, &mut self.rng)?;
        self.run = run;
        debug!(run, seed, "reseeded");
        Ok(seed)
    }

    pub fn rng(&mut self) -> &mut Prng {
        &mut self.rng
    }

    /// Current run index.
    pub fn run(&self) -> usize {
        self.run
    }

    /// Seed-table entry of the current run.
    pub fn run_seed(&self) -> Result<u64> {
        self.seeds.get(self.run)
    }

    /// Reset environments, time-keeping and weights for a new run.
    pub fn new_run(&mut self) -> Result<()> {
        let run = self.run;
        let seed = self.run_seed()?;
        self.model.envs.by_mode_mut(Mode::Test)?.init(run, seed);
        self.env_exhausted = false;
        self.model.net.reset_context();
        self.model.net.init_weights(&mut self.rng);
        Ok(())
    }

    /// Number of trials per epoch in `mode`, from its environment.
    pub fn trial_count(&self, mode: Mode) -> usize {
        self.model.envs.by_mode(mode).map_or(0, |e| e.num_rows())
    }

    /// Step `mode`'s environment and apply its state to every input and
    /// target layer. The trial name goes to `Current`.
    pub fn apply_inputs(&mut self, mode: Mode) -> Result<()> {
        let net = &mut self.model.net;
        let env = self.model.envs.by_mode_mut(mode)?;
        net.init_ext();
        if !env.step() {
            warn!(%mode, env = env.name(), "environment exhausted");
            self.env_exhausted = true;
        }
        self.stats
            .current(mode)
            .string_value(TrialName::NAME, 1)?
            .set_string1d(&env.trial_name(), 0);
        for layer in net.layers_by_role(&[LayerRole::Input, LayerRole::Target]) {
            match env.state(&layer) {
                Some(pattern) => net.apply_ext(&layer, pattern)?,
                None => debug!(%layer, "no pattern for layer"),
            }
        }
        net.apply_exts();
        Ok(())
    }

    /// Run every stat function for (`mode`, `level`, `phase`).
    pub fn run_stats(&mut self, mode: Mode, level: Level, phase: Phase, counters: &[Counter]) -> Result<()> {
        let ev = StatEvent {
            mode,
            level,
            phase,
            counters,
        };
        self.stat_funcs.run(&mut self.stats, &self.model, &ev)?;
        if phase == Phase::Step {
            self.display.notify(DisplayEvent::PlotUpdated { mode, level });
        }
        Ok(())
    }

    /// Entering a level starts the accumulation of the level inside it.
    fn stats_start(&mut self, ev: &LoopEvent<'_>) -> Result<()> {
        match ev.level.inner() {
            Some(inner) => self.run_stats(ev.mode, inner, Phase::Start, ev.counters),
            None => Ok(()),
        }
    }

    fn stats_step(&mut self, ev: &LoopEvent<'_>) -> Result<()> {
        if ev.level == Level::Cycle && !self.config.stats.step_cycle {
            return Ok(());
        }
        self.run_stats(ev.mode, ev.level, Phase::Step, ev.counters)?;
        self.logs.write_row(&self.stats, ev.mode, ev.level)
    }

    /// `[tag_]sheet[_NNN]`, with `NNN` the run index when it is not 0.
    pub fn format_run_name(&self, run: usize) -> String {
        let params = &self.config.params;
        let mut name = if params.sheet.is_empty() {
            "Base".to_string()
        } else {
            params.sheet.clone()
        };
        if !params.tag.is_empty() {
            name = format!("{}_{}", params.tag, name);
        }
        if run > 0 {
            name.push_str(&format!("_{:03}", run));
        }
        name
    }

    /// Compute the run name for `run` and keep it in `Current`.
    pub fn set_run_name(&mut self, run: usize) -> Result<String> {
        let name = self.format_run_name(run);
        self.stats
            .current_root()
            .string_value("RunName", 1)?
            .set_string1d(&name, 0);
        Ok(name)
    }

    pub fn run_name(&self) -> String {
        self.stats
            .get_current_root()
            .and_then(|d| d.value("RunName"))
            .ok()
            .and_then(|s| s.string1d(0))
            .unwrap_or_else(|| self.format_run_name(self.config.run.run))
    }
}

pub struct Sim<N, E> {
    pub loops: Stacks<SimState<N, E>>,
    pub state: SimState<N, E>,
}

impl<N: Network + 'static, E: Env + 'static> Sim<N, E> {
    pub fn new(config: Config, net: N, envs: Envs<E>) -> Result<Self> {
        config.validate()?;
        let seeds = Seeds::new(config.run.seed_cap, config.run.base_seed);
        let logs = LogFiles::new(config.log.dir.clone());
        let bottom_up = (
            net.layers_by_role(&[LayerRole::Input]),
            net.layers_by_role(&[LayerRole::Target]),
        );
        let start_run = config.run.run;
        let mut sim = Sim {
            loops: Stacks::new(),
            state: SimState {
                config,
                model: Model { net, envs },
                stats: Stats::new(),
                stat_funcs: StatRegistry::new(),
                logs,
                display: Display::default(),
                seeds,
                rng: Prng::new(0),
                run: 0,
                env_exhausted: false,
                bottom_up,
            },
        };
        sim.state.init_rand_seed(0)?;
        sim.apply_params()?;
        sim.config_loops()?;
        sim.config_stats();
        sim.state.set_run_name(start_run)?;
        Ok(sim)
    }

    /// Test stack: Epoch(1) > Trial(one per env row) > Cycle(configured).
    pub fn config_loops(&mut self) -> Result<()> {
        let cycles = self.state.config.run.cycles;
        let mut ls: Stacks<SimState<N, E>> = Stacks::new();
        ls.add_stack(Mode::Test, Level::Trial)
            .add_level(Level::Epoch, 1)?
            .add_level(
                Level::Trial,
                Count::dynamic(|s: &SimState<N, E>| s.trial_count(Mode::Test)),
            )?
            .add_level(Level::Cycle, cycles)?;

        ls.add_on_start_to_loop(Level::Trial, "NewState", |s, ev| {
            s.model.net.new_state(ev.mode);
            Ok(())
        });
        ls.add_on_start_to_loop(Level::Trial, "ApplyInputs", |s, ev| s.apply_inputs(ev.mode));
        ls.add_on_start_to_loop(Level::Cycle, "Cycle", |s, _| {
            s.model.net.cycle();
            Ok(())
        });
        ls.add_on_end_to_loop(Level::Trial, "PlusPhase", |s, _| {
            s.model.net.plus_phase_end();
            Ok(())
        });

        let st = ls.stack_mut(Mode::Test)?;
        st.level_mut(Level::Trial)?
            .add_is_done("EnvDone", |s: &SimState<N, E>, _| s.env_exhausted);
        let new_run: Hook<SimState<N, E>> =
            Rc::new(|s: &mut SimState<N, E>, _: &LoopEvent<'_>| s.new_run());
        st.on_init.add("NewRun", new_run);

        ls.add_on_start_to_all("StatsStart", |s, ev| s.stats_start(ev));
        ls.add_on_end_to_all("StatsStep", |s, ev| s.stats_step(ev));

        if self.state.config.debug {
            info!("loops:\n{}", ls.doc_string());
        } else {
            debug!("loops:\n{}", ls.doc_string());
        }
        self.loops = ls;
        Ok(())
    }

    /// Built-in stats. Experiments add their own with `add_stat`.
    pub fn config_stats(&mut self) {
        self.add_stat(LoopCounters::new(&[Level::Cycle]));
        self.add_stat(TrialName::new(Level::Trial));
    }

    pub fn add_stat(&mut self, f: impl StatFunc<Model<N, E>> + 'static) {
        self.state.stat_funcs.add(f);
    }

    /// Start phase for every level of every stack.
    pub fn stats_init(&mut self) -> Result<()> {
        for st in self.loops.stacks() {
            for level in st.order() {
                self.state
                    .run_stats(st.mode(), level, Phase::Start, st.counters())?;
            }
        }
        Ok(())
    }

    /// Base sheet plus the configured extra sheet, if any.
    pub fn apply_params(&mut self) -> Result<()> {
        let sheet = &self.state.config.params.sheet;
        self.state.model.net.apply_params(sheet)
    }

    /// Back to run 0 with fresh counters, stats and weights. Withdraws any
    /// pending stop request.
    pub fn init(&mut self) -> Result<()> {
        self.loops.clear_stop();
        self.loops.reset_counters();
        self.state.init_rand_seed(0)?;
        self.apply_params()?;
        self.stats_init()?;
        for mode in self.loops.modes() {
            self.loops.init(&mut self.state, mode)?;
        }
        Ok(())
    }

    pub fn run(&mut self, mode: Mode) -> Result<RunState> {
        let state = self.loops.run(&mut self.state, mode)?;
        self.state.display.notify(DisplayEvent::Stopped { mode });
        Ok(state)
    }

    pub fn step(&mut self, mode: Mode, level: Level, n: usize) -> Result<RunState> {
        let state = self.loops.step(&mut self.state, mode, level, n)?;
        self.state.display.notify(DisplayEvent::Stopped { mode });
        Ok(state)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.loops.stop_handle()
    }

    pub fn attach_display(&mut self, tx: Sender<DisplayEvent>) {
        self.state.display.attach(tx);
    }

    pub fn run_name(&self) -> String {
        self.state.run_name()
    }

    /// Drive `run_count` runs headless, starting at `run_start`, each to
    /// completion of the Test stack with its own log files.
    pub fn run_no_gui(&mut self, run_start: usize, run_count: usize) -> Result<RunState> {
        self.init()?;
        let note = &self.state.config.params.note;
        if !note.is_empty() {
            info!("Note: {}", note);
        }
        info!("Running {} Runs starting at {}", run_count, run_start);
        let net_name = self.state.model.net.name().to_string();
        let stop = self.loops.stop_handle();
        for run in run_start..run_start + run_count {
            if stop.is_stop_requested() {
                info!(run, "stop requested, not starting run");
                return Ok(RunState::Stopped);
            }
            self.state.init_rand_seed(run)?;
            self.state.new_run()?;
            let run_name = self.state.set_run_name(run)?;
            info!(run, %run_name, "run start");
            self.state.display.notify(DisplayEvent::RunStarted {
                run,
                name: run_name.clone(),
            });
            self.open_logs(&net_name, &run_name)?;
            let state = self.run(Mode::Test);
            self.state.logs.close_all()?;
            match state? {
                RunState::Done => info!(run, "run done: {}", self.loops.counters_string(Mode::Test)),
                RunState::Stopped => {
                    info!(run, "stopped at {}", self.loops.counters_string(Mode::Test));
                    return Ok(RunState::Stopped);
                }
            }
        }
        Ok(RunState::Done)
    }

    fn open_logs(&mut self, net_name: &str, run_name: &str) -> Result<()> {
        let levels = self.state.config.log.test.clone();
        let stack = self.loops.stack(Mode::Test)?;
        for level in levels {
            if !stack.has_level(level) {
                warn!(%level, "no Test level to log");
                continue;
            }
            self.state.logs.open(net_name, run_name, Mode::Test, level)?;
        }
        Ok(())
    }

    /// Drive from the category layers down to the input layer, or back.
    /// Loops and stats are untouched.
    pub fn set_input(&mut self, top_down: bool) -> Result<()> {
        let (inputs, targets) = self.state.bottom_up.clone();
        let (drive, compare) = if top_down {
            (LayerRole::Target, LayerRole::Input)
        } else {
            (LayerRole::Input, LayerRole::Target)
        };
        let net = &mut self.state.model.net;
        for layer in &inputs {
            net.set_layer_role(layer, drive)?;
        }
        for layer in &targets {
            net.set_layer_role(layer, compare)?;
        }
        Ok(())
    }

    /// Counters of `mode` plus the trial name and numeric stats in `Current`,
    /// for status lines. Missing entries are skipped.
    pub fn stat_counters(&self, mode: Mode, level: Level) -> String {
        let mut s = self.loops.counters_string(mode);
        let Ok(cur) = self.state.stats.get_current(mode) else {
            return s;
        };
        let Ok(name) = cur.value(TrialName::NAME) else {
            return s;
        };
        s.push_str(&format!("  TrialName: {}", name.string1d(0).unwrap_or_default()));
        if level == Level::Cycle {
            return s;
        }
        for (stat, series) in cur.values() {
            if !series.is_float() || Level::parse(stat).is_some() {
                continue;
            }
            if let Some(v) = series.float1d(0) {
                s.push_str(&format!("  {}: {:.4}", stat, v));
            }
        }
        s
    }
}
