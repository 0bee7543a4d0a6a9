use std::fs;
use std::sync::mpsc;

use tempfile::TempDir;

use simloop::config::Config;
use simloop::env::{Envs, FixedTable};
use simloop::error::SimError;
use simloop::experiments::faces::{build_net, patterns, Faces};
use simloop::experiments::harmony_net::{HarmonyNet, BASE_SHEET};
use simloop::looper::RunState;
use simloop::network::Network;
use simloop::observer::DisplayEvent;
use simloop::sim::{Model, Sim};
use simloop::stats::Reduced;
use simloop::time::{Level, Mode};

fn trial_floats(sim: &Sim<HarmonyNet, FixedTable>, level: Level, name: &str) -> Vec<f64> {
    sim.state
        .stats
        .get_level_dir(Mode::Test, level)
        .unwrap()
        .value(name)
        .unwrap()
        .floats()
        .to_vec()
}

fn trial_names(sim: &Sim<HarmonyNet, FixedTable>) -> Vec<String> {
    sim.state
        .stats
        .get_level_dir(Mode::Test, Level::Trial)
        .unwrap()
        .value("TrialName")
        .unwrap()
        .strings()
        .to_vec()
}

#[test]
fn four_row_epoch_is_the_mean_of_its_trials() {
    let mut table = patterns(false);
    table.rows.truncate(4);
    let expected: Vec<String> = table.rows.iter().map(|r| r.name.clone()).collect();

    let net = build_net("Faces", &table).unwrap();
    let mut envs = Envs::new();
    envs.add(Mode::Test, FixedTable::new(Mode::Test, table));
    let mut cfg = Config::default();
    cfg.run.cycles = 10;
    let mut sim = Sim::new(cfg, net, envs).unwrap();
    sim.add_stat(Reduced::new("Harmony", Level::Cycle, |m: &Model<HarmonyNet, FixedTable>| {
        Ok(m.net.stat("Harmony").unwrap_or(f64::NAN))
    }));

    sim.init().unwrap();
    assert_eq!(sim.run(Mode::Test).unwrap(), RunState::Done);

    assert_eq!(trial_names(&sim), expected);
    let trials = trial_floats(&sim, Level::Trial, "Harmony");
    assert_eq!(trials.len(), 4);
    assert_eq!(trial_floats(&sim, Level::Cycle, "Harmony").len(), 10);
    let epoch = trial_floats(&sim, Level::Epoch, "Harmony");
    assert_eq!(epoch.len(), 1);
    let mean = trials.iter().sum::<f64>() / 4.0;
    assert!((epoch[0] - mean).abs() < 1e-12, "{} vs {}", epoch[0], mean);
}

#[test]
fn input_direction_does_not_change_the_stats_layout() {
    let run = |top_down: bool| {
        let mut faces = Faces::new(Config::default()).unwrap();
        faces.set_input(top_down).unwrap();
        faces.sim.init().unwrap();
        faces.sim.run(Mode::Test).unwrap();
        let paths = faces.sim.state.stats.series_paths();
        (paths, trial_names(&faces.sim).len())
    };
    let (bottom_up, n_bu) = run(false);
    let (top_down, n_td) = run(true);
    assert_eq!(bottom_up, top_down);
    assert_eq!(n_bu, 20);
    assert_eq!(n_td, 20);
    assert!(bottom_up.contains(&"Stats/Test/Trial/Emotion_Act".to_string()));
}

#[test]
fn runs_past_the_seed_table_fail() {
    let mut cfg = Config::default();
    cfg.run.cycles = 2;
    cfg.run.seed_cap = 2;
    let mut faces = Faces::new(cfg).unwrap();
    let err = faces.sim.run_no_gui(1, 2).unwrap_err();
    assert!(matches!(err, SimError::SeedExhausted { index: 2, cap: 2 }), "{}", err);
    // run 1 completed before the failure
    assert_eq!(trial_floats(&faces.sim, Level::Epoch, "Harmony").len(), 1);
}

#[test]
fn stop_mid_trial_leaves_only_completed_rows() {
    let mut faces = Faces::new(Config::default()).unwrap();
    let stop = faces.sim.stop_handle();
    let request = stop.clone();
    faces
        .sim
        .loops
        .add_on_end_to_loop(Level::Cycle, "stop", move |_, ev| {
            let trial = ev.counter(Level::Trial).map(|c| c.cur);
            let cycle = ev.counter(Level::Cycle).map(|c| c.cur);
            if trial == Some(2) && cycle == Some(5) {
                request.request_stop();
            }
            Ok(())
        });

    faces.sim.init().unwrap();
    assert_eq!(faces.sim.run(Mode::Test).unwrap(), RunState::Stopped);
    assert_eq!(trial_names(&faces.sim).len(), 2);
    assert_eq!(trial_floats(&faces.sim, Level::Trial, "Harmony").len(), 2);
    assert!(trial_floats(&faces.sim, Level::Epoch, "Harmony").is_empty());
    assert_eq!(trial_floats(&faces.sim, Level::Cycle, "Harmony").len(), 6);

    faces
        .sim
        .loops
        .stack_mut(Mode::Test)
        .unwrap()
        .level_mut(Level::Cycle)
        .unwrap()
        .on_end
        .remove("stop");
    // the request stays in effect until withdrawn
    assert_eq!(faces.sim.run(Mode::Test).unwrap(), RunState::Stopped);
    assert_eq!(trial_names(&faces.sim).len(), 2);
    stop.clear();
    assert_eq!(faces.sim.run(Mode::Test).unwrap(), RunState::Done);
    assert_eq!(trial_names(&faces.sim).len(), 20);
    assert_eq!(trial_floats(&faces.sim, Level::Epoch, "Harmony").len(), 1);
}

#[test]
fn headless_runs_write_one_log_per_run() {
    let dir = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.run.cycles = 3;
    cfg.log.dir = dir.path().to_path_buf();
    cfg.log.test = vec![Level::Epoch, Level::Trial];
    let mut faces = Faces::new(cfg).unwrap();
    let (tx, rx) = mpsc::channel();
    faces.sim.attach_display(tx);

    assert_eq!(faces.sim.run_no_gui(0, 2).unwrap(), RunState::Done);
    drop(faces);

    let trial_log = fs::read_to_string(dir.path().join("Faces_Base_TestTrial.tsv")).unwrap();
    let lines: Vec<&str> = trial_log.lines().collect();
    assert_eq!(lines.len(), 21);
    assert!(lines[0].starts_with("Epoch\tTrial\tTrialName\tHarmony"), "{}", lines[0]);
    assert!(lines[1].contains("Alberto_happy"));

    let epoch_log = fs::read_to_string(dir.path().join("Faces_Base_001_TestEpoch.tsv")).unwrap();
    assert_eq!(epoch_log.lines().count(), 2);

    let events: Vec<DisplayEvent> = rx.try_iter().collect();
    let runs: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            DisplayEvent::RunStarted { run, .. } => Some(*run),
            _ => None,
        })
        .collect();
    assert_eq!(runs, vec![0, 1]);
    assert!(events.contains(&DisplayEvent::PlotUpdated { mode: Mode::Test, level: Level::Epoch }));
}

#[test]
fn partial_patterns_replace_the_test_table() {
    let mut faces = Faces::new(Config::default()).unwrap();
    faces.set_patterns(true).unwrap();
    faces.sim.init().unwrap();
    faces.sim.step(Mode::Test, Level::Trial, 1).unwrap();
    let input = faces.sim.state.model.net.layer_state("Input", "Ext").unwrap();
    assert_eq!(input.as_slice(), faces.table(true).rows[0].values["Input"].as_slice());
    assert!(input[128..].iter().all(|&v| v == 0.0));
}

#[test]
fn stop_after_the_last_trial_ends_the_headless_pass() {
    let mut cfg = Config::default();
    cfg.run.cycles = 2;
    cfg.log.test.clear();
    let mut faces = Faces::new(cfg).unwrap();
    let stop = faces.sim.stop_handle();
    faces
        .sim
        .loops
        .add_on_end_to_loop(Level::Trial, "stop", move |s, ev| {
            if s.run() == 0 && ev.counter(Level::Trial).map(|c| c.cur) == Some(19) {
                stop.request_stop();
            }
            Ok(())
        });
    let (tx, rx) = mpsc::channel();
    faces.sim.attach_display(tx);

    assert_eq!(faces.sim.run_no_gui(0, 3).unwrap(), RunState::Stopped);
    assert_eq!(faces.sim.state.run(), 0);
    let started = rx
        .try_iter()
        .filter(|e| matches!(e, DisplayEvent::RunStarted { .. }))
        .count();
    assert_eq!(started, 1);
}

#[test]
fn configured_sheet_sharpens_the_category_layers() {
    let mut cfg = Config::default();
    cfg.params.sheet = "Sharp".into();
    let faces = Faces::new(cfg).unwrap();
    let net = &faces.sim.state.model.net;
    assert!(net.sheet_names().contains(&BASE_SHEET));
    let input = net.live_params("Input").unwrap();
    let identity = net.live_params("Identity").unwrap();
    assert!(identity.gain > input.gain, "{:?} vs {:?}", identity, input);
    assert_eq!(faces.sim.run_name(), "Sharp");

    let mut cfg = Config::default();
    cfg.params.sheet = "NoSuchSheet".into();
    assert!(matches!(Faces::new(cfg).err(), Some(SimError::Configuration(_))));
}
