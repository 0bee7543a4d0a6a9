//! Face categorization: a 16x16 cartoon face on `Input`, categorized along
//! three dimensions by `Emotion`, `Gender` and `Identity`.
//!
//! The category layers start from prototype weights (the average input of
//! each category), so the network settles into the right category without
//! any training. Presenting only the categories (`set_input(true)`) lets
//! the network fill in a face instead.

use crate::config::Config;
use crate::env::{Env, Envs, FixedTable, Table};
use crate::error::{Result, SimError};
use crate::network::{LayerRole, Network};
use crate::sim::{Model, Sim};
use crate::stats::{LayerState, Reduced};
use crate::time::{Level, Mode};

use super::harmony_net::{HarmonyNet, LayerParams, ParamSel};

pub const SIZE: usize = 16;

pub const IDENTITIES: [(&str, bool); 10] = [
    ("Alberto", false),
    ("Betty", true),
    ("Lisa", true),
    ("Mark", false),
    ("Wendy", true),
    ("Zane", false),
    ("Carl", false),
    ("Diana", true),
    ("Frank", false),
    ("Gina", true),
];

pub const CATEGORY_LAYERS: [&str; 3] = ["Emotion", "Gender", "Identity"];

/// Extra sheet: steeper category units, so ties between similar faces
/// resolve faster.
pub const SHARP_SHEET: &str = "Sharp";

pub type FacesSim = Sim<HarmonyNet, FixedTable>;

/// A face drawn into a `SIZE` x `SIZE` bitmap, row major.
/// Partial faces keep only the upper half.
pub fn face_pattern(ident: usize, female: bool, happy: bool, partial: bool) -> Vec<f32> {
    let mut px = vec![0.0f32; SIZE * SIZE];
    let mut set = |r: usize, c: usize| {
        if r < SIZE && c < SIZE {
            px[r * SIZE + c] = 1.0;
        }
    };

    // outline, wider for odd identities
    let half_w = 5 + ident % 2;
    let (c0, c1) = (8 - half_w, 7 + half_w);
    for r in 3..15 {
        set(r, c0);
        set(r, c1);
    }
    for c in c0..=c1 {
        set(15, c);
    }

    // hair: long on both sides for female faces
    let hair_rows = if female { 3..9 } else { 1..3 };
    for c in c0..=c1 {
        set(1, c);
        set(2, c);
    }
    for r in hair_rows {
        set(r, c0.saturating_sub(1));
        set(r, c1 + 1);
    }

    // eyes and brows: spacing and brow height vary by identity
    let eye_off = 2 + ident % 3;
    let (le, re) = (7 - eye_off, 8 + eye_off);
    set(6, le);
    set(6, re);
    let brow = if (ident / 3) % 2 == 0 { 4 } else { 5 };
    set(brow, le);
    set(brow, le + 1);
    set(brow, re - 1);
    set(brow, re);

    // nose length
    for r in 7..(8 + ident % 4) {
        set(r, 7);
    }

    // mouth: corners up when happy, down when sad
    for c in 5..11 {
        set(12, c);
    }
    let corner = if happy { 11 } else { 13 };
    set(corner, 4);
    set(corner, 11);

    if partial {
        for v in &mut px[SIZE * SIZE / 2..] {
            *v = 0.0;
        }
    }
    px
}

fn one_hot(n: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.0; n];
    v[i] = 1.0;
    v
}

/// One row per identity and emotion, named `<identity>_<emotion>`.
pub fn patterns(partial: bool) -> Table {
    let (name, doc) = if partial {
        ("FacesPartial", "Partial face testing patterns")
    } else {
        ("Faces", "Face testing patterns")
    };
    let mut t = Table::new(name);
    t.doc = doc.to_string();
    for (id, &(who, female)) in IDENTITIES.iter().enumerate() {
        for happy in [true, false] {
            let emotion = if happy { "happy" } else { "sad" };
            t.add_row(
                &format!("{}_{}", who, emotion),
                &[
                    ("Input", face_pattern(id, female, happy, partial)),
                    ("Emotion", one_hot(2, usize::from(!happy))),
                    ("Gender", one_hot(2, usize::from(female))),
                    ("Identity", one_hot(IDENTITIES.len(), id)),
                ],
            );
        }
    }
    t
}

/// Weights from `Input` to `layer`: for each category unit, the mean input
/// over the rows where that unit is on.
pub fn prototype_weights(table: &Table, layer: &str, units: usize) -> Result<Vec<f32>> {
    let n_in = SIZE * SIZE;
    let mut w = vec![0.0f32; n_in * units];
    let mut counts = vec![0usize; units];
    for row in &table.rows {
        let input = row
            .values
            .get("Input")
            .ok_or_else(|| SimError::Configuration(format!("row {} has no Input", row.name)))?;
        let cat = row
            .values
            .get(layer)
            .ok_or_else(|| SimError::Configuration(format!("row {} has no {}", row.name, layer)))?;
        for (j, &on) in cat.iter().enumerate().take(units) {
            if on <= 0.5 {
                continue;
            }
            counts[j] += 1;
            for (i, &x) in input.iter().enumerate().take(n_in) {
                w[i * units + j] += x;
            }
        }
    }
    for (i, wi) in w.iter_mut().enumerate() {
        let n = counts[i % units];
        if n > 0 {
            *wi /= n as f32;
        }
    }
    Ok(w)
}

pub fn build_net(name: &str, table: &Table) -> Result<HarmonyNet> {
    let mut net = HarmonyNet::new(name);
    net.add_layer("Input", LayerRole::Input, SIZE, SIZE)
        .add_layer("Emotion", LayerRole::Target, 1, 2)
        .add_layer("Gender", LayerRole::Target, 1, 2)
        .add_layer("Identity", LayerRole::Target, 1, IDENTITIES.len());
    for layer in CATEGORY_LAYERS {
        net.bidir_connect("Input", layer)?;
        let (_, units) = net.shape(layer)?;
        net.set_pretrained("Input", layer, prototype_weights(table, layer, units)?)?;
    }
    let sharp = LayerParams {
        gain: Some(12.0),
        ..LayerParams::default()
    };
    let sels = CATEGORY_LAYERS
        .iter()
        .map(|l| ParamSel::new(&format!("#{}", l), sharp))
        .collect();
    net.add_sheet(SHARP_SHEET, sels)?;
    net.apply_params("")?;
    Ok(net)
}

/// The faces simulation plus both pattern sets.
pub struct Faces {
    pub sim: FacesSim,
    full: Table,
    partial: Table,
}

impl Faces {
    pub fn new(config: Config) -> Result<Self> {
        let full = patterns(false);
        let partial = patterns(true);
        let net = build_net(&config.name, &full)?;

        let mut env = FixedTable::new(Mode::Test, full.clone());
        env.sequential = config.run.sequential;
        env.validate()?;
        let mut envs = Envs::new();
        envs.add(Mode::Test, env);

        let mut sim = Sim::new(config, net, envs)?;
        sim.add_stat(
            Reduced::new("Harmony", Level::Cycle, |m: &Model<HarmonyNet, FixedTable>| {
                m.net.stat("Harmony").ok_or_else(|| SimError::missing("net/Harmony"))
            })
            .with_range(0.0, 1.0),
        );
        sim.add_stat(LayerState::new(
            Mode::Test,
            Level::Trial,
            "Act",
            &CATEGORY_LAYERS,
            |m: &Model<HarmonyNet, FixedTable>, layer: &str, var: &str| {
                Ok(m.net.layer_state(layer, var)?.into_iter().map(f64::from).collect())
            },
        ));
        Ok(Self { sim, full, partial })
    }

    /// Bottom-up (face in, categories out) or top-down (categories in).
    pub fn set_input(&mut self, top_down: bool) -> Result<()> {
        self.sim.set_input(top_down)
    }

    /// Present full or partial faces from the next trial on.
    pub fn set_patterns(&mut self, partial: bool) -> Result<()> {
        let table = if partial { &self.partial } else { &self.full };
        let run = self.sim.state.run();
        let seed = self.sim.state.run_seed()?;
        let env = self.sim.state.model.envs.by_mode_mut(Mode::Test)?;
        env.set_table(table.clone());
        env.validate()?;
        env.init(run, seed);
        Ok(())
    }

    pub fn table(&self, partial: bool) -> &Table {
        if partial {
            &self.partial
        } else {
            &self.full
        }
    }
}
