//! Environments: where trial inputs come from.
//!
//! The scheduler consumes an environment once per trial: `step` to advance,
//! then `state` per layer to fetch the pattern to apply.

use std::io::Read;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::prng::Prng;
use crate::time::Mode;

pub trait Env {
    /// Environment name, conventionally the mode it serves.
    fn name(&self) -> &str;

    /// Reset to the start of run `run`. `seed` is that run's entry in the
    /// seed table; any randomness in the environment derives from it.
    fn init(&mut self, run: usize, seed: u64);

    /// Advance to the next state. Returns false when no further state exists.
    fn step(&mut self) -> bool;

    /// Pattern for a named element (usually a layer), if the current state has one.
    fn state(&self, element: &str) -> Option<&[f32]>;

    /// Number of distinct states per pass; sizes the trial level.
    fn num_rows(&self) -> usize;

    /// Name of the current state, e.g. the trial name of a table row.
    fn trial_name(&self) -> String;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub name: String,
    pub values: HashMap<String, Vec<f32>>,
}

/// In-memory pattern table: named rows, each a set of named patterns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub doc: String,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_json_reader(reader: impl Read) -> Result<Table> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn add_row(&mut self, name: &str, values: &[(&str, Vec<f32>)]) {
        self.rows.push(Row {
            name: name.to_string(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Presents the rows of a table, one per step, either in order or permuted
/// anew on each pass.
#[derive(Debug, Clone)]
pub struct FixedTable {
    name: String,
    table: Table,
    pub sequential: bool,
    /// Stop after this many passes through the table.
    pub max_passes: Option<usize>,
    order: Vec<usize>,
    pos: Option<usize>,
    passes: usize,
    rng: Prng,
}

impl FixedTable {
    pub fn new(mode: Mode, table: Table) -> Self {
        let n = table.num_rows();
        Self {
            name: mode.to_string(),
            table,
            sequential: true,
            max_passes: None,
            order: (0..n).collect(),
            pos: None,
            passes: 0,
            rng: Prng::new(0x7AB1E),
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Swap in a new table; takes effect from the next `init`.
    pub fn set_table(&mut self, table: Table) {
        self.table = table;
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.rows.is_empty() {
            return Err(SimError::Configuration(format!(
                "env {}: table {} has no rows",
                self.name, self.table.name
            )));
        }
        Ok(())
    }

    /// Current row index into the table, if stepped.
    pub fn row_index(&self) -> Option<usize> {
        self.pos.and_then(|p| self.order.get(p).copied())
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    fn new_order(&mut self) {
        self.order = (0..self.table.num_rows()).collect();
        if !self.sequential {
            self.rng.shuffle(&mut self.order);
        }
    }
}

impl Env for FixedTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _run: usize, seed: u64) {
        // offset so the order does not replay the simulation generator
        self.rng.reseed(seed ^ 0x7AB1E);
        self.pos = None;
        self.passes = 0;
        self.new_order();
    }

    fn step(&mut self) -> bool {
        let n = self.order.len();
        if n == 0 {
            return false;
        }
        let next = self.pos.map_or(0, |p| p + 1);
        if next < n {
            self.pos = Some(next);
            return true;
        }
        self.passes += 1;
        if self.max_passes.is_some_and(|max| self.passes >= max) {
            return false;
        }
        self.new_order();
        self.pos = Some(0);
        true
    }

    fn state(&self, element: &str) -> Option<&[f32]> {
        let row = self.table.rows.get(self.row_index()?)?;
        row.values.get(element).map(|v| v.as_slice())
    }

    fn num_rows(&self) -> usize {
        self.table.num_rows()
    }

    fn trial_name(&self) -> String {
        self.row_index()
            .and_then(|i| self.table.rows.get(i))
            .map(|r| r.name.clone())
            .unwrap_or_default()
    }
}

/// Environments keyed by mode.
pub struct Envs<E> {
    envs: Vec<(Mode, E)>,
}

impl<E: Env> Envs<E> {
    pub fn new() -> Self {
        Self { envs: Vec::new() }
    }

    /// Add (or replace) the env for `mode`.
    pub fn add(&mut self, mode: Mode, env: E) {
        self.envs.retain(|(m, _)| *m != mode);
        self.envs.push((mode, env));
    }

    pub fn by_mode(&self, mode: Mode) -> Result<&E> {
        self.envs
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, e)| e)
            .ok_or_else(|| SimError::Configuration(format!("no environment for mode {}", mode)))
    }

    pub fn by_mode_mut(&mut self, mode: Mode) -> Result<&mut E> {
        self.envs
            .iter_mut()
            .find(|(m, _)| *m == mode)
            .map(|(_, e)| e)
            .ok_or_else(|| SimError::Configuration(format!("no environment for mode {}", mode)))
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }
}

impl<E: Env> Default for Envs<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> Table {
        let mut t = Table::new("Faces");
        for i in 0..n {
            t.add_row(&format!("row{}", i), &[("Input", vec![i as f32])]);
        }
        t
    }

    #[test]
    fn sequential_table_steps_in_row_order_and_wraps() {
        let mut env = FixedTable::new(Mode::Test, table(3));
        env.init(0, 1);
        let mut names = Vec::new();
        for _ in 0..4 {
            assert!(env.step());
            names.push(env.trial_name());
        }
        assert_eq!(names, vec!["row0", "row1", "row2", "row0"]);
        assert_eq!(env.passes(), 1);
        assert_eq!(env.state("Input"), Some(&[0.0f32][..]));
        assert_eq!(env.state("Emotion"), None);
    }

    #[test]
    fn max_passes_exhausts() {
        let mut env = FixedTable::new(Mode::Test, table(2));
        env.max_passes = Some(1);
        env.init(0, 1);
        assert!(env.step());
        assert!(env.step());
        assert!(!env.step());
    }

    #[test]
    fn permuted_pass_covers_every_row() {
        let mut env = FixedTable::new(Mode::Train, table(6));
        env.sequential = false;
        env.init(3, 7);
        let mut seen: Vec<String> = (0..6)
            .map(|_| {
                env.step();
                env.trial_name()
            })
            .collect();
        seen.sort();
        assert_eq!(seen, (0..6).map(|i| format!("row{}", i)).collect::<Vec<_>>());
    }

    #[test]
    fn permutation_follows_the_seed_not_the_run_index() {
        let order = |run: usize, seed: u64| {
            let mut env = FixedTable::new(Mode::Test, table(20));
            env.sequential = false;
            env.init(run, seed);
            (0..20)
                .map(|_| {
                    env.step();
                    env.trial_name()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(order(0, 11), order(5, 11));
        assert_ne!(order(0, 11), order(0, 12));
    }

    #[test]
    fn empty_table_fails_validation() {
        let env = FixedTable::new(Mode::Test, Table::new("Empty"));
        assert!(env.validate().is_err());
    }

    #[test]
    fn table_reads_from_json() {
        let json = r#"{"name":"Mini","rows":[{"name":"a","values":{"Input":[1.0,0.0]}}]}"#;
        let t = Table::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(t.num_rows(), 1);
        assert_eq!(t.rows[0].values["Input"], vec![1.0, 0.0]);
    }
}
