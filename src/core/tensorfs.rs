//! Hierarchical, name-addressed store for stats series.
//!
//! Layout used by the simulation:
//!
//! ```text
//! Stats/
//!   Train/ Test/            one dir per mode
//!     Cycle/ Trial/ Epoch/  one dir per level, holding append-only series
//!   Current/
//!     Train/ Test/          latest value per stat, for live display
//! ```
//!
//! Directories are created on demand when writing (`dir`, `float64`, ...).
//! Reading a path that was never written (`get_dir`, `value`) is an error so
//! that consumers cannot silently read a default before the producer ran.

use hashbrown::HashMap;

use crate::error::{Result, SimError};
use crate::time::{Level, Mode};

#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Float(Vec<f64>),
    Str(Vec<String>),
}

/// A growable series of rows, each row holding `cols` cells.
/// `cols > 1` is the parallel-replica (data-parallel) dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    cols: usize,
    values: Values,
    /// Display range hint for plots.
    range: Option<(f64, f64)>,
}

impl Series {
    pub fn float(cols: usize) -> Self {
        Self {
            cols: cols.max(1),
            values: Values::Float(Vec::new()),
            range: None,
        }
    }

    pub fn string(cols: usize) -> Self {
        Self {
            cols: cols.max(1),
            values: Values::Str(Vec::new()),
            range: None,
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn set_range(&mut self, min: f64, max: f64) {
        self.range = Some((min, max));
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        self.range
    }

    pub fn is_float(&self) -> bool {
        matches!(self.values, Values::Float(_))
    }

    pub fn len(&self) -> usize {
        match &self.values {
            Values::Float(v) => v.len(),
            Values::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_rows(&self) -> usize {
        self.len() / self.cols
    }

    /// Truncate (or pad with zero values) to `rows` rows.
    pub fn set_num_rows(&mut self, rows: usize) {
        let n = rows * self.cols;
        match &mut self.values {
            Values::Float(v) => v.resize(n, 0.0),
            Values::Str(v) => v.resize(n, String::new()),
        }
    }

    /// Append one row with `value` in every column.
    pub fn append_row_float(&mut self, value: f64) {
        let cols = self.cols;
        match &mut self.values {
            Values::Float(v) => v.extend(std::iter::repeat(value).take(cols)),
            Values::Str(v) => v.extend(std::iter::repeat(fmt_float(value)).take(cols)),
        }
    }

    /// Append one row from a full slice of column values.
    pub fn append_row_floats(&mut self, row: &[f64]) -> Result<()> {
        if row.len() != self.cols {
            return Err(SimError::Configuration(format!(
                "row has {} values, series has {} columns",
                row.len(),
                self.cols
            )));
        }
        match &mut self.values {
            Values::Float(v) => v.extend_from_slice(row),
            Values::Str(v) => v.extend(row.iter().map(|x| fmt_float(*x))),
        }
        Ok(())
    }

    pub fn append_row_string(&mut self, value: &str) {
        let cols = self.cols;
        match &mut self.values {
            Values::Str(v) => v.extend(std::iter::repeat(value.to_string()).take(cols)),
            Values::Float(v) => {
                let x = value.trim().parse::<f64>().unwrap_or(f64::NAN);
                v.extend(std::iter::repeat(x).take(cols))
            }
        }
    }

    /// Set cell `i` of the first row, growing to one row if empty.
    pub fn set_float1d(&mut self, value: f64, i: usize) {
        if self.num_rows() == 0 {
            self.set_num_rows(1);
        }
        match &mut self.values {
            Values::Float(v) => {
                if let Some(cell) = v.get_mut(i) {
                    *cell = value;
                }
            }
            Values::Str(v) => {
                if let Some(cell) = v.get_mut(i) {
                    *cell = fmt_float(value);
                }
            }
        }
    }

    pub fn set_string1d(&mut self, value: &str, i: usize) {
        if self.num_rows() == 0 {
            self.set_num_rows(1);
        }
        match &mut self.values {
            Values::Str(v) => {
                if let Some(cell) = v.get_mut(i) {
                    *cell = value.to_string();
                }
            }
            Values::Float(v) => {
                if let Some(cell) = v.get_mut(i) {
                    *cell = value.trim().parse::<f64>().unwrap_or(f64::NAN);
                }
            }
        }
    }

    pub fn float1d(&self, i: usize) -> Option<f64> {
        match &self.values {
            Values::Float(v) => v.get(i).copied(),
            Values::Str(v) => v.get(i).and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn string1d(&self, i: usize) -> Option<String> {
        match &self.values {
            Values::Float(v) => v.get(i).map(|x| fmt_float(*x)),
            Values::Str(v) => v.get(i).cloned(),
        }
    }

    pub fn floats(&self) -> &[f64] {
        match &self.values {
            Values::Float(v) => v,
            Values::Str(_) => &[],
        }
    }

    pub fn strings(&self) -> &[String] {
        match &self.values {
            Values::Str(v) => v,
            Values::Float(_) => &[],
        }
    }

    /// Cells of the last row, formatted for log output.
    pub fn last_row_strings(&self) -> Vec<String> {
        let rows = self.num_rows();
        if rows == 0 {
            return vec![String::new(); self.cols];
        }
        let start = (rows - 1) * self.cols;
        (start..start + self.cols)
            .map(|i| self.string1d(i).unwrap_or_default())
            .collect()
    }
}

fn fmt_float(x: f64) -> String {
    format!("{}", x)
}

/// A directory of named subdirectories and named series.
/// Both namespaces keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct Dir {
    path: String,
    dirs: Vec<Dir>,
    dir_index: HashMap<String, usize>,
    values: Vec<(String, Series)>,
    value_index: HashMap<String, usize>,
}

impl Dir {
    pub fn new(name: &str) -> Self {
        Self {
            path: name.to_string(),
            ..Self::default()
        }
    }

    /// Slash-separated path from the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Subdirectory `name`, created if missing.
    pub fn dir(&mut self, name: &str) -> &mut Dir {
        let idx = match self.dir_index.get(name) {
            Some(&idx) => idx,
            None => {
                let idx = self.dirs.len();
                self.dirs.push(Dir::new(&format!("{}/{}", self.path, name)));
                self.dir_index.insert(name.to_string(), idx);
                idx
            }
        };
        &mut self.dirs[idx]
    }

    /// Walk (and create) a path of subdirectories.
    pub fn dir_path(&mut self, path: &[&str]) -> &mut Dir {
        let mut dir = self;
        for name in path {
            dir = dir.dir(name);
        }
        dir
    }

    pub fn get_dir(&self, name: &str) -> Result<&Dir> {
        self.dir_index
            .get(name)
            .map(|&idx| &self.dirs[idx])
            .ok_or_else(|| SimError::missing(format!("{}/{}", self.path, name)))
    }

    pub fn get_dir_mut(&mut self, name: &str) -> Result<&mut Dir> {
        match self.dir_index.get(name) {
            Some(&idx) => Ok(&mut self.dirs[idx]),
            None => Err(SimError::missing(format!("{}/{}", self.path, name))),
        }
    }

    pub fn has_dir(&self, name: &str) -> bool {
        self.dir_index.contains_key(name)
    }

    /// Float series `name`, created with `cols` columns if missing.
    /// Fails if `name` already holds strings.
    pub fn float64(&mut self, name: &str, cols: usize) -> Result<&mut Series> {
        self.series(name, "float", || Series::float(cols), Series::is_float)
    }

    /// String series `name`, created with `cols` columns if missing.
    /// Fails if `name` already holds floats.
    pub fn string_value(&mut self, name: &str, cols: usize) -> Result<&mut Series> {
        self.series(name, "string", || Series::string(cols), |s| !s.is_float())
    }

    fn series(
        &mut self,
        name: &str,
        expected: &'static str,
        make: impl FnOnce() -> Series,
        same_type: impl FnOnce(&Series) -> bool,
    ) -> Result<&mut Series> {
        match self.value_index.get(name) {
            Some(&idx) => {
                if !same_type(&self.values[idx].1) {
                    return Err(SimError::SeriesType {
                        path: format!("{}/{}", self.path, name),
                        expected,
                    });
                }
                Ok(&mut self.values[idx].1)
            }
            None => {
                let idx = self.values.len();
                self.values.push((name.to_string(), make()));
                self.value_index.insert(name.to_string(), idx);
                Ok(&mut self.values[idx].1)
            }
        }
    }

    pub fn value(&self, name: &str) -> Result<&Series> {
        self.value_index
            .get(name)
            .map(|&idx| &self.values[idx].1)
            .ok_or_else(|| SimError::missing(format!("{}/{}", self.path, name)))
    }

    pub fn value_mut(&mut self, name: &str) -> Result<&mut Series> {
        match self.value_index.get(name) {
            Some(&idx) => Ok(&mut self.values[idx].1),
            None => Err(SimError::missing(format!("{}/{}", self.path, name))),
        }
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.value_index.contains_key(name)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Series)> {
        self.values.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn dirs(&self) -> impl Iterator<Item = &Dir> {
        self.dirs.iter()
    }

    /// Full paths of every series below this dir, depth first.
    pub fn series_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        for (name, _) in &self.values {
            out.push(format!("{}/{}", self.path, name));
        }
        for dir in &self.dirs {
            dir.collect_paths(out);
        }
    }
}

/// The stats root: per-mode/per-level series plus the `Current` cache.
#[derive(Debug, Clone)]
pub struct Stats {
    root: Dir,
}

pub const CURRENT: &str = "Current";

impl Stats {
    pub fn new() -> Self {
        let mut root = Dir::new("Stats");
        root.dir(CURRENT);
        Self { root }
    }

    pub fn root(&self) -> &Dir {
        &self.root
    }

    /// `Stats/<mode>/<level>`, created if missing.
    pub fn level_dir(&mut self, mode: Mode, level: Level) -> &mut Dir {
        self.root.dir_path(&[mode.as_str(), level.as_str()])
    }

    pub fn get_level_dir(&self, mode: Mode, level: Level) -> Result<&Dir> {
        self.root.get_dir(mode.as_str())?.get_dir(level.as_str())
    }

    /// `Stats/Current/<mode>`, created if missing.
    pub fn current(&mut self, mode: Mode) -> &mut Dir {
        self.root.dir_path(&[CURRENT, mode.as_str()])
    }

    pub fn get_current(&self, mode: Mode) -> Result<&Dir> {
        self.root.get_dir(CURRENT)?.get_dir(mode.as_str())
    }

    /// `Stats/Current`, for values that are not tied to a mode (e.g. run name).
    pub fn current_root(&mut self) -> &mut Dir {
        self.root.dir(CURRENT)
    }

    pub fn get_current_root(&self) -> Result<&Dir> {
        self.root.get_dir(CURRENT)
    }

    /// Every series path outside of `Current`, sorted.
    pub fn series_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .root
            .dirs()
            .filter(|d| d.name() != CURRENT)
            .flat_map(|d| d.series_paths())
            .collect();
        out.sort();
        out
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_auto_creates_and_get_dir_does_not() {
        let mut root = Dir::new("Root");
        assert!(root.get_dir("Stats").is_err());
        root.dir_path(&["Stats", "Test"]);
        let test = root.get_dir("Stats").unwrap().get_dir("Test").unwrap();
        assert_eq!(test.path(), "Root/Stats/Test");
        assert_eq!(test.name(), "Test");
    }

    #[test]
    fn reading_missing_series_is_an_error() {
        let dir = Dir::new("Stats");
        match dir.value("Harmony") {
            Err(SimError::MissingSeries { path }) => assert_eq!(path, "Stats/Harmony"),
            other => panic!("expected MissingSeries, got {:?}", other),
        }
    }

    #[test]
    fn truncate_is_idempotent() {
        let mut dir = Dir::new("Trial");
        let s = dir.float64("Harmony", 1).unwrap();
        for i in 0..5 {
            s.append_row_float(i as f64);
        }
        s.set_num_rows(0);
        let once = s.clone();
        s.set_num_rows(0);
        assert_eq!(*s, once);
        assert_eq!(s.num_rows(), 0);
    }

    #[test]
    fn replica_columns_form_rows() {
        let mut s = Series::float(3);
        s.append_row_floats(&[1.0, 2.0, 3.0]).unwrap();
        s.append_row_float(4.0);
        assert_eq!(s.num_rows(), 2);
        assert_eq!(s.floats(), &[1.0, 2.0, 3.0, 4.0, 4.0, 4.0]);
        assert!(s.append_row_floats(&[1.0]).is_err());
        assert_eq!(s.last_row_strings(), vec!["4", "4", "4"]);
    }

    #[test]
    fn entries_keep_insertion_order() {
        let mut dir = Dir::new("Trial");
        dir.string_value("TrialName", 1).unwrap();
        dir.float64("Harmony", 1).unwrap();
        dir.float64("Epoch", 1).unwrap();
        let names: Vec<&str> = dir.values().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["TrialName", "Harmony", "Epoch"]);
    }

    #[test]
    fn current_cell_overwrites() {
        let mut stats = Stats::new();
        stats.current(Mode::Test).float64("Harmony", 1).unwrap().set_float1d(0.5, 0);
        stats.current(Mode::Test).float64("Harmony", 1).unwrap().set_float1d(0.7, 0);
        let cur = stats.get_current(Mode::Test).unwrap().value("Harmony").unwrap();
        assert_eq!(cur.num_rows(), 1);
        assert_eq!(cur.float1d(0), Some(0.7));
    }

    #[test]
    fn series_paths_skip_current() {
        let mut stats = Stats::new();
        stats.level_dir(Mode::Test, Level::Trial).float64("Harmony", 1).unwrap();
        stats.current(Mode::Test).float64("Harmony", 1).unwrap();
        assert_eq!(stats.series_paths(), vec!["Stats/Test/Trial/Harmony"]);
    }

    #[test]
    fn type_clash_is_an_error_and_keeps_the_data() {
        let mut dir = Dir::new("Stats/Test/Trial");
        dir.string_value("TrialName", 1).unwrap().append_row_string("Betty_sad");
        match dir.float64("TrialName", 1) {
            Err(SimError::SeriesType { path, expected }) => {
                assert_eq!(path, "Stats/Test/Trial/TrialName");
                assert_eq!(expected, "float");
            }
            other => panic!("expected SeriesType, got {:?}", other.map(|s| s.num_rows())),
        }
        assert_eq!(dir.value("TrialName").unwrap().strings(), &["Betty_sad".to_string()]);

        dir.float64("Harmony", 1).unwrap().append_row_float(0.5);
        assert!(dir.string_value("Harmony", 1).is_err());
        assert_eq!(dir.value("Harmony").unwrap().floats(), &[0.5]);
    }
}
