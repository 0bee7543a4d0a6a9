use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use tracing::{info, warn};

use crate::error::Result;
use crate::tensorfs::Stats;
use crate::time::{Level, Mode};

/// Notification that something a display may be showing has changed.
///
/// Observers cannot reach back into the simulation; they only ever receive
/// these and then read whatever snapshot they keep themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    /// A level's series gained a row.
    PlotUpdated { mode: Mode, level: Level },
    RunStarted { run: usize, name: String },
    /// A stack finished or was stopped.
    Stopped { mode: Mode },
}

/// Optional, one-directional display channel.
#[derive(Debug, Default)]
pub struct Display {
    tx: Option<Sender<DisplayEvent>>,
}

impl Display {
    pub fn attach(&mut self, tx: Sender<DisplayEvent>) {
        self.tx = Some(tx);
    }

    pub fn detach(&mut self) {
        self.tx = None;
    }

    pub fn is_attached(&self) -> bool {
        self.tx.is_some()
    }

    /// Send `ev` if a display is attached. A hung-up receiver detaches it.
    pub fn notify(&mut self, ev: DisplayEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(ev).is_err() {
                self.tx = None;
            }
        }
    }
}

struct LogFile {
    mode: Mode,
    level: Level,
    path: PathBuf,
    out: BufWriter<File>,
    /// Series names and widths, fixed by the first row written.
    columns: Option<Vec<(String, usize)>>,
}

impl LogFile {
    fn write_row(&mut self, stats: &Stats) -> Result<()> {
        let Ok(dir) = stats.get_level_dir(self.mode, self.level) else {
            return Ok(());
        };
        if self.columns.is_none() {
            let cols: Vec<(String, usize)> = dir
                .values()
                .map(|(name, s)| (name.to_string(), s.cols()))
                .collect();
            let mut header = Vec::new();
            for (name, n) in &cols {
                if *n == 1 {
                    header.push(name.clone());
                } else {
                    header.extend((0..*n).map(|i| format!("{}[{}]", name, i)));
                }
            }
            writeln!(self.out, "{}", header.join("\t"))?;
            self.columns = Some(cols);
        }
        let mut cells = Vec::new();
        for (name, n) in self.columns.iter().flatten() {
            match dir.value(name) {
                Ok(s) => cells.extend(s.last_row_strings()),
                Err(_) => cells.extend(std::iter::repeat(String::new()).take(*n)),
            }
        }
        writeln!(self.out, "{}", cells.join("\t"))?;
        Ok(())
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!(path = %self.path.display(), "log flush failed: {}", e);
        }
    }
}

/// Tab-separated log files, one per (mode, level), each receiving the last
/// row of that level's series after every Step.
pub struct LogFiles {
    dir: PathBuf,
    files: Vec<LogFile>,
}

impl LogFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(net: &str, run: &str, mode: Mode, level: Level) -> String {
        format!("{}_{}_{}{}.tsv", net, run, mode, level)
    }

    /// Open (truncating) the log for `mode`/`level`, replacing any open one.
    pub fn open(&mut self, net: &str, run: &str, mode: Mode, level: Level) -> Result<PathBuf> {
        self.close(mode, level)?;
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(net, run, mode, level));
        let out = BufWriter::new(File::create(&path)?);
        info!(path = %path.display(), "saving log");
        self.files.push(LogFile {
            mode,
            level,
            path: path.clone(),
            out,
            columns: None,
        });
        Ok(path)
    }

    pub fn is_open(&self, mode: Mode, level: Level) -> bool {
        self.files.iter().any(|f| f.mode == mode && f.level == level)
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }

    /// Append the latest row of `mode`/`level` if that log is open.
    pub fn write_row(&mut self, stats: &Stats, mode: Mode, level: Level) -> Result<()> {
        match self.files.iter_mut().find(|f| f.mode == mode && f.level == level) {
            Some(f) => f.write_row(stats),
            None => Ok(()),
        }
    }

    pub fn close(&mut self, mode: Mode, level: Level) -> Result<()> {
        if let Some(i) = self.files.iter().position(|f| f.mode == mode && f.level == level) {
            let mut f = self.files.remove(i);
            f.out.flush()?;
        }
        Ok(())
    }

    pub fn close_all(&mut self) -> Result<()> {
        for mut f in self.files.drain(..) {
            f.out.flush()?;
        }
        Ok(())
    }
}
