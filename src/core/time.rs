//! Iteration axes: modes, levels and stats phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Looping modes. Each mode owns its own stack, counters and stats namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Test,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Train, Mode::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Train => "Train",
            Mode::Test => "Test",
        }
    }
}

/// Looping levels, innermost first. The derived ordering is the nesting depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Cycle,
    Trial,
    Epoch,
    Run,
    Expt,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Cycle,
        Level::Trial,
        Level::Epoch,
        Level::Run,
        Level::Expt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Cycle => "Cycle",
            Level::Trial => "Trial",
            Level::Epoch => "Epoch",
            Level::Run => "Run",
            Level::Expt => "Expt",
        }
    }

    /// The next level in (one step finer), or `None` for `Cycle`.
    pub fn inner(self) -> Option<Level> {
        match self {
            Level::Cycle => None,
            Level::Trial => Some(Level::Cycle),
            Level::Epoch => Some(Level::Trial),
            Level::Run => Some(Level::Epoch),
            Level::Expt => Some(Level::Run),
        }
    }

    /// The next level out, or `None` for `Expt`.
    pub fn outer(self) -> Option<Level> {
        match self {
            Level::Cycle => Some(Level::Trial),
            Level::Trial => Some(Level::Epoch),
            Level::Epoch => Some(Level::Run),
            Level::Run => Some(Level::Expt),
            Level::Expt => None,
        }
    }

    pub fn parse(s: &str) -> Option<Level> {
        Level::ALL
            .iter()
            .copied()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
    }
}

/// Phase of stats processing for a given mode and level.
/// Accumulated values are reset at `Start` and added at each `Step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Start,
    Step,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Start => f.write_str("Start"),
            Phase::Step => f.write_str("Step"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_innermost_first() {
        assert!(Level::Cycle < Level::Trial);
        assert!(Level::Trial < Level::Epoch);
        assert!(Level::Run < Level::Expt);
    }

    #[test]
    fn inner_and_outer_are_inverse() {
        for level in Level::ALL {
            if let Some(outer) = level.outer() {
                assert_eq!(outer.inner(), Some(level));
            }
        }
        assert_eq!(Level::Cycle.inner(), None);
        assert_eq!(Level::Expt.outer(), None);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Level::parse("epoch"), Some(Level::Epoch));
        assert_eq!(Level::parse("Trial"), Some(Level::Trial));
        assert_eq!(Level::parse("block"), None);
    }
}
