//! Nested control loops ("stacks") driven odometer style.
//!
//! A stack is an ordered list of levels for one mode, outermost first, each
//! with a counter. One iteration of the innermost level is the unit of work:
//!
//! - levels not currently inside an iteration are entered outermost first,
//!   firing their `on_start` hooks;
//! - when the innermost iteration ends its `on_end` hooks fire, the counter
//!   increments, and if it overflowed the next level out also ends, and so on.
//!
//! The context type `C` is whatever the hooks need mutable access to; the
//! stacks only hand it through.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SimError};
use crate::time::{Level, Mode};

pub type Hook<C> = Rc<dyn Fn(&mut C, &LoopEvent<'_>) -> Result<()>>;
pub type DoneFn<C> = Rc<dyn Fn(&C, &LoopEvent<'_>) -> bool>;
pub type CountFn<C> = Rc<dyn Fn(&C) -> usize>;

/// What a hook gets to see: where in the stack it was fired from.
#[derive(Debug, Clone, Copy)]
pub struct LoopEvent<'a> {
    pub mode: Mode,
    pub level: Level,
    pub counters: &'a [Counter],
}

impl LoopEvent<'_> {
    pub fn counter(&self, level: Level) -> Option<&Counter> {
        self.counters.iter().find(|c| c.level == level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub level: Level,
    pub cur: usize,
    max: Option<usize>,
}

impl Counter {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            cur: 0,
            max: None,
        }
    }

    /// Max for the current pass, 0 if not resolved yet.
    pub fn max(&self) -> usize {
        self.max.unwrap_or(0)
    }

    /// Start at `cur` and stop after `n` more iterations.
    pub fn set_cur_max_plus_n(&mut self, cur: usize, n: usize) {
        self.cur = cur;
        self.max = Some(cur + n);
    }

    fn reset(&mut self) {
        self.cur = 0;
        self.max = None;
    }
}

/// How many iterations a level runs.
pub enum Count<C> {
    Fixed(usize),
    /// Evaluated each time the level is entered with a fresh counter.
    Dynamic(CountFn<C>),
}

impl<C> Count<C> {
    pub fn dynamic(f: impl Fn(&C) -> usize + 'static) -> Self {
        Count::Dynamic(Rc::new(f))
    }
}

impl<C> From<usize> for Count<C> {
    fn from(n: usize) -> Self {
        Count::Fixed(n)
    }
}

/// Named, ordered callbacks. Adding an existing name replaces it in place.
pub struct Hooks<C> {
    hooks: Vec<(String, Hook<C>)>,
}

impl<C> Hooks<C> {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add(&mut self, name: &str, hook: Hook<C>) {
        match self.hooks.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = hook,
            None => self.hooks.push((name.to_string(), hook)),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(n, _)| n != name);
        self.hooks.len() != before
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn run(&self, ctx: &mut C, ev: &LoopEvent<'_>) -> Result<()> {
        for (_, hook) in &self.hooks {
            hook(ctx, ev)?;
        }
        Ok(())
    }
}

impl<C> Default for Hooks<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Loop<C> {
    pub level: Level,
    pub count: Count<C>,
    pub on_start: Hooks<C>,
    pub on_end: Hooks<C>,
    /// Named stop conditions checked after each iteration's `on_end`.
    /// Any returning true completes the level early.
    pub is_done: Vec<(String, DoneFn<C>)>,
}

impl<C> Loop<C> {
    fn new(level: Level, count: Count<C>) -> Self {
        Self {
            level,
            count,
            on_start: Hooks::new(),
            on_end: Hooks::new(),
            is_done: Vec::new(),
        }
    }

    pub fn add_is_done(&mut self, name: &str, f: impl Fn(&C, &LoopEvent<'_>) -> bool + 'static) {
        let f: DoneFn<C> = Rc::new(f);
        match self.is_done.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = f,
            None => self.is_done.push((name.to_string(), f)),
        }
    }
}

/// Shared stop request, polled once per innermost iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The outermost level completed.
    Done,
    /// Stopped on request or after the requested number of steps.
    Stopped,
}

pub struct Stack<C> {
    mode: Mode,
    step_level: Level,
    loops: Vec<Loop<C>>,
    counters: Vec<Counter>,
    /// Number of levels, outermost first, currently inside an iteration.
    entered: usize,
    done: bool,
    pub on_init: Hooks<C>,
}

impl<C> Stack<C> {
    fn new(mode: Mode, step_level: Level) -> Self {
        Self {
            mode,
            step_level,
            loops: Vec::new(),
            counters: Vec::new(),
            entered: 0,
            done: false,
            on_init: Hooks::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Default level for `Stacks::step`.
    pub fn step_level(&self) -> Level {
        self.step_level
    }

    /// Append the next level in. Levels must be added outermost first.
    pub fn add_level(&mut self, level: Level, count: impl Into<Count<C>>) -> Result<&mut Self> {
        let count = count.into();
        if let Count::Fixed(0) = count {
            return Err(SimError::InvalidCount {
                mode: self.mode,
                level,
                count: 0,
            });
        }
        if let Some(last) = self.loops.last() {
            if level >= last.level {
                return Err(SimError::Configuration(format!(
                    "{} stack: {} must be inside {}",
                    self.mode, level, last.level
                )));
            }
        }
        self.loops.push(Loop::new(level, count));
        self.counters.push(Counter::new(level));
        Ok(self)
    }

    /// Levels, outermost first.
    pub fn order(&self) -> Vec<Level> {
        self.loops.iter().map(|l| l.level).collect()
    }

    pub fn has_level(&self, level: Level) -> bool {
        self.index(level).is_some()
    }

    fn index(&self, level: Level) -> Option<usize> {
        self.loops.iter().position(|l| l.level == level)
    }

    pub fn level(&self, level: Level) -> Result<&Loop<C>> {
        let mode = self.mode;
        self.index(level)
            .map(|i| &self.loops[i])
            .ok_or(SimError::UnknownLevel { mode, level })
    }

    pub fn level_mut(&mut self, level: Level) -> Result<&mut Loop<C>> {
        let mode = self.mode;
        match self.index(level) {
            Some(i) => Ok(&mut self.loops[i]),
            None => Err(SimError::UnknownLevel { mode, level }),
        }
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    pub fn counter(&self, level: Level) -> Result<&Counter> {
        let mode = self.mode;
        self.index(level)
            .map(|i| &self.counters[i])
            .ok_or(SimError::UnknownLevel { mode, level })
    }

    pub fn counter_mut(&mut self, level: Level) -> Result<&mut Counter> {
        let mode = self.mode;
        match self.index(level) {
            Some(i) => Ok(&mut self.counters[i]),
            None => Err(SimError::UnknownLevel { mode, level }),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn reset_counters(&mut self) {
        for c in &mut self.counters {
            c.reset();
        }
        self.entered = 0;
        self.done = false;
    }

    /// e.g. `Test  Epoch: 0  Trial: 3`.
    pub fn counters_string(&self) -> String {
        let mut s = self.mode.to_string();
        for c in &self.counters {
            s.push_str(&format!("  {}: {}", c.level, c.cur));
        }
        s
    }

    fn resolve_max(&mut self, i: usize, ctx: &C) -> Result<()> {
        if self.counters[i].max.is_some() {
            return Ok(());
        }
        let n = match &self.loops[i].count {
            Count::Fixed(n) => *n,
            Count::Dynamic(f) => f(ctx),
        };
        if n == 0 {
            return Err(SimError::InvalidCount {
                mode: self.mode,
                level: self.loops[i].level,
                count: 0,
            });
        }
        self.counters[i].max = Some(n);
        Ok(())
    }

    /// One innermost iteration, including every `on_end` it triggers on the
    /// way out. `completed` sees each level whose iteration ended.
    /// Returns true once the outermost level has finished.
    fn iterate(&mut self, ctx: &mut C, completed: &mut dyn FnMut(Level)) -> Result<bool> {
        let n = self.loops.len();
        if n == 0 {
            return Err(SimError::Configuration(format!(
                "{} stack has no levels",
                self.mode
            )));
        }
        if self.done {
            return Ok(true);
        }

        let mut i = n - 1;
        while self.entered < n {
            let j = self.entered;
            self.resolve_max(j, ctx)?;
            // a counter preset to its max has nothing left to run
            if self.counters[j].cur >= self.counters[j].max() {
                if j == 0 {
                    debug!(mode = %self.mode, "stack already exhausted: {}", self.counters_string());
                    self.done = true;
                    return Ok(true);
                }
                self.counters[j].reset();
                i = j - 1;
                break;
            }
            let ev = LoopEvent {
                mode: self.mode,
                level: self.loops[j].level,
                counters: &self.counters,
            };
            self.loops[j].on_start.run(ctx, &ev)?;
            self.entered = j + 1;
        }

        loop {
            let level = self.loops[i].level;
            let ev = LoopEvent {
                mode: self.mode,
                level,
                counters: &self.counters,
            };
            self.loops[i].on_end.run(ctx, &ev)?;
            let forced = self.loops[i].is_done.iter().any(|(_, f)| f(&*ctx, &ev));
            self.entered = i;
            self.counters[i].cur += 1;
            completed(level);

            if !forced && self.counters[i].cur < self.counters[i].max() {
                return Ok(false);
            }
            if i == 0 {
                debug!(mode = %self.mode, "stack complete: {}", self.counters_string());
                self.done = true;
                return Ok(true);
            }
            self.counters[i].reset();
            i -= 1;
        }
    }
}

/// All stacks, one per mode, sharing one stop handle.
pub struct Stacks<C> {
    stacks: Vec<Stack<C>>,
    stop: StopHandle,
}

impl<C> Stacks<C> {
    pub fn new() -> Self {
        Self {
            stacks: Vec::new(),
            stop: StopHandle::default(),
        }
    }

    /// Create (or replace) the stack for `mode`.
    pub fn add_stack(&mut self, mode: Mode, step_level: Level) -> &mut Stack<C> {
        self.stacks.retain(|s| s.mode != mode);
        self.stacks.push(Stack::new(mode, step_level));
        let last = self.stacks.len() - 1;
        &mut self.stacks[last]
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.stacks.iter().map(|s| s.mode).collect()
    }

    pub fn stacks(&self) -> impl Iterator<Item = &Stack<C>> {
        self.stacks.iter()
    }

    pub fn stack(&self, mode: Mode) -> Result<&Stack<C>> {
        self.stacks
            .iter()
            .find(|s| s.mode == mode)
            .ok_or(SimError::UnknownStack(mode))
    }

    pub fn stack_mut(&mut self, mode: Mode) -> Result<&mut Stack<C>> {
        self.stacks
            .iter_mut()
            .find(|s| s.mode == mode)
            .ok_or(SimError::UnknownStack(mode))
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Ask the running stack to stop after its current innermost iteration.
    pub fn stop(&self) {
        self.stop.request_stop();
    }

    /// Bind `hook` to the start of every level already added, in every stack.
    pub fn add_on_start_to_all(&mut self, name: &str, hook: impl Fn(&mut C, &LoopEvent<'_>) -> Result<()> + 'static) {
        let hook: Hook<C> = Rc::new(hook);
        for st in &mut self.stacks {
            for lp in &mut st.loops {
                lp.on_start.add(name, Rc::clone(&hook));
            }
        }
    }

    /// Bind `hook` to the end of every level already added, in every stack.
    pub fn add_on_end_to_all(&mut self, name: &str, hook: impl Fn(&mut C, &LoopEvent<'_>) -> Result<()> + 'static) {
        let hook: Hook<C> = Rc::new(hook);
        for st in &mut self.stacks {
            for lp in &mut st.loops {
                lp.on_end.add(name, Rc::clone(&hook));
            }
        }
    }

    /// Bind `hook` to the start of `level` in every stack that has it.
    pub fn add_on_start_to_loop(
        &mut self,
        level: Level,
        name: &str,
        hook: impl Fn(&mut C, &LoopEvent<'_>) -> Result<()> + 'static,
    ) {
        let hook: Hook<C> = Rc::new(hook);
        for st in &mut self.stacks {
            if let Ok(lp) = st.level_mut(level) {
                lp.on_start.add(name, Rc::clone(&hook));
            }
        }
    }

    /// Bind `hook` to the end of `level` in every stack that has it.
    pub fn add_on_end_to_loop(
        &mut self,
        level: Level,
        name: &str,
        hook: impl Fn(&mut C, &LoopEvent<'_>) -> Result<()> + 'static,
    ) {
        let hook: Hook<C> = Rc::new(hook);
        for st in &mut self.stacks {
            if let Ok(lp) = st.level_mut(level) {
                lp.on_end.add(name, Rc::clone(&hook));
            }
        }
    }

    pub fn reset_counters(&mut self) {
        for st in &mut self.stacks {
            st.reset_counters();
        }
    }

    /// Fire the `on_init` hooks of `mode`'s stack.
    pub fn init(&self, ctx: &mut C, mode: Mode) -> Result<()> {
        let st = self.stack(mode)?;
        let ev = LoopEvent {
            mode,
            level: st.step_level,
            counters: &st.counters,
        };
        st.on_init.run(ctx, &ev)
    }

    /// Withdraw a pending stop request so the next `run` or `step` proceeds.
    pub fn clear_stop(&self) {
        self.stop.clear();
    }

    /// Drive `mode`'s stack until its outermost level completes or a stop is
    /// requested. A completed stack restarts from zero. A stop requested
    /// before the call stays in effect: nothing runs until `clear_stop`.
    pub fn run(&mut self, ctx: &mut C, mode: Mode) -> Result<RunState> {
        let stop = self.stop.clone();
        let st = self.stack_mut(mode)?;
        if st.done {
            st.reset_counters();
        }
        loop {
            if stop.is_stop_requested() {
                debug!(%mode, "stopped at {}", st.counters_string());
                return Ok(RunState::Stopped);
            }
            if st.iterate(ctx, &mut |_| {})? {
                return Ok(RunState::Done);
            }
        }
    }

    /// Drive `mode`'s stack until `level` has completed `n` more iterations.
    pub fn step(&mut self, ctx: &mut C, mode: Mode, level: Level, n: usize) -> Result<RunState> {
        let stop = self.stop.clone();
        let st = self.stack_mut(mode)?;
        if !st.has_level(level) {
            return Err(SimError::UnknownLevel { mode, level });
        }
        if st.done {
            st.reset_counters();
        }
        let mut seen = 0usize;
        while seen < n {
            if stop.is_stop_requested() {
                return Ok(RunState::Stopped);
            }
            let finished = st.iterate(ctx, &mut |l| {
                if l == level {
                    seen += 1;
                }
            })?;
            if finished {
                return Ok(RunState::Done);
            }
        }
        Ok(RunState::Stopped)
    }

    pub fn counters_string(&self, mode: Mode) -> String {
        self.stack(mode)
            .map(|s| s.counters_string())
            .unwrap_or_default()
    }

    /// Human-readable description of every stack, its levels and hooks.
    pub fn doc_string(&self) -> String {
        let mut s = String::new();
        for st in &self.stacks {
            s.push_str(&format!("Stack: {}\n", st.mode));
            if !st.on_init.is_empty() {
                s.push_str(&format!("  OnInit: {}\n", st.on_init.names().join(", ")));
            }
            for (depth, lp) in st.loops.iter().enumerate() {
                let indent = "  ".repeat(depth + 1);
                let count = match &lp.count {
                    Count::Fixed(n) => n.to_string(),
                    Count::Dynamic(_) => "dynamic".to_string(),
                };
                s.push_str(&format!("{}{}[{}]\n", indent, lp.level, count));
                if !lp.on_start.is_empty() {
                    s.push_str(&format!("{}  OnStart: {}\n", indent, lp.on_start.names().join(", ")));
                }
                if !lp.on_end.is_empty() {
                    s.push_str(&format!("{}  OnEnd: {}\n", indent, lp.on_end.names().join(", ")));
                }
                if !lp.is_done.is_empty() {
                    let names: Vec<&str> = lp.is_done.iter().map(|(n, _)| n.as_str()).collect();
                    s.push_str(&format!("{}  IsDone: {}\n", indent, names.join(", ")));
                }
            }
        }
        s
    }
}

impl<C> Default for Stacks<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every hook firing as "Start:Level" / "End:Level".
    #[derive(Default)]
    struct Trace {
        events: Vec<String>,
    }

    impl Trace {
        fn count(&self, ev: &str) -> usize {
            self.events.iter().filter(|e| *e == ev).count()
        }
    }

    fn traced(levels: &[(Level, usize)]) -> Stacks<Trace> {
        let mut ls = Stacks::new();
        let st = ls.add_stack(Mode::Test, levels[levels.len() - 1].0);
        for &(level, n) in levels {
            st.add_level(level, n).unwrap();
        }
        ls.add_on_start_to_all("trace", |t: &mut Trace, ev| {
            t.events.push(format!("Start:{}", ev.level));
            Ok(())
        });
        ls.add_on_end_to_all("trace", |t: &mut Trace, ev| {
            t.events.push(format!("End:{}", ev.level));
            Ok(())
        });
        ls
    }

    #[test]
    fn outer_end_follows_last_inner_end() {
        let mut ls = traced(&[(Level::Epoch, 1), (Level::Trial, 5)]);
        let mut t = Trace::default();
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Done);

        assert_eq!(t.count("End:Epoch"), 1);
        assert_eq!(t.count("End:Trial"), 5);
        assert_eq!(t.events.first().map(String::as_str), Some("Start:Epoch"));
        assert_eq!(t.events[1], "Start:Trial");
        let n = t.events.len();
        assert_eq!(t.events[n - 2], "End:Trial");
        assert_eq!(t.events[n - 1], "End:Epoch");
    }

    #[test]
    fn counters_exhaust_exactly() {
        let mut ls = traced(&[(Level::Run, 3), (Level::Trial, 2)]);
        let mut t = Trace::default();
        ls.run(&mut t, Mode::Test).unwrap();
        assert_eq!(t.count("Start:Trial"), 6);
        assert_eq!(t.count("Start:Run"), 3);
        assert_eq!(t.count("End:Run"), 3);
    }

    #[test]
    fn hooks_see_the_current_iteration_index() {
        let mut ls: Stacks<Vec<(usize, usize)>> = Stacks::new();
        ls.add_stack(Mode::Train, Level::Trial)
            .add_level(Level::Epoch, 2)
            .unwrap()
            .add_level(Level::Trial, 3)
            .unwrap();
        ls.add_on_end_to_loop(Level::Trial, "record", |seen: &mut Vec<(usize, usize)>, ev| {
            let epoch = ev.counter(Level::Epoch).map(|c| c.cur).unwrap_or(99);
            let trial = ev.counter(Level::Trial).map(|c| c.cur).unwrap_or(99);
            seen.push((epoch, trial));
            Ok(())
        });
        let mut seen = Vec::new();
        ls.run(&mut seen, Mode::Train).unwrap();
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn zero_count_is_rejected_at_setup() {
        let mut ls: Stacks<()> = Stacks::new();
        let err = ls
            .add_stack(Mode::Test, Level::Trial)
            .add_level(Level::Trial, 0)
            .err();
        assert!(matches!(err, Some(SimError::InvalidCount { count: 0, .. })));
    }

    #[test]
    fn levels_must_be_added_outermost_first() {
        let mut ls: Stacks<()> = Stacks::new();
        let st = ls.add_stack(Mode::Test, Level::Trial);
        st.add_level(Level::Trial, 2).unwrap();
        assert!(matches!(
            st.add_level(Level::Epoch, 1),
            Err(SimError::Configuration(_))
        ));
    }

    #[test]
    fn dynamic_count_is_read_on_entry() {
        let mut ls: Stacks<Vec<usize>> = Stacks::new();
        ls.add_stack(Mode::Test, Level::Trial)
            .add_level(Level::Epoch, 1)
            .unwrap()
            .add_level(Level::Trial, Count::dynamic(|rows: &Vec<usize>| rows.len()))
            .unwrap();
        let mut rows = vec![0, 0, 0, 0];
        ls.add_on_end_to_loop(Level::Trial, "mark", |rows: &mut Vec<usize>, ev| {
            let i = ev.counter(Level::Trial).map(|c| c.cur).unwrap_or(0);
            rows[i] += 1;
            Ok(())
        });
        ls.run(&mut rows, Mode::Test).unwrap();
        assert_eq!(rows, vec![1, 1, 1, 1]);
    }

    #[test]
    fn dynamic_zero_count_fails_when_entered() {
        let mut ls: Stacks<()> = Stacks::new();
        ls.add_stack(Mode::Test, Level::Trial)
            .add_level(Level::Trial, Count::dynamic(|_: &()| 0))
            .unwrap();
        assert!(matches!(
            ls.run(&mut (), Mode::Test),
            Err(SimError::InvalidCount { level: Level::Trial, .. })
        ));
    }

    #[test]
    fn reregistering_a_name_replaces_in_place() {
        let mut ls = traced(&[(Level::Trial, 1)]);
        ls.add_on_start_to_all("second", |t: &mut Trace, _| {
            t.events.push("second".into());
            Ok(())
        });
        ls.add_on_start_to_all("trace", |t: &mut Trace, _| {
            t.events.push("replaced".into());
            Ok(())
        });
        let names = ls
            .stack(Mode::Test)
            .unwrap()
            .level(Level::Trial)
            .unwrap()
            .on_start
            .names()
            .join(",");
        assert_eq!(names, "trace,second");

        let mut t = Trace::default();
        ls.run(&mut t, Mode::Test).unwrap();
        assert_eq!(t.events, vec!["replaced", "second", "End:Trial"]);
    }

    #[test]
    fn to_all_is_not_retroactive() {
        let mut ls: Stacks<Trace> = Stacks::new();
        ls.add_stack(Mode::Test, Level::Trial)
            .add_level(Level::Epoch, 1)
            .unwrap();
        ls.add_on_start_to_all("trace", |t: &mut Trace, ev| {
            t.events.push(format!("Start:{}", ev.level));
            Ok(())
        });
        ls.stack_mut(Mode::Test)
            .unwrap()
            .add_level(Level::Trial, 2)
            .unwrap();
        let mut t = Trace::default();
        ls.run(&mut t, Mode::Test).unwrap();
        assert_eq!(t.events, vec!["Start:Epoch"]);
    }

    #[test]
    fn stop_finishes_the_iteration_and_resumes() {
        let mut ls = traced(&[(Level::Epoch, 1), (Level::Trial, 4)]);
        let stop = ls.stop_handle();
        ls.add_on_end_to_loop(Level::Trial, "stop-after-4th", move |t: &mut Trace, ev| {
            if ev.counter(Level::Trial).map(|c| c.cur) == Some(3) {
                t.events.push("stop".into());
                stop.request_stop();
            }
            Ok(())
        });
        let mut t = Trace::default();
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Done);
        // the stop landed on the last trial, so epoch end still fired
        assert_eq!(t.events.last().map(String::as_str), Some("End:Epoch"));
    }

    #[test]
    fn stop_requested_before_run_is_honored() {
        let mut ls = traced(&[(Level::Epoch, 1), (Level::Trial, 3)]);
        let mut t = Trace::default();
        ls.stop();
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Stopped);
        assert_eq!(ls.step(&mut t, Mode::Test, Level::Trial, 1).unwrap(), RunState::Stopped);
        assert!(t.events.is_empty());

        ls.clear_stop();
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Done);
        assert_eq!(t.count("End:Trial"), 3);
    }

    #[test]
    fn stop_on_the_last_iteration_survives_completion() {
        let mut ls = traced(&[(Level::Trial, 2)]);
        let stop = ls.stop_handle();
        ls.add_on_end_to_loop(Level::Trial, "stop-last", move |_: &mut Trace, ev| {
            if ev.counter(Level::Trial).map(|c| c.cur) == Some(1) {
                stop.request_stop();
            }
            Ok(())
        });
        let mut t = Trace::default();
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Done);
        assert!(ls.stop_handle().is_stop_requested());
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Stopped);
    }

    #[test]
    fn stop_mid_stack_leaves_it_resumable() {
        let mut ls = traced(&[(Level::Epoch, 1), (Level::Trial, 4)]);
        let mut t = Trace::default();
        let state = ls.step(&mut t, Mode::Test, Level::Trial, 2).unwrap();
        assert_eq!(state, RunState::Stopped);
        assert_eq!(t.count("End:Trial"), 2);
        assert_eq!(t.count("End:Epoch"), 0);
        assert_eq!(ls.stack(Mode::Test).unwrap().counter(Level::Trial).unwrap().cur, 2);

        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Done);
        assert_eq!(t.count("End:Trial"), 4);
        assert_eq!(t.count("Start:Epoch"), 1);
        assert_eq!(t.count("End:Epoch"), 1);
    }

    #[test]
    fn is_done_force_completes_a_level() {
        let mut ls = traced(&[(Level::Epoch, 2), (Level::Trial, 10)]);
        ls.stack_mut(Mode::Test)
            .unwrap()
            .level_mut(Level::Trial)
            .unwrap()
            .add_is_done("three", |_, ev| {
                ev.counter(Level::Trial).map(|c| c.cur) == Some(2)
            });
        let mut t = Trace::default();
        ls.run(&mut t, Mode::Test).unwrap();
        assert_eq!(t.count("End:Trial"), 6);
        assert_eq!(t.count("End:Epoch"), 2);
    }

    #[test]
    fn hook_error_aborts_the_run() {
        let mut ls = traced(&[(Level::Trial, 3)]);
        ls.add_on_end_to_all("fail", |_: &mut Trace, _| {
            Err(SimError::Configuration("boom".into()))
        });
        let mut t = Trace::default();
        assert!(ls.run(&mut t, Mode::Test).is_err());
        assert_eq!(t.count("End:Trial"), 1);
    }

    #[test]
    fn set_cur_max_plus_n_limits_iterations() {
        let mut ls = traced(&[(Level::Run, 10), (Level::Trial, 1)]);
        let mut t = Trace::default();
        ls.stack_mut(Mode::Test)
            .unwrap()
            .counter_mut(Level::Run)
            .unwrap()
            .set_cur_max_plus_n(3, 2);
        ls.run(&mut t, Mode::Test).unwrap();
        assert_eq!(t.count("Start:Run"), 2);
    }

    #[test]
    fn set_cur_max_plus_zero_runs_nothing() {
        let mut ls = traced(&[(Level::Run, 10), (Level::Trial, 1)]);
        let mut t = Trace::default();
        ls.stack_mut(Mode::Test)
            .unwrap()
            .counter_mut(Level::Run)
            .unwrap()
            .set_cur_max_plus_n(3, 0);
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Done);
        assert!(t.events.is_empty(), "{:?}", t.events);
        assert!(ls.stack(Mode::Test).unwrap().is_done());
    }

    #[test]
    fn exhausted_inner_counter_ends_its_parent_iteration() {
        let mut ls = traced(&[(Level::Epoch, 2), (Level::Trial, 3)]);
        let mut t = Trace::default();
        ls.step(&mut t, Mode::Test, Level::Trial, 1).unwrap();
        // skip the rest of the first epoch
        ls.stack_mut(Mode::Test)
            .unwrap()
            .counter_mut(Level::Trial)
            .unwrap()
            .set_cur_max_plus_n(1, 0);
        assert_eq!(ls.run(&mut t, Mode::Test).unwrap(), RunState::Done);
        assert_eq!(t.count("End:Epoch"), 2);
        assert_eq!(t.count("End:Trial"), 1 + 3);
    }

    #[test]
    fn doc_string_lists_levels_and_hooks() {
        let ls = traced(&[(Level::Epoch, 1), (Level::Trial, 4)]);
        let doc = ls.doc_string();
        assert!(doc.contains("Stack: Test"));
        assert!(doc.contains("Epoch[1]"));
        assert!(doc.contains("Trial[4]"));
        assert!(doc.contains("OnStart: trace"));
    }
}
