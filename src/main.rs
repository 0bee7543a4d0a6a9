use std::path::PathBuf;
use std::process;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use simloop::config::Config;
use simloop::error::{Result, SimError};
use simloop::experiments::faces::Faces;
use simloop::looper::RunState;
use simloop::time::{Level, Mode};

#[derive(Debug, Default)]
struct RunArgs {
    config: Option<PathBuf>,
    run: Option<usize>,
    runs: Option<usize>,
    partial: bool,
    top_down: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("run");
    let res = match cmd {
        "--help" | "-h" | "help" => {
            print_help();
            return;
        }
        "run" => parse_run_args(&args[args.len().min(2)..]).and_then(run),
        "doc" => parse_run_args(&args[2..]).and_then(doc),
        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            process::exit(2);
        }
    };
    if let Err(e) = res {
        error!("{}", e);
        process::exit(1);
    }
}

fn parse_run_args(args: &[String]) -> Result<RunArgs> {
    let mut out = RunArgs::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => out.config = Some(PathBuf::from(value(&mut it, arg)?)),
            "--run" => out.run = Some(number(&mut it, arg)?),
            "--runs" => out.runs = Some(number(&mut it, arg)?),
            "--partial" => out.partial = true,
            "--top-down" => out.top_down = true,
            other => return Err(SimError::Configuration(format!("unknown argument: {}", other))),
        }
    }
    Ok(out)
}

fn value<'a>(it: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<&'a str> {
    it.next()
        .map(String::as_str)
        .ok_or_else(|| SimError::Configuration(format!("{} needs a value", flag)))
}

fn number<'a>(it: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<usize> {
    let v = value(it, flag)?;
    v.parse()
        .map_err(|_| SimError::Configuration(format!("{}: not a number: {}", flag, v)))
}

fn load(args: &RunArgs) -> Result<Faces> {
    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(run) = args.run {
        cfg.run.run = run;
    }
    if let Some(runs) = args.runs {
        cfg.run.runs = runs;
    }
    cfg.validate()?;
    let mut faces = Faces::new(cfg)?;
    faces.set_input(args.top_down)?;
    faces.set_patterns(args.partial)?;
    Ok(faces)
}

fn run(args: RunArgs) -> Result<()> {
    let mut faces = load(&args)?;
    let (start, count) = {
        let cfg = &faces.sim.state.config;
        info!("{}: {}", cfg.name, cfg.title);
        (cfg.run.run, cfg.run.runs)
    };
    if faces.sim.run_no_gui(start, count)? == RunState::Stopped {
        info!("stopped early");
    }
    info!("{}", faces.sim.stat_counters(Mode::Test, Level::Epoch));
    Ok(())
}

fn doc(args: RunArgs) -> Result<()> {
    let faces = load(&args)?;
    print!("{}", faces.sim.loops.doc_string());
    println!("Stats: {}", faces.sim.state.stat_funcs.names().join(", "));
    Ok(())
}

fn print_help() {
    println!("simloop (nested-loop simulation harness, face categorization demo)");
    println!("usage:");
    println!("  simloop run [--config path] [--run N] [--runs N] [--partial] [--top-down]");
    println!("  simloop doc [--config path]");
    println!("  simloop help");
    println!();
    println!("Log verbosity follows RUST_LOG (default: info).");
}
