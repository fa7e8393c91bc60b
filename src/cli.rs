// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use argh::FromArgs;
use chrono::NaiveDate;
use depthlut_core::*;
use depthlut_core::lookup_table::GenerationStyle;
use indicatif::{ ProgressBar, ProgressState, ProgressStyle };
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::time::Instant;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/** depthlut
Per-pixel depth-to-world lookup tables for depth camera rigs
*/
#[derive(FromArgs)]
struct Opts {
    /// LUT config file (JSON). Defaults are used when omitted
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// also write the log to this file
    #[argh(option)]
    log_file: Option<PathBuf>,

    /// debug logging, default: false
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Build(BuildCmd),
    Warm(WarmCmd),
    Info(InfoCmd),
    Point(PointCmd),
}

/// Build one table and save it to a file
#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
struct BuildCmd {
    /// calibration inventory (JSON)
    #[argh(option, short = 's')]
    store: PathBuf,

    /// camera make
    #[argh(option)]
    make: String,

    /// camera model
    #[argh(option)]
    model: String,

    /// table width, default: 640
    #[argh(option, default = "640")]
    width: usize,

    /// table height, default: 480
    #[argh(option, default = "480")]
    height: usize,

    /// capture date, YYYY-MM-DD. Decides the remount rotation of quirky cameras
    #[argh(option, from_str_fn(parse_date))]
    date: Option<NaiveDate>,

    /// output table file
    #[argh(option, short = 'o')]
    out: PathBuf,
}

/// Build every known camera at the standard sizes on the background scheduler
#[derive(FromArgs)]
#[argh(subcommand, name = "warm")]
struct WarmCmd {
    /// calibration inventory (JSON)
    #[argh(option, short = 's')]
    store: PathBuf,
}

/// Print the metadata of a table file
#[derive(FromArgs)]
#[argh(subcommand, name = "info")]
struct InfoCmd {
    /// table file
    #[argh(positional)]
    file: PathBuf,
}

/// Reconstruct the world point of one depth sample
#[derive(FromArgs)]
#[argh(subcommand, name = "point")]
struct PointCmd {
    /// table file
    #[argh(positional)]
    file: PathBuf,

    /// pixel column
    #[argh(positional)]
    col: usize,

    /// pixel row
    #[argh(positional)]
    row: usize,

    /// raw depth sample
    #[argh(positional)]
    sample: f64,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("Invalid date {s:?}: {e}"))
}

pub fn run() -> CliResult {
    let opts: Opts = argh::from_env();

    init_logging(opts.verbose, opts.log_file.as_deref())?;
    log_panics::init();
    ::log::debug!("depthlut {}", env!("CARGO_PKG_VERSION"));

    let config = match &opts.config {
        Some(path) => LutConfig::load(path)?,
        None => LutConfig::default(),
    };

    match opts.command {
        Command::Build(cmd) => build(config, cmd),
        Command::Warm(cmd)  => warm(config, cmd),
        Command::Info(cmd)  => info(cmd),
        Command::Point(cmd) => point(cmd),
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> CliResult {
    use simplelog::*;

    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Off)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(level, config.clone(), TerminalMode::Stderr, ColorChoice::Auto)];
    if let Some(path) = log_file {
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, std::fs::File::create(path)?));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn build(config: LutConfig, cmd: BuildCmd) -> CliResult {
    let store = JsonCalibrationStore::load(&cmd.store)?;
    let vector = store.get(&cmd.make, &cmd.model).ok_or_else(|| format!("{} {} is not in {}", cmd.make, cmd.model, cmd.store.display()))?;
    let service = LutService::new(config, Arc::new(store));

    let sty = ProgressStyle::with_template("[{bar:50.cyan/blue}] {pos:>5}/{len:5} {eta:11} {msg}")?
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| { let _ = write!(w, "ETA {:.1}s", state.eta().as_secs_f64()); })
        .progress_chars("#>-");
    let pb = ProgressBar::new(cmd.height as u64);
    pb.set_style(sty);
    pb.set_message(format!("{} {}", cmd.make, cmd.model));

    let sink = |done: usize, total: usize| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        Flow::Continue
    };
    let control = BuildControl { cancel_flag: None, progress: Some(&sink) };

    let time = Instant::now();
    let result = service.build_table(cmd.width, cmd.height, vector.as_slice(), &cmd.make, &cmd.model, cmd.date, &control);
    match &result {
        Ok(_) => pb.finish_with_message(format!("\x1B[1;32m{} {}\x1B[0m", cmd.make, cmd.model)), // Green
        Err(_) => pb.abandon_with_message(format!("\x1B[1;31m{} {}\x1B[0m", cmd.make, cmd.model)), // Red
    }
    let table = result?;

    depthlut_core::table_file::save(&table, &cmd.out)?;
    println!("Built {}x{} in {:.2}s, {} unresolved pixels, saved to {}", table.width, table.height, time.elapsed().as_secs_f64(), table.unresolved_count(), cmd.out.display());
    Ok(())
}

fn warm(config: LutConfig, cmd: WarmCmd) -> CliResult {
    let store = JsonCalibrationStore::load(&cmd.store)?;
    let service = LutService::new(config, Arc::new(store));
    let events = service.subscribe();

    let time = Instant::now();
    service.start()?;
    let mut failed = 0;
    for event in events.iter() {
        match event {
            SchedulerEvent::TableBuilt { make, model, width, height } => {
                println!("{make} {model} {width}x{height}: ready");
            }
            SchedulerEvent::TaskFailed { make, model, width, height, reason } => {
                failed += 1;
                println!("{make} {model} {width}x{height}: {reason}");
            }
            SchedulerEvent::BacklogDrained => break,
        }
    }
    service.stop()?;

    println!("{} tables cached, {failed} failed, in {:.2}s", service.cache().len(), time.elapsed().as_secs_f64());
    Ok(())
}

fn info(cmd: InfoCmd) -> CliResult {
    let t = depthlut_core::table_file::load(&cmd.file)?;
    let style = match t.style {
        GenerationStyle::Direct => "direct".to_string(),
        GenerationStyle::NativeCrop { native, rotated } => format!("cropped from {native}{}", if rotated { ", rotated 180°" } else { "" }),
    };

    println!("Camera:     {} {}", t.make, t.model);
    println!("Size:       {}", t.dimensions());
    println!("Style:      {style}");
    println!("Date:       {}", t.as_of_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()));
    println!("Intrinsics: fx {:.3} fy {:.3} cx {:.3} cy {:.3}", t.intrinsics.fx, t.intrinsics.fy, t.intrinsics.cx, t.intrinsics.cy);
    println!("Scale:      {}", t.scale);
    println!("Z range:    {} .. {}", t.z_range.0, t.z_range.1);
    println!("Bbox:       {:?} .. {:?}", t.bounding_box.min, t.bounding_box.max);
    println!("Unresolved: {}", t.unresolved_count());
    Ok(())
}

fn point(cmd: PointCmd) -> CliResult {
    let t = depthlut_core::table_file::load(&cmd.file)?;
    if cmd.col >= t.width || cmd.row >= t.height {
        return Err(format!("Pixel ({}, {}) is outside the {} table", cmd.col, cmd.row, t.dimensions()).into());
    }
    match t.world_point(cmd.col, cmd.row, cmd.sample) {
        Some(p) => println!("{:.4} {:.4} {:.4}", p[0], p[1], p[2]),
        None => println!("No point: unresolved pixel, or outside the depth range or bounding box"),
    }
    Ok(())
}
