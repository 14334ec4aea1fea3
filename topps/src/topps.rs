// `topps` -- Query the process snapshot history written by the `top` collector
//
// Run with --help for brief help.
//
// Quirks
//
// The --at and --toward values of `snapshot` define both the search direction and the window: a
// snapshot outside the range between the two times is "not found" even if one exists just beyond
// it.  Without --toward the search goes one day back from --at, which answers "what was running at
// this time".
//
// The --from and --to values of `timeline` select snapshots, not processes.  A process that started
// before --from is reported as starting at the first snapshot in the range.

mod configs;
mod format;
mod snapshot;
mod timeline;

use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, LevelFilter};
use std::env;
use std::io;
use std::num::ParseIntError;
use std::process;
use std::str::FromStr;
use std::time;
use toppslog::{self, CommandFlusher, Flusher, LocateOptions, Timestamp, TimelineQuery};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the process snapshot nearest to a point in time
    Snapshot(SnapshotArgs),

    /// Print the lifetimes of the processes seen in a time range
    Timeline(TimelineArgs),
}

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(flatten)]
    input_args: InputArgs,

    /// Find the snapshot at or nearest to this time.  Format can be UNIX seconds, YYYY-MM-DD, or Nd
    /// or Nw signifying N days or weeks ago [default: now]
    #[arg(long, short, value_parser = parse_time_start_of_day)]
    at: Option<Timestamp>,

    /// Search from --at toward this time: a later time searches forward, an earlier one backward.
    /// Same formats as --at [default: one day before --at]
    #[arg(long, value_parser = parse_time_start_of_day)]
    toward: Option<Timestamp>,

    /// Program and arguments, separated by spaces, used to ask the writer to flush its current file
    /// [default: from the config file, else no flushing]
    #[arg(long)]
    flush_command: Option<String>,

    /// Number of times to look for a flushed file, one second apart [default: 10]
    #[arg(long)]
    flush_retries: Option<u32>,

    #[command(flatten)]
    print_args: SnapshotPrintArgs,

    #[command(flatten)]
    meta_args: MetaArgs,
}

#[derive(Args, Debug)]
pub struct TimelineArgs {
    #[command(flatten)]
    input_args: InputArgs,

    /// Select snapshots by this time and later.  Format can be UNIX seconds, YYYY-MM-DD, or Nd or
    /// Nw signifying N days or weeks ago [default: 1d, ie 1 day ago]
    #[arg(long, short, value_parser = parse_time_start_of_day)]
    from: Option<Timestamp>,

    /// Select snapshots by this time and earlier.  Same formats as --from [default: now]
    #[arg(long, short, value_parser = parse_time_end_of_day)]
    to: Option<Timestamp>,

    /// Sample the data at this interval, format `WwDdHhMm`, all parts optional.  From 2h47m up,
    /// only the first file of each interval is read [default: every snapshot]
    #[arg(long, value_parser = run_time)]
    interval: Option<chrono::Duration>,

    /// Omit processes seen for less than this long, format `WwDdHhMm` [default: 0m]
    #[arg(long, value_parser = run_time)]
    ignore_short_lived: Option<chrono::Duration>,

    /// Omit processes seen for the whole of the observed time range
    #[arg(long, default_value_t = false)]
    ignore_resident: bool,

    /// Give up after this many seconds, 0 for the maximum of one day [default: from the config
    /// file, else 0]
    #[arg(long)]
    timeout: Option<u64>,

    #[command(flatten)]
    print_args: TimelinePrintArgs,

    #[command(flatten)]
    meta_args: MetaArgs,
}

#[derive(Args, Debug)]
pub struct InputArgs {
    /// Select the root directory of the data tree [default: data_path from the config file, else
    /// $TOPPS_DATADIR, else the current directory]
    #[arg(long)]
    data_path: Option<String>,

    /// Select this host name
    #[arg(long)]
    host: String,

    /// File containing JSON configuration data [default: none]
    #[arg(long)]
    config_file: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct SnapshotPrintArgs {
    /// Print only the process lines of the snapshot, not the json reply
    #[arg(long, default_value_t = false)]
    raw: bool,
}

#[derive(Args, Debug, Default)]
pub struct TimelinePrintArgs {
    /// Select fields for the output, from pid, ppid, uid, gid, user, group, first, last, start,
    /// end, duration, cmd, and the options csv, header, noheader [default:
    /// pid,user,start,end,duration,cmd]
    #[arg(long)]
    fmt: Option<String>,

    /// Print csv instead of a fixed-width table
    #[arg(long, default_value_t = false)]
    csv: bool,

    /// Do not print a header line
    #[arg(long, default_value_t = false)]
    no_header: bool,

    /// Print the json reply instead of a table
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Default)]
pub struct MetaArgs {
    /// Log progress to stderr, repeat for more detail (RUST_LOG overrides)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

// The command arg parsers don't need to include the string being parsed because the error generated
// by clap includes that.

// UNIX seconds, or YYYY-MM-DD but with a little (too much?) flexibility, or Nd, Nw.
fn parse_time(s: &str, end_of_day: bool) -> Result<Timestamp> {
    if let Some(n) = s.strip_suffix('d') {
        if let Ok(k) = u32::from_str(n) {
            Ok(now() - i64::from(k) * 86400)
        } else {
            bail!("Invalid date")
        }
    } else if let Some(n) = s.strip_suffix('w') {
        if let Ok(k) = u32::from_str(n) {
            Ok(now() - i64::from(k) * 7 * 86400)
        } else {
            bail!("Invalid date")
        }
    } else if !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit()) {
        Ok(Timestamp::from_str(s)?)
    } else {
        let parts = s
            .split('-')
            .map(u32::from_str)
            .collect::<Vec<Result<u32, ParseIntError>>>();
        if parts.len() != 3 || !parts.iter().all(|x| x.is_ok()) {
            bail!("Invalid date syntax");
        }
        let vals = parts
            .into_iter()
            .flatten()
            .collect::<Vec<u32>>();
        let d = match NaiveDate::from_ymd_opt(vals[0] as i32, vals[1], vals[2]) {
            Some(d) => d,
            None => bail!("Invalid date"),
        };
        let (h, m, s) = if end_of_day { (23, 59, 59) } else { (0, 0, 0) };
        match Utc
            .with_ymd_and_hms(d.year(), d.month(), d.day(), h, m, s)
            .single()
        {
            Some(t) => Ok(t.timestamp()),
            None => bail!("Invalid date"),
        }
    }
}

fn parse_time_start_of_day(s: &str) -> Result<Timestamp> {
    parse_time(s, false)
}

fn parse_time_end_of_day(s: &str) -> Result<Timestamp> {
    parse_time(s, true)
}

fn now() -> Timestamp {
    Utc::now().timestamp()
}

#[test]
fn test_parse_time() {
    assert!(parse_time("1000000000", false).unwrap() == 1000000000);
    assert!(parse_time("2001-09-09", false).unwrap() == 999993600);
    assert!(parse_time("2001-09-09", true).unwrap() == 999993600 + 86399);

    let t = parse_time("2d", false).unwrap();
    let expect = now() - 2 * 86400;
    assert!(t <= expect && t >= expect - 5);
    let t = parse_time("1w", false).unwrap();
    let expect = now() - 7 * 86400;
    assert!(t <= expect && t >= expect - 5);

    assert!(parse_time("", false).is_err());
    assert!(parse_time("d", false).is_err());
    assert!(parse_time("2001-09", false).is_err());
    assert!(parse_time("2001-02-30", false).is_err());
    assert!(parse_time("-5", false).is_err());
    assert!(parse_time("yesterday", false).is_err());
}

// This is WwDdHhMm with all parts optional but at least one part required.  There is possibly too
// much flexibility here, as the parts can be in any order.
fn run_time(s: &str) -> Result<chrono::Duration> {
    let mut weeks = 0u64;
    let mut days = 0u64;
    let mut hours = 0u64;
    let mut minutes = 0u64;
    let mut have_weeks = false;
    let mut have_days = false;
    let mut have_hours = false;
    let mut have_minutes = false;
    let mut ds = "".to_string();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            ds.push(ch);
        } else {
            if ds.is_empty()
                || (ch != 'd' && ch != 'h' && ch != 'm' && ch != 'w')
                || (ch == 'd' && have_days)
                || (ch == 'h' && have_hours)
                || (ch == 'm' && have_minutes)
                || (ch == 'w' && have_weeks)
            {
                bail!("Bad suffix")
            }
            let val = match u64::from_str(&ds) {
                Ok(v) => v,
                Err(_) => bail!("Bad number"),
            };
            ds.clear();
            if ch == 'd' {
                have_days = true;
                days = val;
            } else if ch == 'h' {
                have_hours = true;
                hours = val;
            } else if ch == 'm' {
                have_minutes = true;
                minutes = val;
            } else if ch == 'w' {
                have_weeks = true;
                weeks = val;
            }
        }
    }
    if !ds.is_empty() || (!have_days && !have_hours && !have_minutes && !have_weeks) {
        bail!("Inconsistent")
    }

    let seconds = weeks
        .checked_mul(7)
        .and_then(|d| d.checked_add(days))
        .and_then(|d| d.checked_mul(24))
        .and_then(|h| h.checked_add(hours))
        .and_then(|h| h.checked_mul(60))
        .and_then(|m| m.checked_add(minutes))
        .and_then(|m| m.checked_mul(60));
    match seconds {
        Some(s) => Ok(chrono::Duration::from_std(time::Duration::from_secs(s))?),
        None => bail!("Too large"),
    }
}

#[test]
fn test_run_time() {
    // This is illegal as of now, we might want to change this?
    assert!(run_time("3").is_err());

    // Years (and other things) are not supported
    assert!(run_time("3y").is_err());
    assert!(run_time("d").is_err());
    assert!(run_time("3d3d").is_err());

    let x = run_time("3m").unwrap();
    assert!(x.num_minutes() == 3);
    assert!(x.num_hours() == 0);

    let x = run_time("4h7m").unwrap();
    assert!(x.num_minutes() == 4 * 60 + 7);
    assert!(x.num_hours() == 4);

    let x = run_time("2d4h7m").unwrap();
    assert!(x.num_minutes() == (2 * 24 + 4) * 60 + 7);

    let x = run_time("1w").unwrap();
    assert!(x.num_seconds() == 7 * 86400);

    // Too large for the arithmetic, or for a Duration.
    assert!(run_time("9999999999999999999w").is_err());
    assert!(run_time("99999999999999999999m").is_err());
    assert!(run_time("999999999999999w").is_err());
}

fn main() {
    let cli = Cli::parse();

    let verbose = match cli.command {
        Commands::Snapshot(ref args) => args.meta_args.verbose,
        Commands::Timeline(ref args) => args.meta_args.verbose,
    };
    env_logger::Builder::new()
        .filter_level(match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        })
        .parse_default_env()
        .init();

    match topps(&cli) {
        Ok(()) => {}
        Err(msg) => {
            error!("{:#}", msg);
            process::exit(1);
        }
    }
}

fn topps(cli: &Cli) -> Result<()> {
    let input_args = match cli.command {
        Commands::Snapshot(ref args) => &args.input_args,
        Commands::Timeline(ref args) => &args.input_args,
    };

    // Configuration file, if specified.

    let config = if let Some(ref config_filename) = input_args.config_file {
        configs::read_from_json(config_filename)?
    } else {
        Default::default()
    };

    // Data path.  An empty path is the current directory.

    let data_path = if let Some(ref p) = input_args.data_path {
        p.clone()
    } else if let Some(ref p) = config.data_path {
        p.clone()
    } else if let Ok(val) = env::var("TOPPS_DATADIR") {
        val
    } else {
        "".to_string()
    };
    debug!("Data path: {:?}", data_path);

    match cli.command {
        Commands::Snapshot(ref args) => {
            let at = args.at.unwrap_or_else(now);
            let toward = args.toward.unwrap_or(at.saturating_sub(86400));

            let words = if let Some(ref c) = args.flush_command {
                c.split_whitespace()
                    .map(|w| w.to_string())
                    .collect::<Vec<String>>()
            } else {
                config.flush_command.clone()
            };
            let command_flusher = CommandFlusher::new(&words);
            let flusher: &dyn Flusher = match command_flusher {
                Some(ref f) => f,
                None => &toppslog::no_flush,
            };

            let mut options = LocateOptions::default();
            if let Some(n) = args.flush_retries.or(config.flush_retries) {
                options.flush_retries = n;
            }

            let reply = toppslog::get_snapshot(
                &data_path,
                &input_args.host,
                at,
                toward,
                flusher,
                &options,
            )?;
            debug!("Snapshot status: {}", reply.status);
            snapshot::print_snapshot(&mut io::stdout(), &args.print_args, &reply)
        }
        Commands::Timeline(ref args) => {
            let started = time::Instant::now();
            let to = args.to.unwrap_or_else(now);
            let from = args.from.unwrap_or(to.saturating_sub(86400));
            if from >= to {
                bail!("The --from time is not before the --to time");
            }
            let query = TimelineQuery {
                hostname: input_args.host.clone(),
                start: from,
                end: to,
                interval: args.interval.map_or(0, |d| d.num_seconds()),
                ignore_short_lived: args.ignore_short_lived.map_or(0, |d| d.num_seconds()),
                ignore_resident: args.ignore_resident,
                timeout: args.timeout.or(config.timeout).unwrap_or(0),
            };
            let reply = toppslog::get_timeline(&data_path, &query, started)?;
            debug!(
                "Timeline status: {}, {} processes",
                reply.status,
                reply.spans.len()
            );
            timeline::print_timeline(&mut io::stdout(), &args.print_args, &reply)
        }
    }
}
