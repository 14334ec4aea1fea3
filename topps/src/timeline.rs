// Print the answer to a timeline query, as a table, csv or json.

use crate::format;
use crate::TimelinePrintArgs;

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::io;
use toppslog::{ProcessSpan, Timestamp, TimelineReply, STATUS_OK};

const DEFAULT_FIELDS: &str = "pid,user,start,end,duration,cmd";

/// Print the spans of `reply`.  A reply that is not OK is printed only as json; otherwise it is an
/// error, so that a timed-out query does not look like an empty result.

pub fn print_timeline(
    output: &mut dyn io::Write,
    print_args: &TimelinePrintArgs,
    reply: &TimelineReply,
) -> Result<()> {
    if print_args.json {
        serde_json::to_writer(&mut *output, reply)?;
        writeln!(output)?;
        return Ok(());
    }
    if reply.status != STATUS_OK {
        bail!("Timeline query failed with status {}", reply.status);
    }

    let mut formatters: HashMap<String, &dyn Fn(SpanDatum, SpanCtx) -> String> = HashMap::new();
    formatters.insert("pid".to_string(), &format_pid);
    formatters.insert("ppid".to_string(), &format_ppid);
    formatters.insert("uid".to_string(), &format_uid);
    formatters.insert("gid".to_string(), &format_gid);
    formatters.insert("user".to_string(), &format_user);
    formatters.insert("group".to_string(), &format_group);
    formatters.insert("first".to_string(), &format_first);
    formatters.insert("last".to_string(), &format_last);
    formatters.insert("start".to_string(), &format_start);
    formatters.insert("end".to_string(), &format_end);
    formatters.insert("duration".to_string(), &format_duration);
    formatters.insert("cmd".to_string(), &format_command);

    let spec = if let Some(ref fmt) = print_args.fmt {
        fmt
    } else {
        DEFAULT_FIELDS
    };
    let (fields, others) = format::parse_fields(spec, &formatters);
    if let Some(bad) = others
        .iter()
        .find(|x| !["csv", "header", "noheader"].contains(*x))
    {
        bail!("Unknown field name or option in --fmt: '{bad}'");
    }
    let mut opts = format::standard_options(&others);
    if print_args.csv {
        opts.csv = true;
        if !others.contains("header") {
            opts.header = false;
        }
    }
    if print_args.no_header {
        opts.header = false;
    }
    if !fields.is_empty() {
        format::format_data(output, &fields, &formatters, &opts, &reply.spans, false)?;
    }
    Ok(())
}

type SpanDatum<'a> = &'a ProcessSpan;
type SpanCtx = bool; // Not used

fn format_pid(datum: SpanDatum, _: SpanCtx) -> String {
    datum.pid.to_string()
}

fn format_ppid(datum: SpanDatum, _: SpanCtx) -> String {
    datum.ppid.to_string()
}

fn format_uid(datum: SpanDatum, _: SpanCtx) -> String {
    datum.uid.to_string()
}

fn format_gid(datum: SpanDatum, _: SpanCtx) -> String {
    datum.gid.to_string()
}

fn format_user(datum: SpanDatum, _: SpanCtx) -> String {
    datum.uname.clone()
}

fn format_group(datum: SpanDatum, _: SpanCtx) -> String {
    datum.gname.clone()
}

fn format_first(datum: SpanDatum, _: SpanCtx) -> String {
    datum.first.to_string()
}

fn format_last(datum: SpanDatum, _: SpanCtx) -> String {
    datum.last.to_string()
}

fn format_start(datum: SpanDatum, _: SpanCtx) -> String {
    format_time(datum.first)
}

fn format_end(datum: SpanDatum, _: SpanCtx) -> String {
    format_time(datum.last)
}

fn format_duration(datum: SpanDatum, _: SpanCtx) -> String {
    let minutes = (datum.last - datum.first) / 60;
    format!(
        "{:}d{:2}h{:2}m",
        minutes / (24 * 60),
        (minutes / 60) % 24,
        minutes % 60
    )
}

fn format_command(datum: SpanDatum, _: SpanCtx) -> String {
    datum.cmd.clone()
}

fn format_time(t: Timestamp) -> String {
    match Utc.timestamp_opt(t, 0).single() {
        Some(d) => d.format("%Y-%m-%d %H:%M").to_string(),
        None => t.to_string(),
    }
}

#[cfg(test)]
fn test_reply() -> TimelineReply {
    TimelineReply {
        status: STATUS_OK.to_string(),
        spans: vec![
            ProcessSpan {
                first: 1000000000,
                last: 1000090060,
                pid: 1,
                ppid: 0,
                uid: 0,
                gid: 0,
                uname: "root".to_string(),
                gname: "root".to_string(),
                cmd: "/sbin/init".to_string(),
            },
            ProcessSpan {
                first: 1000001000,
                last: 1000004600,
                pid: 4711,
                ppid: 1,
                uid: 1000,
                gid: 100,
                uname: "larsbent".to_string(),
                gname: "users".to_string(),
                cmd: "python train.py, then eval".to_string(),
            },
        ],
    }
}

#[cfg(test)]
fn print_args(fmt: Option<&str>, csv: bool, no_header: bool, json: bool) -> TimelinePrintArgs {
    TimelinePrintArgs {
        fmt: fmt.map(|s| s.to_string()),
        csv,
        no_header,
        json,
    }
}

#[test]
fn test_print_table() {
    let mut out = vec![];
    print_timeline(&mut out, &print_args(None, false, false, false), &test_reply()).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines.len() == 3);
    assert!(lines[0].starts_with("pid "));
    assert!(lines[1].contains("2001-09-09 01:46"));
    assert!(lines[1].contains("1d 1h 1m"));
    assert!(lines[2].contains("0d 1h 0m"));
    assert!(lines[2].ends_with("python train.py, then eval"));
}

#[test]
fn test_print_csv() {
    let mut out = vec![];
    print_timeline(&mut out, &print_args(Some("pid,user,cmd"), true, false, false), &test_reply())
        .unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text == "1,root,/sbin/init\n4711,larsbent,\"python train.py, then eval\"\n");

    let mut out = vec![];
    print_timeline(&mut out, &print_args(Some("pid,csv,header"), false, false, false), &test_reply())
        .unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text == "pid\n1\n4711\n");
}

#[test]
fn test_print_json() {
    let mut out = vec![];
    print_timeline(&mut out, &print_args(None, false, false, true), &test_reply()).unwrap();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert!(v["status"] == "OK");
    assert!(v["spans"][1]["pid"] == 4711);
    assert!(v["spans"][1]["gname"] == "users");
}

#[test]
fn test_print_errors() {
    let mut out = vec![];
    assert!(print_timeline(&mut out, &print_args(Some("pid,bogus"), false, false, false), &test_reply()).is_err());

    let timed_out = TimelineReply {
        status: "TIMEOUT".to_string(),
        spans: vec![],
    };
    assert!(print_timeline(&mut out, &print_args(None, false, false, false), &timed_out).is_err());
    print_timeline(&mut out, &print_args(None, false, false, true), &timed_out).unwrap();
}
