/// Utilities for building "timelines": the lifetimes of the processes seen in a time range
use crate::bucket::{self, BUCKET_SECONDS};
use crate::record::{parse_record, ProcessRecord};
use crate::segment::{SegmentError, SegmentReader};
use crate::{ProcessSpan, Timestamp, STATUS_OK, STATUS_TIMEOUT};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// Upper bound on the time budget of a timeline query, in seconds.  A budget of 0 means this.

pub const MAX_TIMEOUT_SECONDS: u64 = 86400;

/// Parameters of a timeline query.

#[derive(Debug, Clone)]
pub struct TimelineQuery {
    pub hostname: String,

    /// Inclusive time range of the snapshots to consider.
    pub start: Timestamp,
    pub end: Timestamp,

    /// Sampling interval.  From 10000 up, one file per interval (rounded up to whole buckets) is
    /// read.  Below that, every segment of every bucket is read.
    pub interval: Timestamp,

    /// Drop processes seen for less than this many seconds.
    pub ignore_short_lived: Timestamp,

    /// Drop processes seen for the whole of the observed range.
    pub ignore_resident: bool,

    /// Time budget in seconds, see `effective_timeout`.
    pub timeout: u64,
}

pub enum TimelineOutcome {
    Complete(Vec<ProcessSpan>),
    TimedOut,
}

/// The reply to a timeline query.  `spans` is empty unless `status` is OK.

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineReply {
    pub status: String,
    pub spans: Vec<ProcessSpan>,
}

/// The budget actually used for a requested timeout in seconds: 0 and anything above
/// MAX_TIMEOUT_SECONDS mean MAX_TIMEOUT_SECONDS.

pub fn effective_timeout(seconds: u64) -> Duration {
    if seconds == 0 || seconds > MAX_TIMEOUT_SECONDS {
        Duration::from_secs(MAX_TIMEOUT_SECONDS)
    } else {
        Duration::from_secs(seconds)
    }
}

/// Run a timeline query, see `build_timeline`.  The start of the range must be before its end.

pub fn get_timeline(data_path: &str, query: &TimelineQuery, started: Instant) -> Result<TimelineReply> {
    if query.start >= query.end {
        bail!(
            "Invalid timeline range: start {} is not before end {}",
            query.start,
            query.end
        );
    }
    match build_timeline(data_path, query, started)? {
        TimelineOutcome::Complete(spans) => Ok(TimelineReply {
            status: STATUS_OK.to_string(),
            spans,
        }),
        TimelineOutcome::TimedOut => Ok(TimelineReply {
            status: STATUS_TIMEOUT.to_string(),
            spans: vec![],
        }),
    }
}

/// Read the snapshots for `query.hostname` below `data_path` in the query's time range and fold
/// them into one span per process identity, then apply the query's filters.  The spans are returned
/// in identity-key order.
///
/// Missing, unreadable and malformed files are skipped, as are process lines that do not parse.
/// The elapsed time since `started` is checked after every file; if it exceeds the budget the
/// result is `TimedOut` and the partial data are discarded.  A single file is never interrupted.
///
/// Returns an error only if a file path cannot be constructed, which includes a negative start.

pub fn build_timeline(data_path: &str, query: &TimelineQuery, started: Instant) -> Result<TimelineOutcome> {
    if query.start < 0 {
        bail!("Cannot build a timeline from negative time {}", query.start);
    }
    let budget = effective_timeout(query.timeout);
    let stride = if query.interval >= BUCKET_SECONDS {
        Timestamp::max(BUCKET_SECONDS, bucket::round_up(query.interval))
    } else {
        0
    };

    let mut spans = BTreeMap::<String, ProcessSpan>::new();
    let mut seen: Option<(Timestamp, Timestamp)> = None;
    let mut b = bucket::bucket(query.start);
    let mut segment = 0;
    while b <= query.end {
        let path = bucket::encode_path(data_path, &query.hostname, b, segment)
            .with_context(|| format!("timeline for {}", query.hostname))?;
        let existed = match read_segment(&path, query.start, query.end) {
            Ok(file) => {
                commit(&mut spans, &mut seen, file);
                true
            }
            Err(SegmentError::NotFound { .. }) => false,
            Err(e) => {
                debug!("Skipping {e}");
                true
            }
        };

        let next = if stride > 0 {
            b.checked_add(stride)
        } else if existed {
            // Here the segment number is a sample index within the bucket.
            segment += 1;
            Some(b)
        } else {
            segment = 0;
            b.checked_add(BUCKET_SECONDS)
        };

        if started.elapsed() > budget {
            info!(
                "Timeline for {} timed out after {:?}, at bucket {b}",
                query.hostname, budget
            );
            return Ok(TimelineOutcome::TimedOut);
        }
        match next {
            Some(n) => b = n,
            None => break,
        }
    }

    let (earliest, latest) = match seen {
        Some(x) => x,
        None => return Ok(TimelineOutcome::Complete(vec![])),
    };
    let result = spans
        .into_values()
        .filter(|s| s.last - s.first >= query.ignore_short_lived)
        .filter(|s| !(query.ignore_resident && s.first <= earliest && s.last >= latest))
        .collect::<Vec<ProcessSpan>>();
    Ok(TimelineOutcome::Complete(result))
}

// The spans of one segment file, with the range of block times they came from.
struct FileSpans {
    spans: BTreeMap<String, ProcessSpan>,
    seen: Option<(Timestamp, Timestamp)>,
}

// Fold every process line of every block in [start, end] of one file.  A file that fails partway
// contributes nothing.
fn read_segment(path: &Path, start: Timestamp, end: Timestamp) -> Result<FileSpans, SegmentError> {
    let mut file = FileSpans {
        spans: BTreeMap::new(),
        seen: None,
    };
    let mut reader = SegmentReader::open(path)?;
    reader.read_header()?;
    while let Some(block) = reader.next_block()? {
        if block.timestamp > end {
            // Blocks are in time order.
            break;
        }
        if block.timestamp < start {
            reader.skip_lines(block.count)?;
            continue;
        }
        let t = block.timestamp;
        for _ in 0..block.count {
            let parsed = parse_record(reader.expect_line("record")?);
            match parsed {
                Ok(record) => {
                    let key = record.identity_key();
                    merge_span(&mut file.spans, key, span_of(t, record));
                    file.seen = widen(file.seen, (t, t));
                }
                Err(e) => {
                    debug!("{}:{}: {e}", reader.path().display(), reader.line_number());
                }
            }
        }
    }
    Ok(file)
}

// Files are read in time order, so spans already present keep their ppid, uid and gid.
fn commit(
    spans: &mut BTreeMap<String, ProcessSpan>,
    seen: &mut Option<(Timestamp, Timestamp)>,
    file: FileSpans,
) {
    for (key, span) in file.spans {
        merge_span(spans, key, span);
    }
    if let Some(range) = file.seen {
        *seen = widen(*seen, range);
    }
}

fn widen(
    seen: Option<(Timestamp, Timestamp)>,
    (lo, hi): (Timestamp, Timestamp),
) -> Option<(Timestamp, Timestamp)> {
    match seen {
        None => Some((lo, hi)),
        Some((a, b)) => Some((Timestamp::min(a, lo), Timestamp::max(b, hi))),
    }
}

fn span_of(t: Timestamp, record: ProcessRecord) -> ProcessSpan {
    ProcessSpan {
        first: t,
        last: t,
        pid: record.pid,
        ppid: record.ppid,
        uid: record.uid,
        gid: record.gid,
        uname: record.uname,
        gname: record.gname,
        cmd: record.cmd,
    }
}

fn merge_span(spans: &mut BTreeMap<String, ProcessSpan>, key: String, span: ProcessSpan) {
    match spans.entry(key) {
        Entry::Occupied(mut e) => {
            let s = e.get_mut();
            s.first = Timestamp::min(s.first, span.first);
            s.last = Timestamp::max(s.last, span.last);
        }
        Entry::Vacant(e) => {
            e.insert(span);
        }
    }
}

#[cfg(test)]
use crate::testutil::{process_line, write_gz, write_segment};

#[cfg(test)]
fn query(start: Timestamp, end: Timestamp) -> TimelineQuery {
    TimelineQuery {
        hostname: "h1".to_string(),
        start,
        end,
        interval: 0,
        ignore_short_lived: 0,
        ignore_resident: false,
        timeout: 0,
    }
}

#[cfg(test)]
fn spans_of(outcome: TimelineOutcome) -> Vec<ProcessSpan> {
    match outcome {
        TimelineOutcome::Complete(spans) => spans,
        TimelineOutcome::TimedOut => panic!("Unexpected timeout"),
    }
}

// init runs throughout; the compiler runs from 1000001000 to 1000012000 across two buckets and two
// segments; the editor is seen once.
#[cfg(test)]
fn timeline_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    let init = process_line(1, 0, "root", "/sbin/init");
    let cc = process_line(300, 1000, "larsbent", "cc -O2 big.c");
    let vi = process_line(400, 1000, "larsbent", "vi notes.txt");
    write_segment(
        root,
        "h1",
        1000000000,
        0,
        &[
            (1000000000, &[init.as_str()]),
            (1000001000, &[init.as_str(), cc.as_str()]),
            (1000002000, &[init.as_str(), cc.as_str(), vi.as_str()]),
        ],
    );
    write_segment(
        root,
        "h1",
        1000000000,
        1,
        &[
            (1000005000, &[init.as_str(), cc.as_str(), "not a process line"]),
        ],
    );
    write_segment(
        root,
        "h1",
        1000010000,
        0,
        &[
            (1000012000, &[init.as_str(), cc.as_str()]),
            (1000015000, &[init.as_str()]),
        ],
    );
    dir
}

#[test]
fn test_timeline() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();
    let spans = spans_of(build_timeline(root, &query(1000000000, 1000019999), Instant::now()).unwrap());
    assert!(spans.len() == 3);

    // Key order: "1 root ...", "300 larsbent ...", "400 larsbent ...".
    assert!(spans[0].cmd == "/sbin/init");
    assert!(spans[0].first == 1000000000 && spans[0].last == 1000015000);
    assert!(spans[1].cmd == "cc -O2 big.c");
    assert!(spans[1].first == 1000001000 && spans[1].last == 1000012000);
    assert!(spans[1].uid == 1000 && spans[1].uname == "larsbent");
    assert!(spans[2].first == 1000002000 && spans[2].last == 1000002000);
}

#[test]
fn test_timeline_range() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();

    // Blocks outside the range are not merged.
    let spans = spans_of(build_timeline(root, &query(1000001500, 1000012000), Instant::now()).unwrap());
    assert!(spans.len() == 3);
    assert!(spans[0].first == 1000002000 && spans[0].last == 1000012000);
    assert!(spans[1].first == 1000002000 && spans[1].last == 1000012000);

    // Nothing at all in the range.
    let spans = spans_of(build_timeline(root, &query(1000020000, 1000090000), Instant::now()).unwrap());
    assert!(spans.is_empty());
}

#[test]
fn test_timeline_idempotent() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();
    let q = query(1000000000, 1000019999);
    let a = spans_of(build_timeline(root, &q, Instant::now()).unwrap());
    let b = spans_of(build_timeline(root, &q, Instant::now()).unwrap());
    assert!(a == b);
}

#[test]
fn test_timeline_filters() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();

    let mut q = query(1000000000, 1000019999);
    q.ignore_short_lived = 999999;
    assert!(spans_of(build_timeline(root, &q, Instant::now()).unwrap()).is_empty());

    // The editor was seen only once.
    q.ignore_short_lived = 1;
    let spans = spans_of(build_timeline(root, &q, Instant::now()).unwrap());
    assert!(spans.len() == 2);
    assert!(spans.iter().all(|s| s.cmd != "vi notes.txt"));

    // init covers the whole observed range.
    q.ignore_short_lived = 0;
    q.ignore_resident = true;
    let spans = spans_of(build_timeline(root, &q, Instant::now()).unwrap());
    assert!(spans.len() == 2);
    assert!(spans.iter().all(|s| s.cmd != "/sbin/init"));
}

#[test]
fn test_timeline_interval() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();

    // With a bucket-sized interval only segment 0 of each bucket is read, so the 1000005000
    // sample in segment 1 does not contribute.  The stride is rounded up to whole buckets, so 15000
    // steps from bucket 1000000000 straight past the end of the range.
    let mut q = query(1000000000, 1000019999);
    q.interval = 10000;
    let spans = spans_of(build_timeline(root, &q, Instant::now()).unwrap());
    assert!(spans.len() == 3);
    assert!(spans[1].first == 1000001000 && spans[1].last == 1000012000);

    q.interval = 15000;
    let spans = spans_of(build_timeline(root, &q, Instant::now()).unwrap());
    assert!(spans.len() == 3);
    assert!(spans[0].last == 1000002000);
}

#[test]
fn test_timeline_skips_bad_files() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();
    let path = crate::encode_path(root, "h1", 1000020000, 0).unwrap();
    write_gz(&path, "Version 1.0\nnot a number\n");
    let spans = spans_of(build_timeline(root, &query(1000000000, 1000029999), Instant::now()).unwrap());
    assert!(spans.len() == 3);
}

#[test]
fn test_timeline_identity_quirk() {
    // Same pid, user, group and command but a different uid: folded into one span, keeping the
    // first uid seen.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    let a = "77 1 1000 alice 100 users 0 0 0 ./worker";
    let b = "77 5 2000 alice 100 users 0 0 0 ./worker";
    write_segment(root, "h1", 1000000000, 0, &[(1000000100, &[a]), (1000000200, &[b])]);
    let spans = spans_of(build_timeline(root, &query(1000000000, 1000009999), Instant::now()).unwrap());
    assert!(spans.len() == 1);
    assert!(spans[0].first == 1000000100 && spans[0].last == 1000000200);
    assert!(spans[0].uid == 1000 && spans[0].ppid == 1);
}

#[test]
fn test_timeline_timeout() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();
    let mut q = query(1000000000, 1000019999);
    q.timeout = 1;
    let started = Instant::now();
    std::thread::sleep(Duration::from_millis(1100));
    assert!(matches!(
        build_timeline(root, &q, started).unwrap(),
        TimelineOutcome::TimedOut
    ));

    let r = get_timeline(root, &q, started).unwrap();
    assert!(r.status == "TIMEOUT");
    assert!(r.spans.is_empty());
}

#[test]
fn test_get_timeline() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();
    let r = get_timeline(root, &query(1000000000, 1000019999), Instant::now()).unwrap();
    assert!(r.status == "OK");
    assert!(r.spans.len() == 3);

    // The range must be non-empty.
    assert!(get_timeline(root, &query(1000019999, 1000019999), Instant::now()).is_err());
    assert!(get_timeline(root, &query(1000019999, 1000000000), Instant::now()).is_err());

    let v = serde_json::to_value(&r).unwrap();
    assert!(v["spans"][0]["pid"] == 1);
    assert!(v["spans"][0]["uname"] == "root");
}

#[test]
fn test_effective_timeout() {
    assert!(effective_timeout(0) == Duration::from_secs(86400));
    assert!(effective_timeout(30) == Duration::from_secs(30));
    assert!(effective_timeout(100000) == Duration::from_secs(86400));
}

#[test]
fn test_timeline_partial_file() {
    // A file that goes bad after its first block contributes nothing, not even that block.
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();
    let ghost = process_line(999, 1000, "larsbent", "ghost");
    let path = crate::encode_path(root, "h1", 1000020000, 0).unwrap();
    write_gz(
        &path,
        &format!("Version 1.0\n1000029000\n1000021000\n1\n{ghost}\n1000029000\n3\n{ghost}\n"),
    );
    let spans = spans_of(build_timeline(root, &query(1000000000, 1000029999), Instant::now()).unwrap());
    assert!(spans.len() == 3);
    assert!(spans.iter().all(|s| s.cmd != "ghost"));
    assert!(spans[0].last == 1000015000);

    // The observed range is not widened by the bad file either: init still spans all of it.
    let mut q = query(1000000000, 1000029999);
    q.ignore_resident = true;
    let spans = spans_of(build_timeline(root, &q, Instant::now()).unwrap());
    assert!(spans.iter().all(|s| s.cmd != "/sbin/init"));
}

#[test]
fn test_timeline_non_utf8() {
    // A bad byte in a command line does not lose the lines after it.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    let path = crate::encode_path(root, "h1", 1000000000, 0).unwrap();
    crate::testutil::write_gz_bytes(
        &path,
        b"Version 1.0\n1000000200\n1000000100\n2\n7 1 0 root 0 root 0 0 0 caf\xe9\n\
          8 1 0 root 0 root 0 0 0 sshd\n1000000200\n1\n8 1 0 root 0 root 0 0 0 sshd\n",
    );
    let spans = spans_of(build_timeline(root, &query(1000000000, 1000009999), Instant::now()).unwrap());
    assert!(spans.len() == 2);
    assert!(spans[0].cmd == "caf\u{FFFD}");
    assert!(spans[1].cmd == "sshd");
    assert!(spans[1].first == 1000000100 && spans[1].last == 1000000200);
}

#[test]
fn test_timeline_extreme_range() {
    let dir = timeline_tree();
    let root = dir.path().to_str().unwrap();
    assert!(build_timeline(root, &query(Timestamp::MIN, 1000000000), Instant::now()).is_err());

    // Times past what the calendar can name are an error, not a wrapped bucket walk.
    let mut q = query(Timestamp::MAX - 5, Timestamp::MAX);
    q.interval = 10000;
    assert!(build_timeline(root, &q, Instant::now()).is_err());
}
