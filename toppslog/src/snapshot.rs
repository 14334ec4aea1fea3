// Extract one snapshot from a segment file, and the point-in-time query that combines the locator
// and the extractor.

use crate::flush::Flusher;
use crate::locate::{locate, LocateOptions};
use crate::segment::{BlockHeader, SegmentError, SegmentReader};
use crate::{Timestamp, STATUS_NOT_FOUND, STATUS_OK};
use anyhow::{bail, Result};
use log::debug;
use serde::Serialize;
use std::path::Path;

/// One snapshot: its time and its process lines, verbatim.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub timestamp: Timestamp,
    pub records: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    Snapshot(Snapshot),

    /// The file has no snapshot at the requested time but does have one at this earlier time;
    /// extract again with that time.
    Retry(Timestamp),
}

/// Extract the snapshot at `target` from the segment file at `path`, in one pass over the file.
///
/// - A block with exactly the target time is always taken.
/// - If `prefer_next` is true and there is no such block, the first block after the target is
///   taken.
/// - If `prefer_next` is false and the target is past the end of the file, the file's last block is
///   taken.  Otherwise, when the read passes the target without an exact match, the result is
///   `Retry` with the time of the block before the target, or an error if there is none.
///
/// Reading stops as soon as the snapshot is complete.  It is an error if the file has no suitable
/// block.

pub fn extract(path: &Path, target: Timestamp, prefer_next: bool) -> Result<Extract, SegmentError> {
    let mut reader = SegmentReader::open(path)?;
    let header = reader.read_header()?;
    let want_final = !prefer_next && target > header.last;

    let mut previous: Option<Timestamp> = None;
    let mut final_block: Option<Snapshot> = None;
    while let Some(block) = reader.next_block()? {
        let exact = block.timestamp == target;
        let next_available = prefer_next
            && target < block.timestamp
            && previous.map_or(true, |p| p < target);
        if exact || next_available {
            return Ok(Extract::Snapshot(read_snapshot(&mut reader, block)?));
        }
        if want_final {
            // A block is known to be the last one only once the stream ends, so keep each one.
            final_block = Some(read_snapshot(&mut reader, block)?);
        } else {
            if !prefer_next && block.timestamp > target {
                return match previous {
                    Some(p) => Ok(Extract::Retry(p)),
                    None => Err(SegmentError::NoSnapshot {
                        path: path.to_path_buf(),
                        timestamp: target,
                    }),
                };
            }
            reader.skip_lines(block.count)?;
        }
        previous = Some(block.timestamp);
    }

    match final_block {
        Some(snapshot) => Ok(Extract::Snapshot(snapshot)),
        None => Err(SegmentError::NoSnapshot {
            path: path.to_path_buf(),
            timestamp: target,
        }),
    }
}

fn read_snapshot(reader: &mut SegmentReader, block: BlockHeader) -> Result<Snapshot, SegmentError> {
    // The count is from disk, it only bounds the loop.
    let mut records = vec![];
    for _ in 0..block.count {
        records.push(reader.expect_line("record")?.to_string());
    }
    Ok(Snapshot {
        timestamp: block.timestamp,
        records,
    })
}

/// The reply to a snapshot query.  `tm` and `records` are meaningful only when `status` is OK.

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReply {
    pub status: String,
    pub tm: Timestamp,
    pub records: Vec<String>,
}

impl SnapshotReply {
    fn ok(snapshot: Snapshot) -> SnapshotReply {
        SnapshotReply {
            status: STATUS_OK.to_string(),
            tm: snapshot.timestamp,
            records: snapshot.records,
        }
    }

    fn not_found() -> SnapshotReply {
        SnapshotReply {
            status: STATUS_NOT_FOUND.to_string(),
            tm: 0,
            records: vec![],
        }
    }
}

/// Find the snapshot for `hostname` nearest to `timestamp` in the direction of `end_timestamp`: the
/// first one at or after `timestamp` if `timestamp <= end_timestamp`, otherwise the last one at or
/// before it.  Snapshots outside the range between the two times are not returned.
///
/// A query that finds nothing is answered with status "not found".  Errors are internal failures
/// of the search, see `locate`.

pub fn get_snapshot(
    data_path: &str,
    hostname: &str,
    timestamp: Timestamp,
    end_timestamp: Timestamp,
    flusher: &dyn Flusher,
    options: &LocateOptions,
) -> Result<SnapshotReply> {
    let forward = timestamp <= end_timestamp;
    let coordinate = match locate(data_path, hostname, timestamp, end_timestamp, flusher, options)? {
        Some(c) => c,
        None => return Ok(SnapshotReply::not_found()),
    };
    let path = coordinate.path(data_path)?;

    // A retry names an exact block time, so one retry always settles on a well-formed file.
    let mut at = timestamp;
    let mut prefer_next = forward;
    let snapshot = loop {
        match extract(&path, at, prefer_next) {
            Ok(Extract::Snapshot(s)) => break s,
            Ok(Extract::Retry(t)) if at == timestamp => {
                at = t;
                prefer_next = false;
            }
            Ok(Extract::Retry(t)) => {
                bail!(
                    "{}: snapshot lookup for {timestamp} did not settle ({at}, then {t})",
                    path.display()
                )
            }
            Err(e) => {
                debug!("No snapshot: {e}");
                return Ok(SnapshotReply::not_found());
            }
        }
    };

    let (lo, hi) = if forward {
        (timestamp, end_timestamp)
    } else {
        (end_timestamp, timestamp)
    };
    if snapshot.timestamp < lo || snapshot.timestamp > hi {
        debug!(
            "Nearest snapshot {} for {hostname} is outside [{lo}, {hi}]",
            snapshot.timestamp
        );
        return Ok(SnapshotReply::not_found());
    }
    Ok(SnapshotReply::ok(snapshot))
}

#[cfg(test)]
use crate::testutil::{segment_text, write_gz, write_segment};

#[cfg(test)]
fn three_blocks() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.gz");
    write_gz(
        &path,
        &segment_text(&[
            (100, &["a1", "a2"]),
            (200, &["b1", "b2", "b3"]),
            (300, &["c1"]),
        ]),
    );
    (dir, path)
}

#[cfg(test)]
fn snapshot_of(x: Extract) -> Snapshot {
    match x {
        Extract::Snapshot(s) => s,
        Extract::Retry(t) => panic!("Unexpected retry at {t}"),
    }
}

#[test]
fn test_extract_exact() {
    let (_dir, path) = three_blocks();
    for prefer_next in [false, true] {
        let s = snapshot_of(extract(&path, 200, prefer_next).unwrap());
        assert!(s.timestamp == 200);
        assert!(s.records == vec!["b1", "b2", "b3"]);
    }
    let s = snapshot_of(extract(&path, 100, false).unwrap());
    assert!(s.records == vec!["a1", "a2"]);
}

#[test]
fn test_extract_next() {
    let (_dir, path) = three_blocks();
    let s = snapshot_of(extract(&path, 150, true).unwrap());
    assert!(s.timestamp == 200);
    assert!(s.records == vec!["b1", "b2", "b3"]);

    // Before the first block, the first block is next.
    let s = snapshot_of(extract(&path, 50, true).unwrap());
    assert!(s.timestamp == 100);

    // After the last block there is no next.
    assert!(matches!(
        extract(&path, 350, true),
        Err(SegmentError::NoSnapshot { .. })
    ));
}

#[test]
fn test_extract_previous() {
    let (_dir, path) = three_blocks();
    assert!(extract(&path, 150, false).unwrap() == Extract::Retry(100));
    assert!(extract(&path, 250, false).unwrap() == Extract::Retry(200));

    // Past the end, the last block is taken directly.
    let s = snapshot_of(extract(&path, 400, false).unwrap());
    assert!(s.timestamp == 300);
    assert!(s.records == vec!["c1"]);

    // Nothing before the first block.
    assert!(matches!(
        extract(&path, 50, false),
        Err(SegmentError::NoSnapshot { .. })
    ));
}

#[test]
fn test_extract_stops_early() {
    // The damage after the wanted block is never read.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.gz");
    write_gz(&path, "Version 1.0\n300\n100\n1\na\n200\n1\nb\nbogus\n");
    let s = snapshot_of(extract(&path, 200, false).unwrap());
    assert!(s.records == vec!["b"]);
    assert!(extract(&path, 300, false).is_err());
}

#[test]
fn test_extract_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.gz");
    write_gz(&path, "Version 1.0\n200\n100\n1\na\n200\n3\nb\n");
    assert!(matches!(
        extract(&path, 200, true),
        Err(SegmentError::Syntax { .. })
    ));
}

#[test]
fn test_extract_bad_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.gz");
    write_gz(&path, "Version 1.0\n200\n100\n1000000000000000000\na\n");
    assert!(matches!(
        extract(&path, 100, false),
        Err(SegmentError::Syntax { .. })
    ));
    assert!(matches!(
        extract(&path, 50, true),
        Err(SegmentError::Syntax { .. })
    ));

    let path = dir.path().join("t.gz");
    write_gz(&path, "Version 1.0\n200\n100\n-1\na\n");
    assert!(matches!(
        extract(&path, 100, false),
        Err(SegmentError::Syntax { .. })
    ));
}

#[cfg(test)]
fn end_to_end_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    let p1 = crate::testutil::process_line(1, 0, "root", "/sbin/init");
    let p2 = crate::testutil::process_line(4711, 1000, "larsbent", "python train.py");
    write_segment(
        root,
        "h1",
        1000000000,
        0,
        &[
            (1000000000, &[p1.as_str()]),
            (1000005000, &[p1.as_str(), p2.as_str()]),
            (1000009999, &[p1.as_str()]),
        ],
    );
    dir
}

#[cfg(test)]
fn quick() -> LocateOptions {
    LocateOptions {
        flush_retries: 1,
        flush_poll: std::time::Duration::from_millis(1),
    }
}

#[test]
fn test_get_snapshot() {
    let dir = end_to_end_tree();
    let root = dir.path().to_str().unwrap();
    let flush = crate::flush::no_flush;

    let r = get_snapshot(root, "h1", 1000005000, 1000005000, &flush, &quick()).unwrap();
    assert!(r.status == "OK");
    assert!(r.tm == 1000005000);
    assert!(r.records.len() == 2);
    assert!(r.records[1].starts_with("4711 1 1000 larsbent"));

    let r = get_snapshot(root, "h1", 999999999, 999999999, &flush, &quick()).unwrap();
    assert!(r.status == "not found");
    assert!(r.records.is_empty());

    // Unknown host
    let r = get_snapshot(root, "h2", 1000005000, 1000005000, &flush, &quick()).unwrap();
    assert!(r.status == "not found");
}

#[test]
fn test_get_snapshot_directions() {
    let dir = end_to_end_tree();
    let root = dir.path().to_str().unwrap();
    let flush = crate::flush::no_flush;

    // Forward: the next snapshot at or after the time.
    let r = get_snapshot(root, "h1", 1000004000, 1000006000, &flush, &quick()).unwrap();
    assert!(r.status == "OK" && r.tm == 1000005000);

    // Backward: the last snapshot at or before the time, through the retry.
    let r = get_snapshot(root, "h1", 1000007000, 1000004000, &flush, &quick()).unwrap();
    assert!(r.status == "OK" && r.tm == 1000005000);

    // Backward from after the file: its last snapshot.
    let r = get_snapshot(root, "h1", 1000012000, 1000000000, &flush, &quick()).unwrap();
    assert!(r.status == "OK" && r.tm == 1000009999);

    // Forward from before the file: its first snapshot.
    let r = get_snapshot(root, "h1", 999995000, 1000001000, &flush, &quick()).unwrap();
    assert!(r.status == "OK" && r.tm == 1000000000);

    // The nearest snapshot is outside the range.
    let r = get_snapshot(root, "h1", 1000001000, 1000002000, &flush, &quick()).unwrap();
    assert!(r.status == "not found");
}

#[test]
fn test_snapshot_reply_json() {
    let dir = end_to_end_tree();
    let root = dir.path().to_str().unwrap();
    let r = get_snapshot(root, "h1", 1000009999, 1000009999, &crate::flush::no_flush, &quick())
        .unwrap();
    let v = serde_json::to_value(&r).unwrap();
    assert!(v["status"] == "OK");
    assert!(v["tm"] == 1000009999);
    assert!(v["records"][0] == "1 1 0 root 0 root 0 100 2048 /sbin/init");
}

#[test]
fn test_get_snapshot_non_utf8() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    let path = crate::encode_path(root, "h1", 1000000000, 0).unwrap();
    crate::testutil::write_gz_bytes(
        &path,
        b"Version 1.0\n1000005000\n1000005000\n2\n1 0 0 root 0 root 0 0 0 init\n\
          77 1 0 root 0 root 0 0 0 caf\xe9 --x\n",
    );
    let r = get_snapshot(root, "h1", 1000005000, 1000005000, &crate::flush::no_flush, &quick())
        .unwrap();
    assert!(r.status == "OK");
    assert!(r.records.len() == 2);
    assert!(r.records[1] == "77 1 0 root 0 root 0 0 0 caf\u{FFFD} --x");
}
