// Bucket arithmetic and file naming for a topps data tree.
//
// The tree for one host looks like this, for a bucket timestamp AABBCC0000:
//
//    let file_name = format!("{}/{}/{}/{}/{}-{}.gz", data_path, hostname, AA, AABB, AABBCC0000, segment);
//
// Each directory level narrows the time range by two decimal digits, and each file holds data for
// at most one 10000-second bucket.  A bucket that the writer rotated several times has segments 0,
// 1, 2, ...; segment 0 is always the first one written.

use crate::Timestamp;
use anyhow::{bail, Result};
use chrono::{Local, TimeZone};
use std::path::PathBuf;

/// Width of a bucket in seconds.

pub const BUCKET_SECONDS: Timestamp = 10000;

/// Return the start of the bucket that contains `t`.  Saturates at the bottom of the range.

pub fn bucket(t: Timestamp) -> Timestamp {
    t.div_euclid(BUCKET_SECONDS).saturating_mul(BUCKET_SECONDS)
}

/// Round `t` up to the nearest bucket boundary, or down to the last one at the top of the range.

pub fn round_up(t: Timestamp) -> Timestamp {
    bucket(t.saturating_add(BUCKET_SECONDS - 1))
}

/// Return the path of segment `segment` of the bucket containing `t` for `hostname`, below
/// `data_path`.  An empty `data_path` yields a path relative to the current directory.
///
/// This returns an error if the timestamp is negative, cannot be represented as a local time, or is
/// too small to fill the two directory levels.  It does not touch the file system.

pub fn encode_path(data_path: &str, hostname: &str, t: Timestamp, segment: u32) -> Result<PathBuf> {
    if t < 0 {
        bail!("Cannot encode negative timestamp {t}");
    }

    // The writer renders the time through the local time zone, so we do too; "%s" brings it back to
    // epoch seconds.
    let digits = match Local.timestamp_opt(bucket(t), 0).single() {
        Some(local) => local.format("%s").to_string(),
        None => bail!("Timestamp {t} has no local time representation"),
    };
    if digits.len() < 6 {
        bail!("Timestamp {t} is too small to encode");
    }

    let mut p = PathBuf::from(data_path);
    p.push(hostname);
    p.push(&digits[..2]);
    p.push(&digits[..4]);
    p.push(format!("{digits}-{segment}.gz"));
    Ok(p)
}

/// Return the highest segment number present for the bucket `b`, or None if the bucket has no
/// segment 0.  Only the file names are examined.

pub fn last_segment(data_path: &str, hostname: &str, b: Timestamp) -> Result<Option<u32>> {
    let mut last = None;
    let mut segment = 0;
    while encode_path(data_path, hostname, b, segment)?.is_file() {
        last = Some(segment);
        segment += 1;
    }
    Ok(last)
}

#[test]
fn test_bucket() {
    assert!(bucket(1000005000) == 1000000000);
    assert!(bucket(1000009999) == 1000000000);
    assert!(bucket(1000010000) == 1000010000);
    assert!(bucket(999999999) == 999990000);
    assert!(bucket(-1) == -10000);

    assert!(round_up(1) == 10000);
    assert!(round_up(10000) == 10000);
    assert!(round_up(25000) == 30000);

    // No overflow at the ends of the range.
    assert!(bucket(Timestamp::MAX) == 9223372036854770000);
    assert!(bucket(Timestamp::MIN) == Timestamp::MIN);
    assert!(round_up(Timestamp::MAX) == 9223372036854770000);
}

#[test]
fn test_encode_path() {
    let p = encode_path("/data/topps", "h1", 1000005000, 0).unwrap();
    assert!(p == PathBuf::from("/data/topps/h1/10/1000/1000000000-0.gz"));

    let p = encode_path("/data/topps", "h1", 1234567890, 3).unwrap();
    assert!(p == PathBuf::from("/data/topps/h1/12/1234/1234560000-3.gz"));

    // Empty data path means the current directory.
    let p = encode_path("", "h1", 1000005000, 2).unwrap();
    assert!(p == PathBuf::from("h1/10/1000/1000000000-2.gz"));

    // Nine-digit times keep the bucket as the file stem.
    let p = encode_path("", "h1", 999999999, 0).unwrap();
    assert!(p == PathBuf::from("h1/99/9999/999990000-0.gz"));
}

#[test]
fn test_encode_path_errors() {
    assert!(encode_path("", "h1", -5, 0).is_err());
    assert!(encode_path("", "h1", 12345, 0).is_err());
    assert!(encode_path("", "h1", Timestamp::MAX, 0).is_err());
}

#[test]
fn test_last_segment() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    assert!(last_segment(root, "h1", 1000000000).unwrap().is_none());

    crate::testutil::write_segment(root, "h1", 1000000000, 0, &[(1000000100, &["a"])]);
    crate::testutil::write_segment(root, "h1", 1000000000, 1, &[(1000000200, &["b"])]);
    assert!(last_segment(root, "h1", 1000000000).unwrap() == Some(1));

    // A hole ends the run of segments.
    crate::testutil::write_segment(root, "h1", 1000000000, 3, &[(1000000400, &["d"])]);
    assert!(last_segment(root, "h1", 1000000000).unwrap() == Some(1));
}
