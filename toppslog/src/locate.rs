// Find the segment file that holds, or is nearest to, a point in time.
//
// The search walks (bucket, segment) positions outward from the target, probing each file's header
// for its time range.  A forward search (target <= end) wants the earliest data at or after the
// target, so it starts one bucket before the target and walks forward through it; a backward
// search wants the latest data at or before the target and starts at the target's bucket.  The
// direction of the walk follows the sign of the most recent probe, and the walk ends when it turns
// back onto positions it has already visited, leaves its bounds, or finds a file containing the
// target.
//
// Files are sparse: buckets may be missing entirely, and segments 1, 2, ... exist only when the
// writer rotated the bucket.  The newest data may not be on disk yet, so a forward search that runs
// into two missing files asks the writer to flush (once) and waits a little for the file to show
// up.
//
// Every probe counts against a watchdog.  Running out of probes is an error, never "not found",
// since it means the tree is in a state the search does not understand.

use crate::bucket::{self, BUCKET_SECONDS};
use crate::flush::Flusher;
use crate::segment::{self, SegmentError};
use crate::{Coordinate, Timestamp};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::cmp::{max, min};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Maximum number of probes in one search.

pub const WATCHDOG_LIMIT: usize = 100;

/// Component name passed to the flusher.

pub const FLUSH_COMPONENT: &str = "write_top";

// A backward search may look this far past the target for the file holding it...
const BACKWARD_LOOKAHEAD: Timestamp = BUCKET_SECONDS;

// ...and this far before the end of the range.  Scanning further back through old files is not
// allowed.
const BACKWARD_LOOKBEHIND: Timestamp = 86400;

/// Tuning for the wait after a flush request.

#[derive(Debug, Clone)]
pub struct LocateOptions {
    /// Number of times to look for the flushed file.
    pub flush_retries: u32,

    /// Pause between looks.
    pub flush_poll: Duration,
}

impl Default for LocateOptions {
    fn default() -> LocateOptions {
        LocateOptions {
            flush_retries: 10,
            flush_poll: Duration::from_secs(1),
        }
    }
}

// (bucket start, segment).  The tuple order is time order.
type Position = (Timestamp, u32);

enum Step {
    Continue,
    Found(Position),
    Exhausted,
}

struct SearchState<'a> {
    data_path: &'a str,
    hostname: &'a str,
    target: Timestamp,

    // Polarity of the search, fixed.
    forward: bool,
    max_distance: Timestamp,

    // Bucket bounds of the walk, inclusive.
    lower: Timestamp,
    upper: Timestamp,

    // Direction of the walk, follows the probes.
    moving_forward: bool,
    current: Position,

    // Best acceptable candidate so far, with its absolute distance.
    best: Option<(Timestamp, Position)>,
    satisfied: bool,

    // Visited positions are all within [low, high].
    low: Position,
    high: Position,

    // Consecutive missing files while moving forward, and the first of them.
    misses: u32,
    checkpoint: Option<Position>,
    flush_attempted: bool,

    iterations: usize,
}

/// Locate the file for `hostname` below `data_path` that contains `target`, or failing that the
/// nearest file in the direction of `end`: the first file after the target if `target <= end`,
/// otherwise the last file before it.  Files further than |target - end| from the target are not
/// considered.
///
/// Returns None if there is no such file.  Returns an error if either time is negative, a path
/// cannot be constructed, or the search does not converge within WATCHDOG_LIMIT probes.
/// Unreadable and malformed files are skipped.

pub fn locate(
    data_path: &str,
    hostname: &str,
    target: Timestamp,
    end: Timestamp,
    flusher: &dyn Flusher,
    options: &LocateOptions,
) -> Result<Option<Coordinate>> {
    if target < 0 || end < 0 {
        bail!("locate {target} for {hostname}: negative time in range [{target}, {end}]");
    }
    let mut state = SearchState::new(data_path, hostname, target, end);
    loop {
        match state.step(flusher, options)? {
            Step::Continue => {}
            Step::Found((b, segment)) => {
                debug!("Located {target} for {hostname} in {b}-{segment}");
                return Ok(Some(Coordinate::new(hostname, b, segment)));
            }
            Step::Exhausted => break,
        }
    }
    debug!(
        "Search for {target} for {hostname} ended after {} probes, satisfied={}",
        state.iterations, state.satisfied
    );
    Ok(state
        .best
        .map(|(_, (b, segment))| Coordinate::new(hostname, b, segment)))
}

impl<'a> SearchState<'a> {
    fn new(data_path: &'a str, hostname: &'a str, target: Timestamp, end: Timestamp) -> Self {
        let forward = target <= end;
        let start = if forward {
            bucket::bucket(target) - BUCKET_SECONDS
        } else {
            bucket::bucket(target)
        };
        let (lower, upper) = if forward {
            (start, bucket::bucket(end))
        } else {
            (
                bucket::bucket(end.saturating_sub(BACKWARD_LOOKBEHIND)),
                bucket::bucket(target.saturating_add(BACKWARD_LOOKAHEAD)),
            )
        };
        SearchState {
            data_path,
            hostname,
            target,
            forward,
            max_distance: (target - end).abs(),
            lower,
            upper,
            moving_forward: forward,
            current: (start, 0),
            best: None,
            satisfied: false,
            low: (start, 0),
            high: (start, 0),
            misses: 0,
            checkpoint: None,
            flush_attempted: false,
            iterations: 0,
        }
    }

    fn path(&self, (b, segment): Position) -> Result<PathBuf> {
        bucket::encode_path(self.data_path, self.hostname, b, segment).with_context(|| {
            format!(
                "locate {} for {}: probe {}",
                self.target, self.hostname, self.iterations
            )
        })
    }

    fn step(&mut self, flusher: &dyn Flusher, options: &LocateOptions) -> Result<Step> {
        self.iterations += 1;
        if self.iterations > WATCHDOG_LIMIT {
            bail!(
                "locate {} for {}: no result after {WATCHDOG_LIMIT} probes, stopped at {:?}",
                self.target,
                self.hostname,
                self.current
            );
        }

        let path = self.path(self.current)?;
        match segment::probe(&path, self.target) {
            Err(SegmentError::NotFound { .. }) => {
                if self.moving_forward {
                    if self.misses == 0 {
                        self.checkpoint = Some(self.current);
                    }
                    self.misses += 1;
                    if self.forward && self.misses >= 2 && !self.flush_attempted && !self.satisfied {
                        self.flush_attempted = true;
                        if let Some(checkpoint) = self.checkpoint {
                            if self.flush_and_wait(flusher, options, checkpoint)? {
                                // Rescan from the first missing file, forgetting what we saw past it.
                                self.current = checkpoint;
                                self.high = checkpoint;
                                self.misses = 0;
                                return Ok(Step::Continue);
                            }
                        }
                    }
                }
                let next = self.next_position(false)?;
                Ok(self.advance(next))
            }
            Err(e) => {
                debug!("Skipping {e}");
                self.misses = 0;
                let next = self.next_position(true)?;
                Ok(self.advance(next))
            }
            Ok(0) => Ok(Step::Found(self.current)),
            Ok(distance) => {
                self.misses = 0;
                self.consider(distance);
                self.moving_forward = distance > 0;
                let next = self.next_position(true)?;
                Ok(self.advance(next))
            }
        }
    }

    // Record the current file as the best candidate if it is on the correct side of the target, no
    // further away than the best so far, and within the range.
    fn consider(&mut self, distance: Timestamp) {
        let on_our_side = if self.forward {
            distance < 0
        } else {
            distance > 0
        };
        let d = distance.abs();
        if !on_our_side || d > self.max_distance {
            return;
        }
        if let Some((best, _)) = self.best {
            if d > best {
                return;
            }
        }
        self.best = Some((d, self.current));
        if d < self.max_distance {
            self.satisfied = true;
        }
    }

    fn next_position(&self, existed: bool) -> Result<Position> {
        let (b, segment) = self.current;
        if self.moving_forward {
            if existed {
                Ok((b, segment + 1))
            } else {
                Ok((b.saturating_add(BUCKET_SECONDS), 0))
            }
        } else if segment > 0 {
            Ok((b, segment - 1))
        } else {
            let previous = b - BUCKET_SECONDS;
            let last = bucket::last_segment(self.data_path, self.hostname, previous)
                .with_context(|| format!("locate {} for {}", self.target, self.hostname))?;
            Ok((previous, last.unwrap_or(0)))
        }
    }

    fn advance(&mut self, next: Position) -> Step {
        if self.low <= next && next <= self.high {
            // Turned around onto ground already covered.
            return Step::Exhausted;
        }
        if next.0 < self.lower || next.0 > self.upper {
            return Step::Exhausted;
        }
        self.current = next;
        self.low = min(self.low, next);
        self.high = max(self.high, next);
        Step::Continue
    }

    // Ask the writer to flush, then poll for the checkpoint file or the current file to appear.
    // Returns true if one of them did.
    fn flush_and_wait(
        &self,
        flusher: &dyn Flusher,
        options: &LocateOptions,
        checkpoint: Position,
    ) -> Result<bool> {
        info!("Requesting flush of {FLUSH_COMPONENT} for {}", self.hostname);
        let status = flusher.request_flush(FLUSH_COMPONENT, 0, self.hostname);
        if status != 0 {
            warn!(
                "Flush of {FLUSH_COMPONENT} for {} returned status {status}",
                self.hostname
            );
        }
        let candidates = [self.path(checkpoint)?, self.path(self.current)?];
        for _ in 0..options.flush_retries {
            if candidates.iter().any(|p| p.is_file()) {
                return Ok(true);
            }
            thread::sleep(options.flush_poll);
        }
        Ok(candidates.iter().any(|p| p.is_file()))
    }
}

#[cfg(test)]
use crate::flush::no_flush;
#[cfg(test)]
use crate::testutil::write_segment;

#[cfg(test)]
fn quick() -> LocateOptions {
    LocateOptions {
        flush_retries: 2,
        flush_poll: Duration::from_millis(1),
    }
}

#[cfg(test)]
fn locate_in(root: &str, target: Timestamp, end: Timestamp) -> Result<Option<Coordinate>> {
    locate(root, "h1", target, end, &no_flush, &quick())
}

#[test]
fn test_locate_exact() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    write_segment(root, "h1", 1000000000, 0, &[(1000000100, &["a"]), (1000004000, &["b"])]);
    write_segment(root, "h1", 1000000000, 1, &[(1000005000, &["c"]), (1000009000, &["d"])]);

    // Forward and backward, contained in segment 0 and segment 1.
    for (target, end, segment) in [
        (1000000500, 1000009999, 0),
        (1000000500, 1000000000, 0),
        (1000006000, 1000009999, 1),
        (1000006000, 1000000000, 1),
        (1000009000, 1000009000, 1),
    ] {
        let c = locate_in(root, target, end).unwrap().unwrap();
        assert!(c == Coordinate::new("h1", 1000000000, segment));
    }
}

#[test]
fn test_locate_nearest() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    write_segment(root, "h1", 1000000000, 0, &[(1000002000, &["a"]), (1000003000, &["b"])]);
    write_segment(root, "h1", 1000020000, 0, &[(1000021000, &["c"]), (1000022000, &["d"])]);

    // Forward from before the first file finds it.
    let c = locate_in(root, 1000000500, 1000005000).unwrap().unwrap();
    assert!(c == Coordinate::new("h1", 1000000000, 0));

    // Forward from the gap between the files finds the later one, across an empty bucket.
    let c = locate_in(root, 1000005000, 1000030000).unwrap().unwrap();
    assert!(c == Coordinate::new("h1", 1000020000, 0));

    // Backward from the gap finds the earlier one.
    let c = locate_in(root, 1000015000, 1000000000).unwrap().unwrap();
    assert!(c == Coordinate::new("h1", 1000000000, 0));

    // Backward from inside the later bucket, before its data, steps back into the earlier bucket.
    let c = locate_in(root, 1000020500, 1000001000).unwrap().unwrap();
    assert!(c == Coordinate::new("h1", 1000000000, 0));

    // Nothing within range.
    assert!(locate_in(root, 1000005000, 1000006000).unwrap().is_none());
    assert!(locate_in(root, 1000015000, 1000010000).unwrap().is_none());
}

#[test]
fn test_locate_symmetric() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    write_segment(root, "h1", 1000000000, 0, &[(1000002000, &["a"]), (1000003000, &["b"])]);

    let t1 = 1000000500;
    let t2 = 1000005000;
    let forward = locate_in(root, t1, t2).unwrap().unwrap();
    let backward = locate_in(root, t2, t1).unwrap().unwrap();
    assert!(forward == backward);
    assert!(forward == Coordinate::new("h1", 1000000000, 0));
}

#[test]
fn test_locate_backward_picks_last_segment() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    write_segment(root, "h1", 1000000000, 0, &[(1000001000, &["a"])]);
    write_segment(root, "h1", 1000000000, 1, &[(1000002000, &["b"])]);
    write_segment(root, "h1", 1000000000, 2, &[(1000003000, &["c"])]);
    write_segment(root, "h1", 1000010000, 0, &[(1000018000, &["d"])]);

    let c = locate_in(root, 1000015000, 1000000000).unwrap().unwrap();
    assert!(c == Coordinate::new("h1", 1000000000, 2));
}

#[test]
fn test_locate_skips_bad_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    let path = crate::encode_path(root, "h1", 1000000000, 0).unwrap();
    crate::testutil::write_gz(&path, "Version 0.9\n1000003000\n1000002000\n");
    write_segment(root, "h1", 1000000000, 1, &[(1000004000, &["a"]), (1000005000, &["b"])]);

    let c = locate_in(root, 1000002500, 1000009000).unwrap().unwrap();
    assert!(c == Coordinate::new("h1", 1000000000, 1));
}

#[test]
fn test_locate_watchdog() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    // Every probe misses and the range is far wider than the watchdog allows.
    assert!(locate_in(root, 1000000000, 1002000000).is_err());
    assert!(locate_in(root, 1002000000, 1000000000).is_err());

    // A narrow range with nothing in it is just "not found".
    assert!(locate_in(root, 1000000000, 1000050000).unwrap().is_none());
}

#[test]
fn test_locate_backward_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    // An empty tree: the walk back stops a day before the end of the range, well inside the
    // watchdog.
    assert!(locate_in(root, 1000005000, 1000004000).unwrap().is_none());

    // The walk forward from the target's bucket may look one bucket ahead and no further.  The file
    // two buckets on claims to hold the target, but is never probed.
    write_segment(root, "h1", 1000000000, 0, &[(1000001000, &["a"]), (1000002000, &["b"])]);
    write_segment(root, "h1", 1000020000, 0, &[(1000004000, &["c"]), (1000006000, &["d"])]);
    let c = locate_in(root, 1000005000, 1000000000).unwrap().unwrap();
    assert!(c == Coordinate::new("h1", 1000000000, 0));
}

#[test]
fn test_locate_extreme_times() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();
    assert!(locate_in(root, Timestamp::MAX, Timestamp::MAX - 86400).is_err());
    assert!(locate_in(root, Timestamp::MAX - 86400, Timestamp::MAX).is_err());
    assert!(locate_in(root, -5, 1000000000).is_err());
    assert!(locate_in(root, 1000000000, Timestamp::MIN).is_err());
}

#[test]
fn test_locate_bad_path() {
    assert!(locate("", "h1", 5000, 6000, &no_flush, &quick()).is_err());
}

#[test]
fn test_locate_flush() {
    use std::cell::Cell;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_string();
    write_segment(&root, "h1", 1000000000, 0, &[(1000001000, &["a"]), (1000002000, &["b"])]);

    // The live segment appears only once the writer has been asked to flush.
    let calls = Cell::new(0);
    let flusher = |component: &str, _reserved: i32, hostname: &str| {
        assert!(component == FLUSH_COMPONENT && hostname == "h1");
        calls.set(calls.get() + 1);
        write_segment(&root, "h1", 1000010000, 0, &[(1000011000, &["c"]), (1000012000, &["d"])]);
        0
    };
    let c = locate(&root, "h1", 1000011500, 1000011500, &flusher, &quick())
        .unwrap()
        .unwrap();
    assert!(c == Coordinate::new("h1", 1000010000, 0));
    assert!(calls.get() == 1);
}

#[test]
fn test_locate_flush_once() {
    use std::cell::Cell;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    // Nothing ever shows up: one flush, then the search carries on and comes up empty.
    let calls = Cell::new(0);
    let flusher = |_: &str, _: i32, _: &str| {
        calls.set(calls.get() + 1);
        1
    };
    assert!(locate(root, "h1", 1000011500, 1000041500, &flusher, &quick())
        .unwrap()
        .is_none());
    assert!(calls.get() == 1);

    // Backward searches never flush.
    assert!(locate(root, "h1", 1000011500, 1000001500, &flusher, &quick())
        .unwrap()
        .is_none());
    assert!(calls.get() == 1);
}
