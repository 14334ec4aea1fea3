// This library handles a tree of `topps` snapshot files.  It finds the file holding the snapshot
// nearest to a point in time, decodes single snapshots, and folds the snapshots of a time range into
// process lifetimes.
//
// A host's tree is bucketed by time, see bucket.rs for the naming scheme.  The files are written by
// the collector daemon; this library only ever reads them.

mod bucket;
mod flush;
mod locate;
mod record;
mod segment;
mod snapshot;
mod timeline;

#[cfg(test)]
mod testutil;

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

/// Timestamps are UNIX seconds, as written by the collector.

pub type Timestamp = i64;

/// Reply status for a successful query.
pub const STATUS_OK: &str = "OK";

/// Reply status for a query that ran without problems but found no data.
pub const STATUS_NOT_FOUND: &str = "not found";

/// Reply status for a timeline query that ran out of its time budget.
pub const STATUS_TIMEOUT: &str = "TIMEOUT";

// Bucket arithmetic and the mapping from (host, time, segment) to a file name.

pub use bucket::{bucket, encode_path, last_segment, round_up, BUCKET_SECONDS};

// The "flush now" collaborator used when the file we need may still be held by the writer.

pub use flush::{no_flush, CommandFlusher, Flusher};

// Find the segment file holding, or nearest to, a timestamp.

pub use locate::{locate, LocateOptions, FLUSH_COMPONENT, WATCHDOG_LIMIT};

// Parse one process line from a snapshot.

pub use record::{parse_record, ProcessRecord, MAX_CMD_LEN, MAX_NAME_LEN};

// Low-level access to segment files.

pub use segment::{probe, BlockHeader, SegmentError, SegmentHeader, SegmentReader, FORMAT_VERSION};

// Extract one snapshot from a segment file, and the point-in-time query built on the locator.

pub use snapshot::{extract, get_snapshot, Extract, Snapshot, SnapshotReply};

// Fold a time range of snapshots into process lifetimes.

pub use timeline::{
    build_timeline, effective_timeout, get_timeline, TimelineOutcome, TimelineQuery,
    TimelineReply, MAX_TIMEOUT_SECONDS,
};

/// A Coordinate names one physical segment file in a host's tree.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinate {
    pub hostname: String,

    /// Start of the 10000-second bucket, see `bucket()`.
    pub bucket: Timestamp,

    /// Rotation index within the bucket; 0 is the primary file.
    pub segment: u32,
}

impl Coordinate {
    pub fn new(hostname: &str, bucket: Timestamp, segment: u32) -> Coordinate {
        Coordinate {
            hostname: hostname.to_string(),
            bucket,
            segment,
        }
    }

    /// The file for this coordinate below `data_path`.

    pub fn path(&self, data_path: &str) -> Result<PathBuf> {
        encode_path(data_path, &self.hostname, self.bucket, self.segment)
    }
}

/// A ProcessSpan is the observed lifetime of one process identity across a set of snapshots.
///
/// Identity is (pid, uname, gname, cmd) only.  The ppid, uid and gid are those of the first record
/// seen for the identity; records that differ only in those fields are folded into the same span.

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSpan {
    /// Earliest snapshot time the process was seen at.
    pub first: Timestamp,

    /// Latest snapshot time the process was seen at.
    pub last: Timestamp,

    pub pid: i64,
    pub ppid: i64,
    pub uid: i64,
    pub gid: i64,

    /// Unix user name.
    pub uname: String,

    /// Unix group name.
    pub gname: String,

    /// The command line, possibly truncated to MAX_CMD_LEN bytes.
    pub cmd: String,
}
