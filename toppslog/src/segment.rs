// Reader for topps segment files, and the cheap bounds probe used by the locator.
//
// FORMAT
//
// A segment file is gzip-compressed text, one item per line:
//
//   Version 1.0                 format version, literal
//   <last>                      latest block timestamp in the file
//   <first>                     earliest block timestamp, and also the first block's timestamp
//   <count>                     number of record lines in the first block
//   <record> * count
//   <timestamp>                 second block
//   <count>
//   <record> * count
//   ...
//
// Block timestamps are non-decreasing and lie within [first, last].  Record lines are opaque here,
// see record.rs for their contents.
//
// NOTE:
//
// - Lines may end in CRLF; the CR is stripped along with the LF.
//
// - Record lines carry command lines, which are arbitrary bytes.  Invalid UTF-8 is replaced with
//   U+FFFD rather than failing the file.

use crate::Timestamp;
use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// The only format version this reader understands.

pub const FORMAT_VERSION: &str = "Version 1.0";

/// Problems with one segment file.  None of these are fatal to a search or a scan: callers skip
/// the file and carry on.

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("{}: no such file", .path.display())]
    NotFound { path: PathBuf },

    #[error("{}: unsupported format {version:?}", .path.display())]
    UnsupportedVersion { path: PathBuf, version: String },

    #[error("{}:{line}: {what}", .path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        what: String,
    },

    #[error("{}: no snapshot for {timestamp}", .path.display())]
    NoSnapshot { path: PathBuf, timestamp: Timestamp },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The header of a segment file: the time range it covers.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub first: Timestamp,
    pub last: Timestamp,
}

impl SegmentHeader {
    /// Signed distance from the file's time range to `target`: 0 if the range contains it,
    /// negative if the target is earlier than the range (search earlier), positive if it is later
    /// (search later).  The magnitude is the distance to the nearer end of the range.

    pub fn distance(&self, target: Timestamp) -> Timestamp {
        if self.first <= target && target <= self.last {
            return 0;
        }
        // The header comes from disk and may hold anything, so no plain subtraction here.
        let d = u64::min(target.abs_diff(self.first), target.abs_diff(self.last));
        let d = Timestamp::try_from(d).unwrap_or(Timestamp::MAX);
        if target < self.first {
            -d
        } else {
            d
        }
    }
}

/// The head of one block: its timestamp and the number of record lines that follow.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub timestamp: Timestamp,
    pub count: usize,
}

/// Sequential line reader over one gzip-compressed segment file.

pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<GzDecoder<File>>,
    raw: Vec<u8>,
    buf: String,
    line: usize,

    // The first block's timestamp is the header's third line, so it has been consumed by the time
    // the blocks are read.
    pending_first: Option<Timestamp>,
}

impl SegmentReader {
    /// Open `path` for reading.  A missing file is `NotFound`, anything else that prevents opening
    /// it is `Io`.

    pub fn open(path: &Path) -> Result<SegmentReader, SegmentError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SegmentError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(SegmentError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Ok(SegmentReader {
            path: path.to_path_buf(),
            reader: BufReader::new(GzDecoder::new(file)),
            raw: Vec::new(),
            buf: String::new(),
            line: 0,
            pending_first: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of the line most recently returned, 1-based.

    pub fn line_number(&self) -> usize {
        self.line
    }

    /// Return the next line without its line terminator, or None at the end of the stream.  Bytes
    /// that are not UTF-8 come back as U+FFFD.

    pub fn next_line(&mut self) -> Result<Option<&str>, SegmentError> {
        self.raw.clear();
        match self.reader.read_until(b'\n', &mut self.raw) {
            Ok(0) => Ok(None),
            Ok(_) => {
                self.line += 1;
                match String::from_utf8_lossy(&self.raw) {
                    Cow::Borrowed(s) => {
                        self.buf.clear();
                        self.buf.push_str(s);
                    }
                    Cow::Owned(s) => self.buf = s,
                }
                let l = self.buf.trim_end_matches(&['\r', '\n'][..]);
                Ok(Some(l))
            }
            Err(e) => Err(SegmentError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Like `next_line`, but the end of the stream is a syntax error naming `what` was expected.

    pub fn expect_line(&mut self, what: &str) -> Result<&str, SegmentError> {
        // Checked up front so that the error does not overlap the borrow of the line.
        let eof = self.next_line()?.is_none();
        if eof {
            return Err(self.syntax(format!("unexpected end of file, expected {what}")));
        }
        Ok(self.buf.trim_end_matches(&['\r', '\n'][..]))
    }

    /// Read the next line as an integer.

    pub fn expect_number<T: FromStr>(&mut self, what: &str) -> Result<T, SegmentError> {
        let parsed = T::from_str(self.expect_line(what)?.trim());
        match parsed {
            Ok(v) => Ok(v),
            Err(_) => Err(self.syntax(format!("bad {what}"))),
        }
    }

    /// Read and check the three header lines.  After this, `next_block` yields the blocks.

    pub fn read_header(&mut self) -> Result<SegmentHeader, SegmentError> {
        let version = self.next_line()?.map(|v| v.to_string());
        match version {
            Some(v) if v == FORMAT_VERSION => {}
            Some(v) => {
                return Err(SegmentError::UnsupportedVersion {
                    path: self.path.clone(),
                    version: v,
                })
            }
            None => return Err(self.syntax("empty file".to_string())),
        }
        let last = self.expect_number("last timestamp")?;
        let first = self.expect_number("first timestamp")?;
        self.pending_first = Some(first);
        Ok(SegmentHeader { first, last })
    }

    /// Read the head of the next block, or None at the end of the stream.  The caller must consume
    /// exactly `count` lines (`expect_line` or `skip_lines`) before asking for the next block.

    pub fn next_block(&mut self) -> Result<Option<BlockHeader>, SegmentError> {
        let timestamp = match self.pending_first.take() {
            Some(t) => t,
            None => {
                let parsed = match self.next_line()? {
                    None => return Ok(None),
                    Some(l) => Timestamp::from_str(l.trim()),
                };
                match parsed {
                    Ok(t) => t,
                    Err(_) => return Err(self.syntax("bad block timestamp".to_string())),
                }
            }
        };
        let count = self.expect_number("record count")?;
        Ok(Some(BlockHeader { timestamp, count }))
    }

    /// Consume `n` record lines.

    pub fn skip_lines(&mut self, n: usize) -> Result<(), SegmentError> {
        for _ in 0..n {
            self.expect_line("record")?;
        }
        Ok(())
    }

    fn syntax(&self, what: String) -> SegmentError {
        SegmentError::Syntax {
            path: self.path.clone(),
            line: self.line,
            what,
        }
    }
}

/// Probe the segment file at `path` for `target`: read only the header and return the signed
/// distance from the file's time range to the target, see `SegmentHeader::distance`.

pub fn probe(path: &Path, target: Timestamp) -> Result<Timestamp, SegmentError> {
    let mut reader = SegmentReader::open(path)?;
    let header = reader.read_header()?;
    Ok(header.distance(target))
}

#[cfg(test)]
use crate::testutil::{segment_text, write_gz};

#[test]
fn test_distance() {
    let h = SegmentHeader {
        first: 1000,
        last: 2000,
    };
    assert!(h.distance(1000) == 0);
    assert!(h.distance(1500) == 0);
    assert!(h.distance(2000) == 0);

    // Before the range: negative, measured to the first timestamp.
    assert!(h.distance(900) == -100);
    assert!(h.distance(0) == -1000);

    // After the range: positive, measured to the last timestamp.
    assert!(h.distance(2001) == 1);
    assert!(h.distance(5000) == 3000);

    // A damaged header can hold any value at all.
    let h = SegmentHeader {
        first: Timestamp::MIN,
        last: Timestamp::MIN,
    };
    assert!(h.distance(Timestamp::MAX) == Timestamp::MAX);
    let h = SegmentHeader {
        first: Timestamp::MAX,
        last: Timestamp::MAX,
    };
    assert!(h.distance(-5) == -Timestamp::MAX);
}

#[test]
fn test_probe() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.gz");
    write_gz(
        &path,
        &segment_text(&[(100, &["x"]), (200, &["y", "z"]), (300, &[])]),
    );
    assert!(probe(&path, 100).unwrap() == 0);
    assert!(probe(&path, 250).unwrap() == 0);
    assert!(probe(&path, 40).unwrap() == -60);
    assert!(probe(&path, 310).unwrap() == 10);

    // The probe only looks at the header, so a damaged body does not matter.
    let path = dir.path().join("b.gz");
    write_gz(&path, "Version 1.0\n300\n100\ngarbage\n");
    assert!(probe(&path, 200).unwrap() == 0);
}

#[test]
fn test_probe_errors() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing.gz");
    assert!(matches!(probe(&missing, 1), Err(SegmentError::NotFound { .. })));

    let path = dir.path().join("v2.gz");
    write_gz(&path, "Version 2.0\n300\n100\n");
    assert!(matches!(
        probe(&path, 1),
        Err(SegmentError::UnsupportedVersion { .. })
    ));

    let path = dir.path().join("bad_last.gz");
    write_gz(&path, "Version 1.0\nlast\n100\n");
    assert!(matches!(
        probe(&path, 1),
        Err(SegmentError::Syntax { line: 2, .. })
    ));

    let path = dir.path().join("short.gz");
    write_gz(&path, "Version 1.0\n300\n");
    assert!(matches!(probe(&path, 1), Err(SegmentError::Syntax { .. })));

    let path = dir.path().join("empty.gz");
    write_gz(&path, "");
    assert!(matches!(probe(&path, 1), Err(SegmentError::Syntax { .. })));
}

#[test]
fn test_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.gz");
    write_gz(&path, "Version 1.0\r\n300\r\n100\r\n1\r\nx\r\n300\r\n2\r\ny\r\nz\r\n");

    let mut r = SegmentReader::open(&path).unwrap();
    let h = r.read_header().unwrap();
    assert!(h == SegmentHeader { first: 100, last: 300 });

    let b = r.next_block().unwrap().unwrap();
    assert!(b == BlockHeader { timestamp: 100, count: 1 });
    assert!(r.expect_line("record").unwrap() == "x");

    let b = r.next_block().unwrap().unwrap();
    assert!(b == BlockHeader { timestamp: 300, count: 2 });
    r.skip_lines(2).unwrap();
    assert!(r.line_number() == 9);
    assert!(r.next_block().unwrap().is_none());
}

#[test]
fn test_non_utf8_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.gz");
    crate::testutil::write_gz_bytes(
        &path,
        b"Version 1.0\n100\n100\n2\n7 1 0 root 0 root 0 0 0 caf\xe9\nafter\n",
    );

    let mut r = SegmentReader::open(&path).unwrap();
    r.read_header().unwrap();
    let b = r.next_block().unwrap().unwrap();
    assert!(b.count == 2);
    assert!(r.expect_line("record").unwrap() == "7 1 0 root 0 root 0 0 0 caf\u{FFFD}");
    assert!(r.expect_line("record").unwrap() == "after");
    assert!(r.next_block().unwrap().is_none());
}
