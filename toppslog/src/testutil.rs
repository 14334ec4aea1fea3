// Fixture writers for the tests: segment files in a temporary data tree.

use crate::{encode_path, Timestamp, FORMAT_VERSION};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write `text` gzip-compressed to `path`, creating directories as needed.

pub fn write_gz(path: &Path, text: &str) {
    write_gz_bytes(path, text.as_bytes());
}

/// Like `write_gz`, for content that need not be UTF-8.

pub fn write_gz_bytes(path: &Path, bytes: &[u8]) {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).unwrap();
    }
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap();
}

/// Render blocks in the segment format.  The last timestamp of the header is that of the last
/// block; the first block's timestamp doubles as the header's first timestamp.

pub fn segment_text(blocks: &[(Timestamp, &[&str])]) -> String {
    let last = blocks.last().map(|(t, _)| *t).unwrap_or(0);
    let mut text = format!("{FORMAT_VERSION}\n{last}\n");
    for (t, lines) in blocks {
        text += &format!("{t}\n{}\n", lines.len());
        for l in *lines {
            text += l;
            text += "\n";
        }
    }
    text
}

/// Write a segment file for (hostname, bucket of `t`, segment) below `root` and return its path.

pub fn write_segment(
    root: &str,
    hostname: &str,
    t: Timestamp,
    segment: u32,
    blocks: &[(Timestamp, &[&str])],
) -> PathBuf {
    let path = encode_path(root, hostname, t, segment).unwrap();
    write_gz(&path, &segment_text(blocks));
    path
}

/// A process line in the collector's format.

pub fn process_line(pid: i64, uid: i64, uname: &str, cmd: &str) -> String {
    format!("{pid} 1 {uid} {uname} {uid} {uname} 0 100 2048 {cmd}")
}
