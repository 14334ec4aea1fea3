// Print the answer to a point-in-time query.

use crate::SnapshotPrintArgs;

use anyhow::Result;
use std::io;
use toppslog::{SnapshotReply, STATUS_OK};

/// Print `reply` as one line of json, or with `--raw` just the process lines of the snapshot.  A raw
/// print of a missing snapshot prints nothing; the status is then only visible in the log.

pub fn print_snapshot(
    output: &mut dyn io::Write,
    print_args: &SnapshotPrintArgs,
    reply: &SnapshotReply,
) -> Result<()> {
    if print_args.raw {
        if reply.status == STATUS_OK {
            for r in &reply.records {
                writeln!(output, "{r}")?;
            }
        }
    } else {
        serde_json::to_writer(&mut *output, reply)?;
        writeln!(output)?;
    }
    Ok(())
}

#[cfg(test)]
fn reply() -> SnapshotReply {
    SnapshotReply {
        status: STATUS_OK.to_string(),
        tm: 1000005000,
        records: vec![
            "1 0 0 root 0 root 0 0 0 /sbin/init".to_string(),
            "4711 1 1000 larsbent 100 users 0 0 0 python".to_string(),
        ],
    }
}

#[test]
fn test_print_snapshot() {
    let mut out = vec![];
    print_snapshot(&mut out, &SnapshotPrintArgs { raw: false }, &reply()).unwrap();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert!(v["status"] == "OK");
    assert!(v["tm"] == 1000005000);
    assert!(v["records"].as_array().unwrap().len() == 2);

    let mut out = vec![];
    print_snapshot(&mut out, &SnapshotPrintArgs { raw: true }, &reply()).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.lines().count() == 2);
    assert!(text.starts_with("1 0 0 root"));
}
