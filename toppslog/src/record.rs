// Parser for the process lines in a snapshot block.
//
// A process line is positional, fields separated by whitespace:
//
//   pid ppid uid uname gid gname <3 integers, unused here> cmd...
//
// where cmd is the rest of the line and may contain spaces.  Numeric fields are read the way
// strtoll reads them: optional leading whitespace and sign, at least one digit, and anything after
// the digits up to the next whitespace is ignored.  A field without digits rejects the line.
//
// The user and group names are bounded; an overlong name rejects the line rather than being
// truncated, since the names are part of the identity key.  The command is truncated silently.

use anyhow::{bail, Result};

/// Maximum length in bytes of the user and group names.

pub const MAX_NAME_LEN: usize = 32;

/// Maximum length in bytes of the command; longer commands are truncated.

pub const MAX_CMD_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i64,
    pub ppid: i64,
    pub uid: i64,
    pub uname: String,
    pub gid: i64,
    pub gname: String,
    pub cmd: String,
}

impl ProcessRecord {
    /// The key under which records are merged into a lifetime.  Note ppid, uid and gid are not part
    /// of it, so a recycled pid running the same command as the same user and group is folded into
    /// the earlier process.

    pub fn identity_key(&self) -> String {
        format!("{} {} {} {}", self.pid, self.uname, self.gname, self.cmd)
    }
}

/// Parse one process line.  Trailing CR/LF is ignored.

pub fn parse_record(line: &str) -> Result<ProcessRecord> {
    let mut fields = Fields {
        rest: line.trim_end_matches(&['\r', '\n'][..]),
    };
    let pid = fields.integer("pid")?;
    let ppid = fields.integer("ppid")?;
    let uid = fields.integer("uid")?;
    let uname = fields.name("uname")?.to_string();
    let gid = fields.integer("gid")?;
    let gname = fields.name("gname")?.to_string();
    for what in ["field 7", "field 8", "field 9"] {
        fields.integer(what)?;
    }
    let cmd = truncate(fields.remainder(), MAX_CMD_LEN).to_string();
    Ok(ProcessRecord {
        pid,
        ppid,
        uid,
        uname,
        gid,
        gname,
        cmd,
    })
}

struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn integer(&mut self, what: &str) -> Result<i64> {
        let s = self.rest.trim_start();
        let (negative, unsigned) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let ndigits = unsigned.bytes().take_while(u8::is_ascii_digit).count();
        if ndigits == 0 {
            bail!("No digits in {what}");
        }
        let mut value: i64 = 0;
        for d in unsigned[..ndigits].bytes() {
            let digit = i64::from(d - b'0');
            let next = value
                .checked_mul(10)
                .and_then(|v| if negative { v.checked_sub(digit) } else { v.checked_add(digit) });
            match next {
                Some(v) => value = v,
                None => bail!("Value out of range in {what}"),
            }
        }
        // Garbage after the digits is skipped up to the next separator.
        let after = &unsigned[ndigits..];
        let end = after.find(char::is_whitespace).unwrap_or(after.len());
        self.rest = &after[end..];
        Ok(value)
    }

    fn name(&mut self, what: &str) -> Result<&'a str> {
        let s = self.rest.trim_start();
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        if end == 0 {
            bail!("Missing {what}");
        }
        if end > MAX_NAME_LEN {
            bail!("Overlong {what}");
        }
        self.rest = &s[end..];
        Ok(&s[..end])
    }

    fn remainder(self) -> &'a str {
        self.rest.trim_start()
    }
}

// Truncate to at most `max` bytes without splitting a character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[test]
fn test_parse_record() {
    let r = parse_record("4711 1 1000 larsbent 100 users 0 37 9912 python train.py --epochs 3\r\n")
        .unwrap();
    assert!(r.pid == 4711);
    assert!(r.ppid == 1);
    assert!(r.uid == 1000);
    assert!(r.uname == "larsbent");
    assert!(r.gid == 100);
    assert!(r.gname == "users");
    assert!(r.cmd == "python train.py --epochs 3");
    assert!(r.identity_key() == "4711 larsbent users python train.py --epochs 3");

    // Extra whitespace between fields is fine, as is a sign.
    let r = parse_record("  12\t+3   0 root 0  root -1 0 0   /sbin/init").unwrap();
    assert!(r.pid == 12 && r.ppid == 3 && r.cmd == "/sbin/init");

    // Trailing garbage after the digits of a numeric field is tolerated.
    let r = parse_record("12x 1 0 root 0 root 0 0 0 sshd").unwrap();
    assert!(r.pid == 12);
    assert!(r.uname == "root");
}

#[test]
fn test_parse_record_errors() {
    // No digits
    assert!(parse_record("abc 1 0 root 0 root 0 0 0 sshd").is_err());
    assert!(parse_record("12 1 - root 0 root 0 0 0 sshd").is_err());

    // Truncated lines
    assert!(parse_record("").is_err());
    assert!(parse_record("12 1 0 root 0").is_err());
    assert!(parse_record("12 1 0 root 0 root 0 0").is_err());

    // Overflow
    assert!(parse_record("99999999999999999999 1 0 root 0 root 0 0 0 sshd").is_err());

    // Overlong user name
    let line = format!("12 1 0 {} 0 root 0 0 0 sshd", "u".repeat(MAX_NAME_LEN + 1));
    assert!(parse_record(&line).is_err());
    let line = format!("12 1 0 {} 0 root 0 0 0 sshd", "u".repeat(MAX_NAME_LEN));
    assert!(parse_record(&line).is_ok());
}

#[test]
fn test_parse_record_long_command() {
    let cmd = "é".repeat(MAX_CMD_LEN);
    let r = parse_record(&format!("12 1 0 root 0 root 0 0 0 {cmd}")).unwrap();
    assert!(r.cmd.len() <= MAX_CMD_LEN);
    assert!(r.cmd.len() == MAX_CMD_LEN);
    assert!(r.cmd.chars().all(|c| c == 'é'));

    // An empty command is allowed, a missing numeric field is not.
    let r = parse_record("12 1 0 root 0 root 0 0 0").unwrap();
    assert!(r.cmd == "");
    let e = parse_record("12 1 0 root 0 root 0 0").unwrap_err();
    assert!(e.to_string().contains("field 9"));
}
