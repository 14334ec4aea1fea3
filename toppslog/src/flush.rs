// The "flush now" collaborator.
//
// The writer keeps the live segment of the current bucket open and compressed data may not reach
// the disk until the segment is rotated.  When the locator runs into missing files ahead of it, it
// asks the writer once to flush, then polls for the file to appear.

use log::warn;
use std::process::Command;

/// Something that can ask the writer to persist its current segment.  The status is 0 on success;
/// a non-zero status is logged by the caller but is not an error.

pub trait Flusher {
    fn request_flush(&self, component: &str, reserved: i32, hostname: &str) -> i32;
}

impl<F> Flusher for F
where
    F: Fn(&str, i32, &str) -> i32,
{
    fn request_flush(&self, component: &str, reserved: i32, hostname: &str) -> i32 {
        self(component, reserved, hostname)
    }
}

/// A flusher for trees that have no live writer.

pub fn no_flush(_component: &str, _reserved: i32, _hostname: &str) -> i32 {
    0
}

/// Run an external program to flush, eg `collectdctl flush`.  The program is given the configured
/// arguments followed by `plugin=<component>`, `identifier=<hostname>` and, if `reserved` is
/// positive, `timeout=<reserved>`.  The status is the program's exit code, or -1 if it could not
/// be run or was killed.

#[derive(Debug, Clone)]
pub struct CommandFlusher {
    program: String,
    args: Vec<String>,
}

impl CommandFlusher {
    /// `command` is the program followed by its leading arguments.  Returns None if it is empty.

    pub fn new(command: &[String]) -> Option<CommandFlusher> {
        let (program, args) = command.split_first()?;
        Some(CommandFlusher {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Flusher for CommandFlusher {
    fn request_flush(&self, component: &str, reserved: i32, hostname: &str) -> i32 {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(format!("plugin={component}"))
            .arg(format!("identifier={hostname}"));
        if reserved > 0 {
            cmd.arg(format!("timeout={reserved}"));
        }
        match cmd.status() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!("Could not run flush command {}: {e}", self.program);
                -1
            }
        }
    }
}

#[test]
fn test_closure_flusher() {
    use std::cell::RefCell;

    let calls = RefCell::new(vec![]);
    let f = |component: &str, reserved: i32, hostname: &str| {
        calls
            .borrow_mut()
            .push(format!("{component}/{reserved}/{hostname}"));
        7
    };
    assert!(f.request_flush("write_top", 0, "h1") == 7);
    assert!(*calls.borrow() == vec!["write_top/0/h1".to_string()]);
    assert!(no_flush.request_flush("write_top", 0, "h1") == 0);
}

#[cfg(unix)]
#[test]
fn test_command_flusher() {
    assert!(CommandFlusher::new(&[]).is_none());

    let ok = CommandFlusher::new(&["true".to_string()]).unwrap();
    assert!(ok.request_flush("write_top", 0, "h1") == 0);

    let failing = CommandFlusher::new(&["false".to_string()]).unwrap();
    assert!(failing.request_flush("write_top", 0, "h1") == 1);

    let missing = CommandFlusher::new(&["/no/such/flush-program".to_string()]).unwrap();
    assert!(missing.request_flush("write_top", 0, "h1") == -1);
}
