// Read the topps configuration from a json file.
//
// The file holds one object { ... } with the following optional named fields and value types:
//
//   data_path - string, the root directory of the data tree
//   flush_command - array of strings, the program and leading arguments used to ask the writer to
//                   flush (see toppslog::CommandFlusher)
//   flush_retries - integer, the number of times to look for a flushed file
//   timeout - integer, the default time budget of a timeline query in seconds
//
// For example:
//
//   { "data_path": "/var/lib/collectd/top",
//     "flush_command": ["collectdctl", "flush"],
//     "timeout": 60 }

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path;

// See above comment block for field documentation.

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub data_path: Option<String>,
    pub flush_command: Vec<String>,
    pub flush_retries: Option<u32>,
    pub timeout: Option<u64>,
}

// Since the input is human-generated and all fields are optional, I've opted to use the generic
// JSON parser followed by explicit decoding of the fields, rather than a (derived) strongly-typed
// parser.

pub fn read_from_json(filename: &str) -> Result<Config> {
    let file = File::open(path::Path::new(filename))
        .with_context(|| format!("Could not open config file {filename}"))?;
    let reader = BufReader::new(file);
    let v = serde_json::from_reader(reader)
        .with_context(|| format!("Could not parse config file {filename}"))?;
    parse_config(&v)
}

fn parse_config(v: &Value) -> Result<Config> {
    let fields = if let Value::Object(fields) = v {
        fields
    } else {
        bail!("Expected an object value")
    };
    let mut config: Config = Default::default();
    if let Some(d) = fields.get("data_path") {
        if let Value::String(p) = d {
            config.data_path = Some(p.clone());
        } else {
            bail!("Field 'data_path' must have a string value");
        }
    }
    if let Some(c) = fields.get("flush_command") {
        if let Value::Array(words) = c {
            for w in words {
                if let Value::String(s) = w {
                    config.flush_command.push(s.clone());
                } else {
                    bail!("Field 'flush_command' must have an array-of-strings value");
                }
            }
        } else {
            bail!("Field 'flush_command' must have an array-of-strings value");
        }
    }
    if let Some(n) = grab_u64(fields, "flush_retries")? {
        config.flush_retries =
            Some(u32::try_from(n).context("Field 'flush_retries' is out of range")?);
    }
    config.timeout = grab_u64(fields, "timeout")?;
    Ok(config)
}

fn grab_u64(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match fields.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(n) = n.as_u64() {
                Ok(Some(n))
            } else {
                bail!("Field '{name}' must have unsigned integer value")
            }
        }
        Some(_) => bail!("Field '{name}' must have an integer value"),
    }
}

#[test]
fn test_parse_config() {
    let v = serde_json::json!({
        "data_path": "/data/topps",
        "flush_command": ["collectdctl", "flush"],
        "flush_retries": 3,
        "timeout": 60
    });
    let c = parse_config(&v).unwrap();
    assert!(c.data_path.as_deref() == Some("/data/topps"));
    assert!(c.flush_command == vec!["collectdctl".to_string(), "flush".to_string()]);
    assert!(c.flush_retries == Some(3));
    assert!(c.timeout == Some(60));

    let c = parse_config(&serde_json::json!({})).unwrap();
    assert!(c == Config::default());
}

#[test]
fn test_parse_config_errors() {
    assert!(parse_config(&serde_json::json!([])).is_err());
    assert!(parse_config(&serde_json::json!({"data_path": 7})).is_err());
    assert!(parse_config(&serde_json::json!({"flush_command": "collectdctl flush"})).is_err());
    assert!(parse_config(&serde_json::json!({"flush_command": ["collectdctl", 1]})).is_err());
    assert!(parse_config(&serde_json::json!({"timeout": -1})).is_err());
    assert!(parse_config(&serde_json::json!({"timeout": "60"})).is_err());
    assert!(parse_config(&serde_json::json!({"flush_retries": 5000000000u64})).is_err());
}

#[test]
fn test_read_from_json() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let filename = dir.path().join("topps.json");
    let mut f = File::create(&filename).unwrap();
    f.write_all(br#"{"data_path": "/data/topps", "timeout": 5}"#).unwrap();
    drop(f);
    let c = read_from_json(filename.to_str().unwrap()).unwrap();
    assert!(c.data_path.as_deref() == Some("/data/topps"));
    assert!(c.timeout == Some(5));

    assert!(read_from_json(dir.path().join("missing.json").to_str().unwrap()).is_err());
}
