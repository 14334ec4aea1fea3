// Generic formatting code for a set of data extracted from a data structure to be presented
// columnar or as csv, with or without a header.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    pub header: bool,
    pub csv: bool,
}

/// Return a vector of the known fields in `spec` wrt the formatters, and a HashSet of any other
/// strings found in `spec`

pub fn parse_fields<'a, DataT, FmtT, CtxT>(
    spec: &'a str,
    formatters: &HashMap<String, FmtT>,
) -> (Vec<&'a str>, HashSet<&'a str>)
where
    FmtT: Fn(&DataT, CtxT) -> String,
    CtxT: Copy,
{
    let mut others = HashSet::new();
    let mut fields = vec![];
    for x in spec.split(',') {
        if formatters.get(x).is_some() {
            fields.push(x);
        } else {
            others.insert(x);
        }
    }
    (fields, others)
}

/// Pick up the option keywords `csv`, `header` and `noheader` from the non-field strings of a
/// format spec.  Fixed-width output has a header by default, csv output does not.

pub fn standard_options(others: &HashSet<&str>) -> FormatOptions {
    let csv = others.contains("csv");
    let header = if others.contains("noheader") {
        false
    } else if others.contains("header") {
        true
    } else {
        !csv
    };
    FormatOptions { header, csv }
}

/// The `fields` are the names of formatting functions to get from the `formatters`, these are
/// applied to the `data`.  Names not in `formatters` produce empty columns.

pub fn format_data<DataT, FmtT, CtxT>(
    output: &mut dyn io::Write,
    fields: &[&str],
    formatters: &HashMap<String, FmtT>,
    opts: &FormatOptions,
    data: &[DataT],
    ctx: CtxT,
) -> Result<()>
where
    FmtT: Fn(&DataT, CtxT) -> String,
    CtxT: Copy,
{
    let rows = data
        .iter()
        .map(|x| {
            fields
                .iter()
                .map(|kwd| formatters.get(*kwd).map_or(String::new(), |f| f(x, ctx)))
                .collect::<Vec<String>>()
        })
        .collect::<Vec<Vec<String>>>();

    if opts.csv {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(output);
        if opts.header {
            writer.write_record(fields)?;
        }
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        return Ok(());
    }

    // The column width is the max across all the entries in the column (including header, if
    // present)
    let mut widths = vec![0; fields.len()];
    if opts.header {
        for (w, kwd) in widths.iter_mut().zip(fields) {
            *w = usize::max(*w, kwd.len());
        }
    }
    for row in &rows {
        for (w, s) in widths.iter_mut().zip(row) {
            *w = usize::max(*w, s.chars().count());
        }
    }

    if opts.header {
        write_row(output, &widths, fields.iter().copied())?;
    }
    for row in &rows {
        write_row(output, &widths, row.iter().map(String::as_str))?;
    }
    Ok(())
}

fn write_row<'a>(
    output: &mut dyn io::Write,
    widths: &[usize],
    cols: impl Iterator<Item = &'a str>,
) -> Result<()> {
    let mut line = String::new();
    for (w, s) in widths.iter().zip(cols) {
        line += &format!("{:w$}  ", s, w = *w);
    }
    writeln!(output, "{}", line.trim_end())?;
    Ok(())
}

#[cfg(test)]
type TestDatum = (i64, &'static str);

#[cfg(test)]
fn format_num(d: &TestDatum, _: ()) -> String {
    d.0.to_string()
}

#[cfg(test)]
fn format_name(d: &TestDatum, _: ()) -> String {
    d.1.to_string()
}

#[cfg(test)]
fn test_formatters() -> HashMap<String, &'static dyn Fn(&TestDatum, ()) -> String> {
    let mut formatters: HashMap<String, &'static dyn Fn(&TestDatum, ()) -> String> = HashMap::new();
    formatters.insert("num".to_string(), &format_num);
    formatters.insert("name".to_string(), &format_name);
    formatters
}

#[test]
fn test_parse_fields() {
    let formatters = test_formatters();
    let (fields, others) = parse_fields("name,csv,num,bogus", &formatters);
    assert!(fields == vec!["name", "num"]);
    assert!(others.len() == 2 && others.contains("csv") && others.contains("bogus"));

    let opts = standard_options(&others);
    assert!(opts.csv && !opts.header);
    let opts = standard_options(&["csv", "header"].into_iter().collect());
    assert!(opts.csv && opts.header);
    let opts = standard_options(&HashSet::new());
    assert!(!opts.csv && opts.header);
}

#[test]
fn test_format_fixed() {
    let formatters = test_formatters();
    let data: Vec<TestDatum> = vec![(7, "init"), (4711, "python train.py")];
    let mut out = vec![];
    let opts = FormatOptions {
        header: true,
        csv: false,
    };
    format_data(&mut out, &["num", "name"], &formatters, &opts, &data, ()).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text == "num   name\n7     init\n4711  python train.py\n");
}

#[test]
fn test_format_csv() {
    let formatters = test_formatters();
    let data: Vec<TestDatum> = vec![(7, "a, b"), (8, "c")];
    let mut out = vec![];
    let opts = FormatOptions {
        header: true,
        csv: true,
    };
    format_data(&mut out, &["num", "name"], &formatters, &opts, &data, ()).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text == "num,name\n7,\"a, b\"\n8,c\n");
}
