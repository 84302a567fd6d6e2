//! Recovery dumps
//!
//! When a backend keeps failing, the rows it could not store are written to
//! a CSV file instead of being retried forever. Dumps are a recovery
//! artifact for operators; nothing reads them back automatically.

use crate::clock::Timestamp;
use crate::error::ControllerError;
use crate::schema::PendingRow;
use crate::value::csv_escape;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Dump file for one table (and statement, when not the full insert)
pub fn dump_path(dir: &Path, backend: &str, table: &str, statement: usize, now: Timestamp) -> PathBuf {
    let stamp = now.to_local().format("%Y%m%d_%H%M%S");
    let name = if statement == 0 {
        format!("{}_{}_{}.csv", backend, table, stamp)
    } else {
        format!("{}_{}_s{}_{}.csv", backend, table, statement, stamp)
    };
    dir.join(name)
}

/// Append `rows` to `path`, writing the header first when the file is new
pub fn write_dump(path: &Path, columns: &[String], rows: &[PendingRow]) -> Result<(), ControllerError> {
    let wrap = |source: std::io::Error| ControllerError::Dump {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)?;
    let is_new = file.metadata().map_err(wrap)?.len() == 0;
    let mut out = BufWriter::new(file);

    if is_new {
        let header: Vec<String> = columns.iter().map(|c| csv_escape(c)).collect();
        write!(out, "{}\r\n", header.join(",")).map_err(wrap)?;
    }
    for row in rows {
        let fields: Vec<String> = row.values.iter().map(|v| v.to_csv_field()).collect();
        write!(out, "{}\r\n", fields.join(",")).map_err(wrap)?;
    }
    out.flush().map_err(wrap)
}
