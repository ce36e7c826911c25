//! Access to the core's log file

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

/// Last `lines` lines of the file; a missing file reads as empty
pub fn tail<P: AsRef<Path>>(path: P, lines: usize) -> io::Result<Vec<String>> {
    let contents = match fs::read(path.as_ref()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let all: Vec<&str> = contents.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|l| l.to_string()).collect())
}

/// Truncate in place so a running core keeps writing to the same file
pub fn clear<P: AsRef<Path>>(path: P) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(path)?;
    Ok(())
}

/// Remove before a fresh start; a missing file is fine
pub fn remove<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
