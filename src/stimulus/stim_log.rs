//! JSON-lines log of emitted stimulus commands.
//!
//! One object per command change, stamped with the session time of its first
//! presentation. Timestamps are strictly increasing within a log.

use crate::error::Result;
use crate::stimulus::command::StimulusCommand;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Serialize)]
struct EntryRef<'a> {
    timestamp_ns: i64,
    #[serde(flatten)]
    command: &'a StimulusCommand,
}

/// A parsed log row.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StimLogEntry {
    pub timestamp_ns: i64,
    #[serde(flatten)]
    pub command: StimulusCommand,
}

pub struct StimLog {
    writer: BufWriter<File>,
    last_timestamp_ns: Option<i64>,
    entries: u64,
}

impl StimLog {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            last_timestamp_ns: None,
            entries: 0,
        })
    }

    /// Appends `command`; returns the timestamp actually written.
    pub fn append(&mut self, timestamp_ns: i64, command: &StimulusCommand) -> Result<i64> {
        let timestamp_ns = match self.last_timestamp_ns {
            Some(last) if timestamp_ns <= last => last + 1,
            _ => timestamp_ns,
        };
        serde_json::to_writer(&mut self.writer, &EntryRef { timestamp_ns, command })?;
        self.writer.write_all(b"\n")?;
        self.last_timestamp_ns = Some(timestamp_ns);
        self.entries += 1;
        Ok(timestamp_ns)
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for StimLog {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Reads a log written by `StimLog`.
pub fn read_stim_log(path: &Path) -> Result<Vec<StimLogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_flat_and_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimulus.jsonl");
        let mut log = StimLog::create(&path).unwrap();
        log.append(100, &StimulusCommand::dark()).unwrap();
        assert_eq!(log.append(100, &StimulusCommand::bright()).unwrap(), 101);
        log.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["stim_select"], "DARK");
        assert_eq!(first["timestamp_ns"], 100);
        assert_eq!(first["background_color"][3], 1.0);

        let rows = read_stim_log(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].command, StimulusCommand::bright());
        assert!(rows[0].timestamp_ns < rows[1].timestamp_ns);
    }
}
