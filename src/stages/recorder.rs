use crate::core_modules::records::TrackingRecord;
use crate::core_modules::tracker::HeadingNanPolicy;
use crate::error::Result;
use crate::ipc::control::ControlMessage;
use crate::recorder::{CsvColumns, TrackingCsv};
use crate::worker::Worker;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Writes every tracking record it receives to the tracking CSV.
///
/// Records arrive from several trackers and may be out of order; a small
/// window keyed by frame index puts them back in order before writing.
pub struct RecorderWorker {
    path: PathBuf,
    columns: CsvColumns,
    nan_policy: HeadingNanPolicy,
    flush_every: usize,
    csv: Option<TrackingCsv>,
    window: usize,
    pending: BTreeMap<u64, TrackingRecord>,
    recording: bool,
    paused: u64,
    late: u64,
    last_written: Option<u64>,
}

impl RecorderWorker {
    pub fn new(path: PathBuf, columns: CsvColumns, nan_policy: HeadingNanPolicy, flush_every: usize) -> Self {
        Self {
            path,
            columns,
            nan_policy,
            flush_every,
            csv: None,
            window: 0,
            pending: BTreeMap::new(),
            recording: true,
            paused: 0,
            late: 0,
            last_written: None,
        }
    }

    /// Holds up to `window` records to restore index order.
    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    fn write_oldest(&mut self) -> Result<()> {
        let Some((index, record)) = self.pending.pop_first() else {
            return Ok(());
        };
        if let Some(csv) = self.csv.as_mut() {
            csv.write(&record)?;
        }
        self.last_written = Some(index);
        Ok(())
    }
}

impl Worker for RecorderWorker {
    type Input = TrackingRecord;
    type Output = ();

    fn name(&self) -> &str {
        "recorder"
    }

    fn initialize(&mut self) -> Result<()> {
        self.csv = Some(TrackingCsv::create(
            &self.path,
            self.columns,
            self.nan_policy,
            self.flush_every,
        )?);
        Ok(())
    }

    fn on_control(&mut self, message: &ControlMessage) -> Result<()> {
        if let ControlMessage::SetRecording(on) = message {
            tracing::info!(recording = on, "recorder toggled");
            self.recording = *on;
        }
        Ok(())
    }

    fn work(&mut self, record: Option<TrackingRecord>) -> Result<Option<()>> {
        let Some(mut record) = record else {
            return Ok(None);
        };
        if !self.recording {
            self.paused += 1;
            return Ok(None);
        }
        if self.last_written.is_some_and(|last| record.index <= last) {
            self.late += 1;
        }
        record.image = None;
        self.pending.insert(record.index, record);
        while self.pending.len() > self.window {
            self.write_oldest()?;
        }
        Ok(None)
    }

    fn cleanup(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            self.write_oldest()?;
        }
        match self.csv.as_mut() {
            Some(csv) => csv.flush(),
            None => Ok(()),
        }
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "rows": self.csv.as_ref().map_or(0, TrackingCsv::rows),
            "records": self.csv.as_ref().map_or(0, TrackingCsv::records),
            "paused_records": self.paused,
            "late_records": self.late,
        }))
    }
}
