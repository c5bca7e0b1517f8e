// THEORY:
// The recorder turns tracking records into the run's tracking CSV. The column
// set is decided once, at creation, from what the tracker was configured to
// produce, and never changes during a run:
//
// 1.  **Mandatory**: `image_index, timestamp_ns, identity, centroid_x,
//     centroid_y, pc1_x, pc1_y, pc2_x, pc2_y`.
// 2.  **Eyes**: `left_eye_angle, right_eye_angle` when eye tracking is on.
// 3.  **Tail**: `tail_point_000_x, tail_point_000_y, ...` for every
//     interpolated tail point when tail tracking is on.
// 4.  **Unwrapped heading**: `heading_unwrapped_rad` when requested.
//
// One row is written per animal per record. A record without animals still
// gets one row with only the index and timestamp filled, so every frame that
// reached the recorder can be found in the file. Absent substructures leave
// their cells empty.

use crate::core_modules::records::TrackingRecord;
use crate::core_modules::tracker::{HeadingNanPolicy, HeadingUnwrapper};
use crate::error::Result;
use crate::video::VideoConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

pub const MANDATORY_COLUMNS: [&str; 9] = [
    "image_index",
    "timestamp_ns",
    "identity",
    "centroid_x",
    "centroid_y",
    "pc1_x",
    "pc1_y",
    "pc2_x",
    "pc2_y",
];

/// `[recorder]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub enabled: bool,
    pub tracking_csv: String,
    pub stim_log: String,
    pub metadata: String,
    pub heading_unwrap: bool,
    /// Rows between explicit flushes.
    pub flush_every: usize,
    pub video: VideoConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracking_csv: "tracking.csv".into(),
            stim_log: "stimulus.jsonl".into(),
            metadata: "metadata.json".into(),
            heading_unwrap: true,
            flush_every: 256,
            video: VideoConfig::default(),
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("tracking_csv", &self.tracking_csv),
            ("stim_log", &self.stim_log),
            ("metadata", &self.metadata),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("recorder.{name} must not be empty"));
            }
        }
        self.video.validate(errors);
    }
}

/// Optional column groups of the tracking CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CsvColumns {
    pub eyes: bool,
    pub tail_points: usize,
    pub heading_unwrap: bool,
}

impl CsvColumns {
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = MANDATORY_COLUMNS.iter().map(|c| c.to_string()).collect();
        if self.eyes {
            header.push("left_eye_angle".into());
            header.push("right_eye_angle".into());
        }
        for i in 0..self.tail_points {
            header.push(format!("tail_point_{i:03}_x"));
            header.push(format!("tail_point_{i:03}_y"));
        }
        if self.heading_unwrap {
            header.push("heading_unwrapped_rad".into());
        }
        header
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        MANDATORY_COLUMNS.len() + 2 * usize::from(self.eyes) + 2 * self.tail_points + usize::from(self.heading_unwrap)
    }
}

pub struct TrackingCsv {
    writer: csv::Writer<File>,
    columns: CsvColumns,
    unwrapper: HeadingUnwrapper,
    flush_every: usize,
    since_flush: usize,
    rows: u64,
    records: u64,
}

impl TrackingCsv {
    pub fn create(path: &Path, columns: CsvColumns, nan_policy: HeadingNanPolicy, flush_every: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
        writer.write_record(columns.header())?;
        Ok(Self {
            writer,
            columns,
            unwrapper: HeadingUnwrapper::new(nan_policy),
            flush_every: flush_every.max(1),
            since_flush: 0,
            rows: 0,
            records: 0,
        })
    }

    pub fn columns(&self) -> CsvColumns {
        self.columns
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Writes the rows of one record; returns how many.
    pub fn write(&mut self, record: &TrackingRecord) -> Result<usize> {
        self.records += 1;
        let width = self.columns.width();

        if record.animals.is_empty() {
            let mut row = vec![String::new(); width];
            row[0] = record.index.to_string();
            row[1] = record.timestamp_ns.to_string();
            self.writer.write_record(&row)?;
            self.unwrapper.missing_except(&[]);
            self.count_rows(1)?;
            return Ok(1);
        }

        for animal in &record.animals {
            let mut row = Vec::with_capacity(width);
            let pc1 = animal.heading.principal();
            let pc2 = animal.heading.secondary();
            row.push(record.index.to_string());
            row.push(record.timestamp_ns.to_string());
            row.push(animal.identity.to_string());
            for v in [animal.centroid_px.0, animal.centroid_px.1, pc1.x, pc1.y, pc2.x, pc2.y] {
                row.push(v.to_string());
            }
            if self.columns.eyes {
                match &animal.eyes {
                    Some(eyes) => {
                        row.push(eyes.left.angle_rad.to_string());
                        row.push(eyes.right.angle_rad.to_string());
                    }
                    None => row.extend([String::new(), String::new()]),
                }
            }
            let points: &[(f32, f32)] = animal.tail.as_ref().map_or(&[], |t| &t.points_px);
            for i in 0..self.columns.tail_points {
                match points.get(i) {
                    Some((x, y)) => {
                        row.push(x.to_string());
                        row.push(y.to_string());
                    }
                    None => row.extend([String::new(), String::new()]),
                }
            }
            if self.columns.heading_unwrap {
                let unwrapped = self.unwrapper.update(animal.identity, Some(animal.heading.angle()));
                row.push(unwrapped.map(|v| v.to_string()).unwrap_or_default());
            }
            self.writer.write_record(&row)?;
        }
        let seen: Vec<u32> = record.animals.iter().map(|a| a.identity).collect();
        self.unwrapper.missing_except(&seen);
        self.count_rows(record.animals.len())?;
        Ok(record.animals.len())
    }

    fn count_rows(&mut self, n: usize) -> Result<()> {
        self.rows += n as u64;
        self.since_flush += n;
        if self.since_flush >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.since_flush = 0;
        self.writer.flush()?;
        Ok(())
    }
}

/// The mandatory part of a tracking CSV row, as read back for analysis.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackingRow {
    pub image_index: u64,
    pub timestamp_ns: i64,
    pub identity: Option<u32>,
    pub centroid_x: Option<f32>,
    pub centroid_y: Option<f32>,
    pub pc1_x: Option<f32>,
    pub pc1_y: Option<f32>,
    pub pc2_x: Option<f32>,
    pub pc2_y: Option<f32>,
    #[serde(default)]
    pub heading_unwrapped_rad: Option<f32>,
}

impl TrackingRow {
    /// Heading matrix determinant, when the row has an animal.
    pub fn determinant(&self) -> Option<f32> {
        Some(self.pc1_x? * self.pc2_y? - self.pc2_x? * self.pc1_y?)
    }
}

pub fn read_tracking_csv(path: &Path) -> Result<Vec<TrackingRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::records::{AnimalRecord, BoundingBox, EyePose, EyeState, Heading, TailPose};
    use approx::assert_abs_diff_eq;

    fn animal(identity: u32, angle: f32, eyes: bool) -> AnimalRecord {
        let eye = |a: f32| EyeState {
            centroid_px: (0.0, 0.0),
            angle_rad: a,
            area_px: 10,
        };
        AnimalRecord {
            identity,
            bbox_px: BoundingBox::new(0, 0, 10, 10),
            centroid_px: (5.0, 6.0),
            heading: Heading::from_angle(angle),
            body: None,
            eyes: eyes.then(|| EyePose {
                left: eye(0.25),
                right: eye(-0.5),
            }),
            tail: Some(TailPose {
                points_px: vec![(1.0, 2.0)],
            }),
        }
    }

    fn record(index: u64, animals: Vec<AnimalRecord>) -> TrackingRecord {
        TrackingRecord {
            index,
            timestamp_ns: index as i64 * 10,
            animals,
            image: None,
        }
    }

    #[test]
    fn header_follows_the_configured_columns() {
        let columns = CsvColumns {
            eyes: true,
            tail_points: 2,
            heading_unwrap: true,
        };
        let header = columns.header();
        assert_eq!(header.len(), columns.width());
        assert_eq!(&header[..3], &["image_index", "timestamp_ns", "identity"]);
        assert_eq!(header[9], "left_eye_angle");
        assert_eq!(header[11], "tail_point_000_x");
        assert_eq!(header[14], "tail_point_001_y");
        assert_eq!(header.last().unwrap(), "heading_unwrapped_rad");
    }

    #[test]
    fn absent_substructures_leave_cells_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.csv");
        let columns = CsvColumns {
            eyes: true,
            tail_points: 2,
            heading_unwrap: false,
        };
        let mut csv = TrackingCsv::create(&path, columns, HeadingNanPolicy::HoldLast, 1).unwrap();
        csv.write(&record(0, vec![animal(0, 0.0, true), animal(1, 0.0, false)])).unwrap();
        csv.write(&record(1, vec![])).unwrap();
        csv.flush().unwrap();
        assert_eq!((csv.rows(), csv.records()), (3, 2));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "0,0,0,5,6,1,0,-0,1,0.25,-0.5,1,2,,");
        assert_eq!(lines[2], "0,0,1,5,6,1,0,-0,1,,,1,2,,");
        assert_eq!(lines[3], format!("1,10{}", ",".repeat(columns.width() - 2)));

        let rows = read_tracking_csv(&path).unwrap();
        assert_eq!(rows[2].identity, None);
        assert_abs_diff_eq!(rows[0].determinant().unwrap(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn unwrapped_heading_crosses_the_branch_cut() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.csv");
        let columns = CsvColumns {
            heading_unwrap: true,
            ..Default::default()
        };
        let mut csv = TrackingCsv::create(&path, columns, HeadingNanPolicy::HoldLast, 16).unwrap();
        for (i, angle) in [3.0f32, -3.0, -2.5].into_iter().enumerate() {
            csv.write(&record(i as u64, vec![animal(0, angle, false)])).unwrap();
        }
        csv.flush().unwrap();
        let rows = read_tracking_csv(&path).unwrap();
        let unwrapped: Vec<f32> = rows.iter().map(|r| r.heading_unwrapped_rad.unwrap()).collect();
        assert_abs_diff_eq!(unwrapped[0], 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(unwrapped[1], 2.0 * std::f32::consts::PI - 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(unwrapped[2], 2.0 * std::f32::consts::PI - 2.5, epsilon = 1e-4);
    }

    #[test]
    fn invalid_heading_leaves_the_unwrapped_cell_empty_and_holds_the_turns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.csv");
        let columns = CsvColumns {
            heading_unwrap: true,
            ..Default::default()
        };
        let mut csv = TrackingCsv::create(&path, columns, HeadingNanPolicy::HoldLast, 16).unwrap();
        let mut broken = animal(0, 0.0, false);
        broken.heading = Heading(nalgebra::Matrix2::repeat(f32::NAN));
        csv.write(&record(0, vec![animal(0, 3.0, false)])).unwrap();
        csv.write(&record(1, vec![animal(0, -3.0, false)])).unwrap();
        csv.write(&record(2, vec![broken])).unwrap();
        csv.write(&record(3, vec![animal(0, -2.9, false)])).unwrap();
        csv.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[3].ends_with(','), "{}", lines[3]);
        let last: f32 = lines[4].rsplit(',').next().unwrap().parse().unwrap();
        assert_abs_diff_eq!(last, 2.0 * std::f32::consts::PI - 2.9, epsilon = 1e-4);
    }
}
