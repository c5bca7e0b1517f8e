use crate::core_modules::assignment::{Assigner, Hungarian};
use crate::core_modules::records::TrackingRecord;
use crate::error::Result;
use crate::ipc::control::ControlMessage;
use crate::worker::Worker;
use serde_json::json;

/// Gives tracking records their distance-matched identities.
///
/// Runs once behind all trackers so one set of tracks sees every frame.
/// Records are matched in arrival order; trackers finish frames slightly out
/// of order, which the matching absorbs as long as animals move less than
/// `max_distance_mm` over a few frames.
pub struct IdentityWorker {
    matcher: Hungarian,
    records: u64,
    late: u64,
    last_index: Option<u64>,
}

impl IdentityWorker {
    pub fn new(matcher: Hungarian) -> Self {
        Self {
            matcher,
            records: 0,
            late: 0,
            last_index: None,
        }
    }

    /// Replaces the provisional identities and sorts animals by identity.
    fn relabel(&mut self, record: &mut TrackingRecord) {
        let points: Vec<(f32, f32)> = record.animals.iter().map(|a| a.centroid_px).collect();
        for assignment in self.matcher.assign_points(&points) {
            record.animals[assignment.detection].identity = assignment.identity;
        }
        record.animals.sort_by_key(|a| a.identity);
    }
}

impl Worker for IdentityWorker {
    type Input = TrackingRecord;
    type Output = TrackingRecord;

    fn name(&self) -> &str {
        "identity"
    }

    fn on_control(&mut self, message: &ControlMessage) -> Result<()> {
        if let ControlMessage::ResetBackground = message {
            tracing::info!("identities reset");
            self.matcher.reset();
        }
        Ok(())
    }

    fn work(&mut self, record: Option<TrackingRecord>) -> Result<Option<TrackingRecord>> {
        let Some(mut record) = record else {
            return Ok(None);
        };
        self.records += 1;
        if self.last_index.is_some_and(|last| record.index < last) {
            self.late += 1;
        }
        self.last_index = Some(self.last_index.map_or(record.index, |last| last.max(record.index)));
        self.relabel(&mut record);
        Ok(Some(record))
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "records": self.records,
            "late_records": self.late,
            "live_tracks": self.matcher.live_tracks(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::records::{AnimalRecord, BoundingBox, Heading};

    fn record(index: u64, centroids: &[(f32, f32)]) -> TrackingRecord {
        let mut record = TrackingRecord::empty(index, index as i64);
        record.animals = centroids
            .iter()
            .enumerate()
            .map(|(i, &centroid_px)| AnimalRecord {
                identity: i as u32,
                bbox_px: BoundingBox::new(centroid_px.0 as u32, centroid_px.1 as u32, 1, 1),
                centroid_px,
                heading: Heading::identity(),
                body: None,
                eyes: None,
                tail: None,
            })
            .collect();
        record
    }

    fn identities(record: &TrackingRecord) -> Vec<(u32, f32)> {
        record.animals.iter().map(|a| (a.identity, a.centroid_px.0)).collect()
    }

    #[test]
    fn provisional_order_does_not_leak_into_identities() {
        let mut worker = IdentityWorker::new(Hungarian::new(10.0, 2));
        let first = worker.work(Some(record(0, &[(10.0, 10.0), (80.0, 10.0)]))).unwrap().unwrap();
        assert_eq!(identities(&first), vec![(0, 10.0), (1, 80.0)]);
        // The tracker now lists the right-hand animal first.
        let second = worker.work(Some(record(1, &[(82.0, 11.0), (12.0, 9.0)]))).unwrap().unwrap();
        assert_eq!(identities(&second), vec![(0, 12.0), (1, 82.0)]);
    }

    #[test]
    fn late_records_are_counted_and_reset_forgets_tracks() {
        let mut worker = IdentityWorker::new(Hungarian::new(10.0, 2));
        worker.work(Some(record(5, &[(10.0, 10.0)]))).unwrap();
        worker.work(Some(record(4, &[(11.0, 10.0)]))).unwrap();
        let summary = worker.summary().unwrap();
        assert_eq!(summary["records"], 2);
        assert_eq!(summary["late_records"], 1);
        assert_eq!(summary["live_tracks"], 1);

        worker.on_control(&ControlMessage::ResetBackground).unwrap();
        assert_eq!(worker.summary().unwrap()["live_tracks"], 0);
        assert!(worker.work(None).unwrap().is_none());
    }
}
