use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::sweep::{MeasurementRecord, SweepPoint};

/// Best measurement for one (metric, blocksize) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakRecord {
    pub metric_name: String,
    pub blocksize: u64,
    pub best_config: SweepPoint,
    pub raw_value: f64,
    pub display_value: String,
}

impl PeakRecord {
    fn from_record(record: &MeasurementRecord) -> Self {
        PeakRecord {
            metric_name: record.metric_name.clone(),
            blocksize: record.point.blocksize,
            best_config: record.point,
            raw_value: record.raw_value,
            display_value: record.display_value.clone(),
        }
    }
}

/// Group by (metric, blocksize) and keep the highest raw value of each group.
/// An equal value never replaces the current best. Groups come out in the
/// order their first record appears.
pub fn reduce_peaks(records: &[MeasurementRecord]) -> Vec<PeakRecord> {
    let mut peaks: Vec<PeakRecord> = Vec::new();
    let mut index: HashMap<(&str, u64), usize> = HashMap::new();

    for record in records {
        let key = (record.metric_name.as_str(), record.point.blocksize);
        match index.get(&key) {
            Some(&i) => {
                if record.raw_value > peaks[i].raw_value {
                    peaks[i] = PeakRecord::from_record(record);
                }
            }
            None => {
                index.insert(key, peaks.len());
                peaks.push(PeakRecord::from_record(record));
            }
        }
    }
    peaks
}
