use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::config::{format_size, HarnessConfig};
use crate::peaks::{reduce_peaks, PeakRecord};
use crate::sweep::MeasurementRecord;

/// Parameters of a sweep session, as stored under `args`
pub fn report_args(config: &HarnessConfig, target: &str) -> Value {
    json!({
        "session": Uuid::new_v4().to_string(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "target": target,
        "level": config.array.level.to_string(),
        "disks": config.array.disk_count(),
        "policy": config.array.policy,
        "sweep": config.sweep,
        "fio": config.fio,
    })
}

/// Measurements and their peaks, renderable as a table or JSON
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub args: Value,
    pub records: Vec<MeasurementRecord>,
    pub peaks: Vec<PeakRecord>,
}

impl SweepReport {
    pub fn new(args: Value, records: Vec<MeasurementRecord>) -> Self {
        let peaks = reduce_peaks(&records);
        SweepReport {
            args,
            records,
            peaks,
        }
    }

    /// `{"args", "all", "peaks"}`; `all` groups records by metric, `peaks`
    /// by metric then blocksize
    pub fn to_json(&self) -> Value {
        let mut all: Map<String, Value> = Map::new();
        for record in &self.records {
            let entry = all
                .entry(record.metric_name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.push(json!(record));
            }
        }

        let mut peaks: Map<String, Value> = Map::new();
        for peak in &self.peaks {
            let entry = peaks
                .entry(peak.metric_name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(by_size) = entry {
                by_size.insert(format_size(peak.blocksize), json!(peak));
            }
        }

        json!({
            "args": self.args,
            "all": all,
            "peaks": peaks,
        })
    }

    /// Load a previous report and reduce its measurements again
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text).context("Failed to parse report")?;
        let all = doc
            .get("all")
            .and_then(Value::as_object)
            .ok_or_else(|| anyhow!("report has no \"all\" section"))?;

        let mut records = Vec::new();
        for (metric, list) in all {
            let list: Vec<MeasurementRecord> = serde_json::from_value(list.clone())
                .with_context(|| format!("Failed to read {} measurements", metric))?;
            records.extend(list);
        }

        let args = doc.get("args").cloned().unwrap_or(Value::Null);
        Ok(Self::new(args, records))
    }

    /// Text table, one block per (metric, blocksize), peak row starred
    pub fn render_table(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpu = |v: Option<f64>| v.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".to_string());

        for peak in &self.peaks {
            writeln!(f, "{} @ {}", peak.metric_name, format_size(peak.blocksize))?;
            writeln!(
                f,
                "  {:>8} {:>8} {:>8} {:>14} {:>7} {:>7}",
                "chunk", "threads", "cache", "value", "usr%", "sys%"
            )?;
            let mut marked = false;
            for record in self.records.iter().filter(|r| {
                r.metric_name == peak.metric_name && r.point.blocksize == peak.blocksize
            }) {
                let is_peak = !marked && record.point == peak.best_config;
                marked |= is_peak;
                writeln!(
                    f,
                    "{} {:>8} {:>8} {:>8} {:>14} {:>7} {:>7}",
                    if is_peak { "*" } else { " " },
                    format_size(record.point.chunk_size),
                    record.point.thread_count,
                    record.point.cache_size,
                    record.display_value,
                    cpu(record.cpu_user),
                    cpu(record.cpu_system)
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
