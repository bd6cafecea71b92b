//! Activity records as staged from calculation output artifacts.
//!
//! Artifacts are newline-delimited JSON, one [`ActivityRecord`] per line:
//!
//! ```json
//! {"activity_type":"raw","name":"boiler-1","date":"2024-01-03","group_id":"/acme/plant-a","values":{"co2":12.5}}
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActivityValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl ActivityValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ActivityValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Text form used in aggregation group keys
    pub fn key_text(&self) -> String {
        match self {
            ActivityValue::Boolean(b) => b.to_string(),
            ActivityValue::Number(n) => n.to_string(),
            ActivityValue::Text(s) => s.clone(),
        }
    }
}

fn default_activity_type() -> String {
    "raw".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(default = "default_activity_type")]
    pub activity_type: String,
    pub name: String,
    pub date: NaiveDate,
    pub group_id: String,
    #[serde(default)]
    pub values: BTreeMap<String, ActivityValue>,
}

impl ActivityRecord {
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether the record carries anything worth loading
    pub fn has_values(&self) -> bool {
        !self.values.is_empty()
    }
}

/// Natural key of a canonical activity row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityKey {
    pub pipeline_id: String,
    pub activity_type: String,
    pub name: String,
    pub date: NaiveDate,
    pub group_id: String,
}

impl ActivityKey {
    pub fn for_record(pipeline_id: &str, record: &ActivityRecord) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            activity_type: record.activity_type.clone(),
            name: record.name.clone(),
            date: record.date,
            group_id: record.group_id.clone(),
        }
    }
}

/// One row of pipeline output aggregation: the raw activities of a pipeline
/// under `group_id` sharing a date and group-by values, folded together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedActivity {
    pub pipeline_id: String,
    pub group_id: String,
    pub date: NaiveDate,
    /// Group-by output values in declaration order
    pub group_key: Vec<String>,
    pub values: BTreeMap<String, ActivityValue>,
    /// Execution that last recomputed the row
    pub execution_id: String,
}

/// Parse every non-blank line of an artifact
pub fn parse_artifact(bytes: &[u8]) -> Result<Vec<ActivityRecord>> {
    let mut records = Vec::new();
    for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record = serde_json::from_slice::<ActivityRecord>(line)
            .map_err(|e| PipelineError::data(format!("artifact line {}: {e}", idx + 1)))?;
        records.push(record);
    }
    Ok(records)
}

/// Lenient parse of an artifact prefix: stops at the first line that does not
/// decode (typically the line cut by the byte limit) and after `limit` records.
pub fn probe_records(prefix: &[u8], limit: usize) -> Vec<ActivityRecord> {
    prefix
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map_while(|line| serde_json::from_slice::<ActivityRecord>(line).ok())
        .take(limit)
        .collect()
}

/// Serialize records into artifact form
pub fn encode_artifact(records: &[ActivityRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(record.to_line()?.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}
