use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::time_range::TimeUnit;

/// A pipeline output that feeds a metric
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineInput {
    pub pipeline_id: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Reporting granularity; rollups populate every unit regardless
    #[serde(default = "default_time_unit")]
    pub time_unit: TimeUnit,
    /// Metrics whose values roll into this one
    #[serde(default)]
    pub input_metrics: Vec<String>,
    #[serde(default)]
    pub input_pipelines: Vec<PipelineInput>,
}

fn default_time_unit() -> TimeUnit {
    TimeUnit::Day
}

impl MetricDefinition {
    pub fn consumes_pipeline_output(&self, pipeline_id: &str, output: &str) -> bool {
        self.input_pipelines
            .iter()
            .any(|i| i.pipeline_id == pipeline_id && i.output == output)
    }
}

/// One position in the dependency-sorted processing queue (1-based)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricQueueEntry {
    pub order: u32,
    pub metric: String,
}

/// Aggregated metric cell, `date` being the bucket start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub metric_id: String,
    pub group_id: String,
    pub time_unit: TimeUnit,
    pub date: NaiveDate,
    /// Contribution recorded directly at this group
    pub group_value: f64,
    /// Total of all descendant groups
    pub sub_groups_value: f64,
    pub pipeline_id: String,
    pub execution_id: String,
    pub updated_at: DateTime<Utc>,
}

impl MetricValue {
    pub fn total(&self) -> f64 {
        self.group_value + self.sub_groups_value
    }
}

/// Cell identity used by stores
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricCellKey {
    pub metric_id: String,
    pub group_id: String,
    pub time_unit: TimeUnit,
    pub date: NaiveDate,
}
