use serde::{Deserialize, Serialize};

use crate::constants::defaults::BYTES_PER_MB;

/// Value type a transformer output produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Number,
    String,
    Boolean,
}

/// Role of an output in pipeline output aggregation. `GroupBy` outputs key
/// the aggregated rows (together with the activity date); the rest are folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAggregate {
    GroupBy,
    Sum,
    Mean,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerOutput {
    pub key: String,
    pub output_type: OutputType,
    /// Metrics fed directly by this output
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub aggregate: Option<OutputAggregate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorOptions {
    /// Overrides the engine's default chunk size, in MB of input
    #[serde(default)]
    pub chunk_size_mb: Option<u64>,
    /// Roll metrics up inside the execution instead of deferring to a job
    #[serde(default)]
    pub trigger_metric_aggregations: bool,
}

/// Pipeline definition as stored by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: i32,
    pub outputs: Vec<TransformerOutput>,
    #[serde(default)]
    pub processor_options: ProcessorOptions,
}

fn default_version() -> i32 {
    1
}

impl PipelineDefinition {
    /// Metrics named by the outputs, first occurrence order, duplicates removed
    pub fn seed_metrics(&self) -> Vec<String> {
        let mut seeds: Vec<String> = Vec::new();
        for metric in self.outputs.iter().flat_map(|o| o.metrics.iter()) {
            if !seeds.contains(metric) {
                seeds.push(metric.clone());
            }
        }
        seeds
    }

    pub fn chunk_size_bytes(&self, engine_default: u64) -> u64 {
        match self.processor_options.chunk_size_mb {
            Some(mb) if mb > 0 => mb.saturating_mul(BYTES_PER_MB),
            _ => engine_default,
        }
    }

    pub fn triggers_metric_aggregations(&self) -> bool {
        self.processor_options.trigger_metric_aggregations
    }

    /// Whether any output is folded by pipeline output aggregation
    pub fn aggregates_outputs(&self) -> bool {
        self.outputs
            .iter()
            .any(|o| o.aggregate.is_some_and(|a| a != OutputAggregate::GroupBy))
    }
}
