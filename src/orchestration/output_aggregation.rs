//! # Pipeline Output Aggregation
//!
//! Folds a pipeline's raw activities into `aggregated` rows once an
//! execution has loaded. Outputs declaring `aggregate: group_by` key the rows
//! together with the activity date; the other aggregated outputs are reduced
//! with their function (`sum`, `mean`, `min`, `max`, `count`).
//!
//! The pass covers every raw activity of the pipeline under the execution's
//! group context within the dates the execution touched, reading latest
//! values, so rows are recomputed from the current state rather than
//! incremented.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::models::{
    ActivityRecord, ActivityValue, AggregatedActivity, ExecutionContext, OutputAggregate,
    PipelineDefinition,
};
use crate::storage::ActivityStore;

/// Group key entry for an activity lacking a group-by output
pub const MISSING_GROUP_VALUE: &str = "__none__";

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    count: u64,
    numbers: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn add(&mut self, value: &ActivityValue) {
        self.count += 1;
        let Some(n) = value.as_number() else {
            return;
        };
        if self.numbers == 0 {
            self.min = n;
            self.max = n;
        } else {
            self.min = self.min.min(n);
            self.max = self.max.max(n);
        }
        self.numbers += 1;
        self.sum += n;
    }

    /// `None` when the function has nothing numeric to work on
    fn finish(&self, function: OutputAggregate) -> Option<f64> {
        match function {
            OutputAggregate::Count => Some(self.count as f64),
            _ if self.numbers == 0 => None,
            OutputAggregate::Sum => Some(self.sum),
            OutputAggregate::Mean => Some(self.sum / self.numbers as f64),
            OutputAggregate::Min => Some(self.min),
            OutputAggregate::Max => Some(self.max),
            OutputAggregate::GroupBy => None,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    group_values: BTreeMap<String, ActivityValue>,
    folded: BTreeMap<String, Accumulator>,
}

/// Fold `records` into one row per date and group-by combination.
///
/// A row whose `sum`/`mean`/`min`/`max` output saw no numeric value is
/// dropped.
pub fn fold_outputs(
    pipeline: &PipelineDefinition,
    context: &ExecutionContext,
    records: &[ActivityRecord],
) -> Vec<AggregatedActivity> {
    let group_by: Vec<&str> = pipeline
        .outputs
        .iter()
        .filter(|o| o.aggregate == Some(OutputAggregate::GroupBy))
        .map(|o| o.key.as_str())
        .collect();
    let folded: Vec<(&str, OutputAggregate)> = pipeline
        .outputs
        .iter()
        .filter_map(|o| match o.aggregate {
            Some(OutputAggregate::GroupBy) | None => None,
            Some(function) => Some((o.key.as_str(), function)),
        })
        .collect();
    if folded.is_empty() {
        return Vec::new();
    }

    let mut buckets: BTreeMap<(NaiveDate, Vec<String>), Bucket> = BTreeMap::new();
    for record in records {
        let group_key: Vec<String> = group_by
            .iter()
            .map(|key| {
                record
                    .values
                    .get(*key)
                    .map(ActivityValue::key_text)
                    .unwrap_or_else(|| MISSING_GROUP_VALUE.to_string())
            })
            .collect();
        let bucket = buckets.entry((record.date, group_key)).or_default();
        for key in &group_by {
            if let Some(value) = record.values.get(*key) {
                bucket.group_values.entry(key.to_string()).or_insert_with(|| value.clone());
            }
        }
        for (key, _) in &folded {
            let accumulator = bucket.folded.entry(key.to_string()).or_default();
            if let Some(value) = record.values.get(*key) {
                accumulator.add(value);
            }
        }
    }

    let mut rows = Vec::with_capacity(buckets.len());
    'buckets: for ((date, group_key), bucket) in buckets {
        let mut values = bucket.group_values;
        for (key, function) in &folded {
            let accumulator = bucket.folded.get(*key).copied().unwrap_or_default();
            match accumulator.finish(*function) {
                Some(n) => {
                    values.insert(key.to_string(), ActivityValue::Number(n));
                }
                None => {
                    debug!(%date, key, "no numeric values to aggregate, row skipped");
                    continue 'buckets;
                }
            }
        }
        rows.push(AggregatedActivity {
            pipeline_id: context.pipeline_id.clone(),
            group_id: context.group_context_id.clone(),
            date,
            group_key,
            values,
            execution_id: context.execution_id.clone(),
        });
    }
    rows
}

pub struct OutputAggregator {
    activities: Arc<dyn ActivityStore>,
}

impl OutputAggregator {
    pub fn new(activities: Arc<dyn ActivityStore>) -> Self {
        Self { activities }
    }

    /// Recompute the aggregated rows of the dates the execution touched.
    /// Returns the number of rows written.
    #[instrument(skip(self, pipeline), fields(execution_id = %context.execution_id))]
    pub async fn aggregate(&self, context: &ExecutionContext, pipeline: &PipelineDefinition) -> Result<u64> {
        if !pipeline.aggregates_outputs() {
            return Ok(0);
        }
        let Some(range) = self
            .activities
            .affected_time_range(&context.pipeline_id, &context.execution_id)
            .await?
        else {
            return Ok(0);
        };
        let records = self
            .activities
            .latest_activities(&context.pipeline_id, &context.group_context_id, &range)
            .await?;
        let rows = fold_outputs(pipeline, context, &records);
        let written = self.activities.upsert_aggregated_activities(&rows).await?;
        info!(
            pipeline_id = %context.pipeline_id,
            activities = records.len(),
            rows = written,
            "pipeline outputs aggregated"
        );
        Ok(written)
    }
}
