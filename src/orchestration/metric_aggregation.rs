//! # Metric Aggregation Engine
//!
//! Resumable, one-metric-per-step aggregation of an execution's results.
//!
//! An [`AggregationStep`] carries everything needed to continue: the
//! remaining dependency-ordered metric queue, the group leaves the
//! execution touched and the affected time range. Each call to
//! [`MetricAggregationEngine::aggregate`] pops the head metric and, for
//! every group from the leaves up to the root (children before parents):
//!
//! 1. recomputes the metric's day cells over the affected range
//! 2. cascades day→week, day→month, month→quarter, quarter→year, each over
//!    the range widened to the target unit's boundaries
//!
//! Every write is an upsert over a recomputed range, so re-running a step
//! after a crash yields the same cells.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use super::metric_dependency::resolve_metric_queue;
use crate::error::{DependencyError, Result};
use crate::logging::log_aggregation_operation;
use crate::models::aggregation_job::groups_queue;
use crate::models::{
    AffectedTimeRange, AggregationJob, ExecutionContext, GroupQueueEntry, MetricDefinition,
    MetricQueueEntry, PipelineDefinition, ROLLUP_LADDER,
};
use crate::storage::hierarchy::rollup_order;
use crate::storage::{ActivityStore, DayAggregation, GroupHierarchy, MetricCatalog, MetricStore, Rollup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Succeeded,
}

/// Serializable aggregation state, handed back after every metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationStep {
    pub context: ExecutionContext,
    /// Metrics still to process, head first
    pub metric_queue: Vec<MetricQueueEntry>,
    /// Group leaves to cascade from
    pub groups_queue: Vec<GroupQueueEntry>,
    pub next_metric: Option<String>,
    /// Derived from the execution's activities when absent
    pub time_range: Option<AffectedTimeRange>,
    pub status: StepStatus,
}

impl AggregationStep {
    pub fn new(
        context: ExecutionContext,
        metric_queue: Vec<MetricQueueEntry>,
        leaves: &[String],
        time_range: Option<AffectedTimeRange>,
    ) -> Self {
        let mut step = Self {
            context,
            metric_queue,
            groups_queue: groups_queue(leaves),
            next_metric: None,
            time_range,
            status: StepStatus::InProgress,
        };
        step.refresh_head();
        step
    }

    pub fn is_done(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    fn refresh_head(&mut self) {
        self.next_metric = self.metric_queue.first().map(|e| e.metric.clone());
        if self.metric_queue.is_empty() {
            self.status = StepStatus::Succeeded;
        }
    }
}

pub struct MetricAggregationEngine {
    activities: Arc<dyn ActivityStore>,
    metrics: Arc<dyn MetricStore>,
    catalog: Arc<dyn MetricCatalog>,
    hierarchy: Arc<dyn GroupHierarchy>,
}

impl MetricAggregationEngine {
    pub fn new(
        activities: Arc<dyn ActivityStore>,
        metrics: Arc<dyn MetricStore>,
        catalog: Arc<dyn MetricCatalog>,
        hierarchy: Arc<dyn GroupHierarchy>,
    ) -> Self {
        Self {
            activities,
            metrics,
            catalog,
            hierarchy,
        }
    }

    /// Resolve the dependency-ordered queue for the metrics `pipeline` feeds
    pub async fn metric_queue(&self, tenant_id: &str, pipeline: &PipelineDefinition) -> Result<Vec<MetricQueueEntry>> {
        let seeds = pipeline.seed_metrics();
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let definitions = self.catalog.metrics(tenant_id).await?;
        Ok(resolve_metric_queue(definitions, &seeds)?)
    }

    /// First step of an execution's aggregation pass
    pub async fn plan(&self, context: &ExecutionContext, pipeline: &PipelineDefinition) -> Result<AggregationStep> {
        let queue = self.metric_queue(&context.tenant_id, pipeline).await?;
        let leaves = self
            .activities
            .group_leaves(&context.pipeline_id, &context.execution_id)
            .await?;
        let time_range = self
            .activities
            .affected_time_range(&context.pipeline_id, &context.execution_id)
            .await?;
        Ok(AggregationStep::new(context.clone(), queue, &leaves, time_range))
    }

    /// First step of a deferred job
    pub fn plan_job(&self, job: &AggregationJob, execution_id: &str, queue: Vec<MetricQueueEntry>) -> AggregationStep {
        let context = ExecutionContext {
            tenant_id: job.tenant_id.clone(),
            pipeline_id: job.pipeline_id.clone(),
            execution_id: execution_id.to_string(),
            group_context_id: job.group_context_id.clone(),
        };
        AggregationStep::new(context, queue, &job.group_leaves(), Some(job.time_range))
    }

    /// Process the metric at the head of the queue
    #[instrument(skip(self, step), fields(execution_id = %step.context.execution_id, next = ?step.next_metric))]
    pub async fn aggregate(&self, mut step: AggregationStep) -> Result<AggregationStep> {
        if step.metric_queue.is_empty() {
            step.refresh_head();
            return Ok(step);
        }
        let entry = step.metric_queue.remove(0);
        let started = Instant::now();

        let time_range = match step.time_range {
            Some(range) => Some(range),
            None => {
                self.activities
                    .affected_time_range(&step.context.pipeline_id, &step.context.execution_id)
                    .await?
            }
        };
        step.time_range = time_range;

        match time_range {
            Some(range) => {
                let definition = self.definition(&step.context.tenant_id, &entry.metric).await?;
                let input_metric_ids = self.input_metric_ids(&step.context.tenant_id, &definition).await?;
                let groups = self.groups_to_walk(&step).await?;
                for group in &groups {
                    self.aggregate_group(&step.context, &definition, &input_metric_ids, group, range)
                        .await?;
                }
                info!(
                    metric = %entry.metric,
                    order = entry.order,
                    groups = groups.len(),
                    from = %range.from,
                    to = %range.to,
                    "metric aggregated"
                );
            }
            None => debug!(metric = %entry.metric, "execution touched no dates, nothing to aggregate"),
        }

        log_aggregation_operation(
            "aggregate_metric",
            &step.context.pipeline_id,
            Some(&entry.metric),
            None,
            "completed",
            Some(started.elapsed().as_millis() as u64),
        );
        step.refresh_head();
        Ok(step)
    }

    /// Step until the queue is drained
    pub async fn run_to_completion(&self, mut step: AggregationStep) -> Result<AggregationStep> {
        while !step.is_done() {
            step = self.aggregate(step).await?;
        }
        Ok(step)
    }

    async fn definition(&self, tenant_id: &str, name: &str) -> Result<MetricDefinition> {
        self.catalog.metric(tenant_id, name).await?.ok_or_else(|| {
            DependencyError::UnknownMetric {
                metric: name.to_string(),
                referenced_by: "metric queue".to_string(),
            }
            .into()
        })
    }

    async fn input_metric_ids(&self, tenant_id: &str, definition: &MetricDefinition) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(definition.input_metrics.len());
        for name in &definition.input_metrics {
            let input = self.catalog.metric(tenant_id, name).await?.ok_or_else(|| {
                DependencyError::UnknownMetric {
                    metric: name.clone(),
                    referenced_by: definition.name.clone(),
                }
            })?;
            ids.push(input.id);
        }
        Ok(ids)
    }

    /// Union of the leaves' ancestor chains, deepest first. Without leaves
    /// the execution's group context is the starting point.
    async fn groups_to_walk(&self, step: &AggregationStep) -> Result<Vec<String>> {
        let mut leaves: Vec<String> = step.groups_queue.iter().map(|g| g.group.clone()).collect();
        if leaves.is_empty() {
            leaves.push(step.context.group_context_id.clone());
        }
        let mut chains = Vec::with_capacity(leaves.len());
        for leaf in &leaves {
            chains.push(self.hierarchy.ancestors(leaf).await?);
        }
        Ok(rollup_order(&chains))
    }

    async fn aggregate_group(
        &self,
        context: &ExecutionContext,
        definition: &MetricDefinition,
        input_metric_ids: &[String],
        group: &str,
        range: AffectedTimeRange,
    ) -> Result<()> {
        let days = self
            .metrics
            .aggregate_day(&DayAggregation {
                metric_id: definition.id.clone(),
                input_pipelines: definition.input_pipelines.clone(),
                input_metric_ids: input_metric_ids.to_vec(),
                group_id: group.to_string(),
                range,
                pipeline_id: context.pipeline_id.clone(),
                execution_id: context.execution_id.clone(),
            })
            .await?;

        let mut rolled = 0;
        for (from_unit, to_unit) in ROLLUP_LADDER {
            rolled += self
                .metrics
                .rollup(&Rollup {
                    metric_id: definition.id.clone(),
                    group_id: group.to_string(),
                    from_unit,
                    to_unit,
                    range: range.widen(to_unit),
                    pipeline_id: context.pipeline_id.clone(),
                    execution_id: context.execution_id.clone(),
                })
                .await?;
        }
        debug!(metric = %definition.name, group, days, rolled, "group aggregated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::encode_artifact;
    use crate::models::{
        ActivityRecord, ActivityValue, OutputType, PipelineInput, ProcessorOptions, TimeUnit,
        TransformerOutput,
    };
    use crate::storage::{MemoryCatalog, MemoryRelationalStore, PathGroupHierarchy, StagingKey};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn d(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn activity(name: &str, date: NaiveDate, group: &str, co2: f64) -> ActivityRecord {
        ActivityRecord {
            activity_type: "raw".into(),
            name: name.into(),
            date,
            group_id: group.into(),
            values: BTreeMap::from([("co2".to_string(), ActivityValue::Number(co2))]),
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext {
            tenant_id: "t1".into(),
            pipeline_id: "p1".into(),
            execution_id: "e1".into(),
            group_context_id: "/acme".into(),
        }
    }

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition {
            id: "p1".into(),
            tenant_id: "t1".into(),
            name: "fleet".into(),
            version: 1,
            outputs: vec![TransformerOutput {
                key: "co2".into(),
                output_type: OutputType::Number,
                metrics: vec!["emissions".into()],
                aggregate: None,
            }],
            processor_options: ProcessorOptions::default(),
        }
    }

    fn catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        catalog.insert_metric(MetricDefinition {
            id: "m-emissions".into(),
            tenant_id: "t1".into(),
            name: "emissions".into(),
            time_unit: TimeUnit::Day,
            input_metrics: vec![],
            input_pipelines: vec![PipelineInput {
                pipeline_id: "p1".into(),
                output: "co2".into(),
            }],
        });
        catalog.insert_metric(MetricDefinition {
            id: "m-total".into(),
            tenant_id: "t1".into(),
            name: "total".into(),
            time_unit: TimeUnit::Day,
            input_metrics: vec!["emissions".into()],
            input_pipelines: vec![],
        });
        catalog
    }

    async fn seed(store: &MemoryRelationalStore, records: &[ActivityRecord]) {
        let key = StagingKey::new("p1", "e1", 0);
        let mut session = store.open_session().await.unwrap();
        session.create_staging_area(&key).await.unwrap();
        session
            .copy_from_artifact(&key, &encode_artifact(records).unwrap())
            .await
            .unwrap();
        session.migrate(&key).await.unwrap();
        session.close().await.unwrap();
        store.refresh_latest_values("p1", "e1").await.unwrap();
    }

    fn engine(store: &MemoryRelationalStore) -> MetricAggregationEngine {
        MetricAggregationEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(catalog()),
            Arc::new(PathGroupHierarchy),
        )
    }

    async fn cell(store: &MemoryRelationalStore, metric: &str, group: &str, unit: TimeUnit, date: NaiveDate) -> (f64, f64) {
        let values = store
            .metric_values(metric, group, unit, &AffectedTimeRange::single_day(date))
            .await
            .unwrap();
        values
            .first()
            .map(|v| (v.group_value, v.sub_groups_value))
            .unwrap_or_default()
    }

    fn records() -> Vec<ActivityRecord> {
        vec![
            activity("hq", d(1, 1), "/acme", 1.0),
            activity("truck", d(1, 1), "/acme/a", 2.0),
            activity("van", d(1, 3), "/acme/b", 3.0),
            activity("ship", d(2, 10), "/acme/a", 4.0),
        ]
    }

    #[tokio::test]
    async fn test_steps_follow_dependency_order() {
        let store = MemoryRelationalStore::new();
        seed(&store, &records()).await;
        let engine = engine(&store);

        let step = engine.plan(&context(), &pipeline()).await.unwrap();
        assert_eq!(step.next_metric.as_deref(), Some("emissions"));
        assert_eq!(step.time_range, Some(AffectedTimeRange::new(d(1, 1), d(2, 10)).unwrap()));

        let step = engine.aggregate(step).await.unwrap();
        assert_eq!(step.status, StepStatus::InProgress);
        assert_eq!(step.next_metric.as_deref(), Some("total"));

        let step = engine.aggregate(step).await.unwrap();
        assert!(step.is_done());
        assert!(step.metric_queue.is_empty());
    }

    #[tokio::test]
    async fn test_hierarchy_and_time_ladder_are_consistent() {
        let store = MemoryRelationalStore::new();
        seed(&store, &records()).await;
        let engine = engine(&store);
        let step = engine.plan(&context(), &pipeline()).await.unwrap();
        engine.run_to_completion(step).await.unwrap();

        assert_eq!(cell(&store, "m-emissions", "/acme/a", TimeUnit::Day, d(1, 1)).await, (2.0, 0.0));
        assert_eq!(cell(&store, "m-emissions", "/acme", TimeUnit::Day, d(1, 1)).await, (1.0, 2.0));
        assert_eq!(cell(&store, "m-emissions", "/", TimeUnit::Day, d(1, 1)).await, (0.0, 3.0));

        // 2024-01-01 is a Monday, so both January days share a week bucket
        assert_eq!(cell(&store, "m-emissions", "/acme", TimeUnit::Week, d(1, 1)).await, (1.0, 5.0));
        assert_eq!(cell(&store, "m-emissions", "/acme", TimeUnit::Month, d(2, 1)).await, (0.0, 4.0));
        assert_eq!(cell(&store, "m-emissions", "/", TimeUnit::Quarter, d(1, 1)).await, (0.0, 10.0));

        let (group, sub) = cell(&store, "m-emissions", "/", TimeUnit::Year, d(1, 1)).await;
        assert_eq!(group + sub, 10.0);

        // dependent metric sees the input metric's group values
        assert_eq!(cell(&store, "m-total", "/acme", TimeUnit::Day, d(1, 1)).await, (1.0, 2.0));
    }

    #[tokio::test]
    async fn test_rerunning_aggregation_does_not_double_count() {
        let store = MemoryRelationalStore::new();
        seed(&store, &records()).await;
        let engine = engine(&store);

        for _ in 0..2 {
            let step = engine.plan(&context(), &pipeline()).await.unwrap();
            engine.run_to_completion(step).await.unwrap();
        }
        assert_eq!(cell(&store, "m-emissions", "/acme", TimeUnit::Week, d(1, 1)).await, (1.0, 5.0));
        let (group, sub) = cell(&store, "m-emissions", "/", TimeUnit::Year, d(1, 1)).await;
        assert_eq!(group + sub, 10.0);
    }

    #[tokio::test]
    async fn test_step_round_trips_through_json() {
        let store = MemoryRelationalStore::new();
        seed(&store, &records()).await;
        let engine = engine(&store);

        let step = engine.plan(&context(), &pipeline()).await.unwrap();
        let step = engine.aggregate(step).await.unwrap();
        let resumed: AggregationStep = serde_json::from_str(&serde_json::to_string(&step).unwrap()).unwrap();
        let done = engine.run_to_completion(resumed).await.unwrap();
        assert!(done.is_done());
    }

    #[tokio::test]
    async fn test_pipeline_without_metrics_is_done_immediately() {
        let store = MemoryRelationalStore::new();
        let engine = engine(&store);
        let mut pipeline = pipeline();
        pipeline.outputs[0].metrics.clear();
        let step = engine.plan(&context(), &pipeline).await.unwrap();
        assert!(step.is_done());
        assert_eq!(step.next_metric, None);
    }
}
