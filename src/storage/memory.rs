//! In-memory implementations of the storage collaborators, used by the test
//! suite and for embedded single-process runs.
//!
//! [`MemoryRelationalStore`] mirrors the PostgreSQL layout: staging areas
//! hold raw JSON rows, canonical activities are deduplicated on their natural
//! key, values are unique per `(activity, execution, key)` and the
//! latest-value snapshot points each `(activity, key)` at one execution.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::hierarchy::{is_ancestor_or_self, normalize, parent_of};
use super::{
    ActivityStore, AggregationJobRepository, DayAggregation, ExecutionRepository, LockAttempt,
    LockTable, MetricCatalog, MetricStore, MigrationSummary, PipelineCatalog, Rollup,
    StagingKey, StagingSession,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ActivityKey, ActivityRecord, ActivityValue, AffectedTimeRange, AggregatedActivity, AggregationJob,
    AggregationJobStatus, ExecutionTransition, LockRecord, MetricCellKey, MetricDefinition,
    MetricValue, PipelineDefinition, PipelineExecution, TimeUnit,
};
use crate::state_machine::{ExecutionStatus, OrchestratorStage};

#[derive(Debug)]
struct StagingArea {
    execution_id: String,
    rows: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct StoredValue {
    pipeline_id: String,
    value: ActivityValue,
}

#[derive(Debug, Clone)]
struct LatestValue {
    value: ActivityValue,
    execution_id: String,
}

#[derive(Debug, Default)]
struct RelationalState {
    staging: HashMap<String, StagingArea>,
    activities: BTreeMap<ActivityKey, i64>,
    activity_keys: HashMap<i64, ActivityKey>,
    next_activity_id: i64,
    /// `(activity_id, execution_id, key)`
    values: BTreeMap<(i64, String, String), StoredValue>,
    /// `(activity_id, key)`
    latest: BTreeMap<(i64, String), LatestValue>,
    metric_values: BTreeMap<MetricCellKey, MetricValue>,
    /// `(pipeline_id, group_id, date, group_key)`
    aggregated: BTreeMap<(String, String, NaiveDate, Vec<String>), AggregatedActivity>,
}

impl RelationalState {
    fn activity_id(&mut self, key: ActivityKey) -> (i64, bool) {
        if let Some(id) = self.activities.get(&key) {
            return (*id, false);
        }
        self.next_activity_id += 1;
        let id = self.next_activity_id;
        self.activity_keys.insert(id, key.clone());
        self.activities.insert(key, id);
        (id, true)
    }

    /// Activities that received a value from the execution
    fn execution_activities(&self, pipeline_id: &str, execution_id: &str) -> Vec<&ActivityKey> {
        let ids: BTreeSet<i64> = self
            .values
            .iter()
            .filter(|((_, exec, _), v)| exec == execution_id && v.pipeline_id == pipeline_id)
            .map(|((id, _, _), _)| *id)
            .collect();
        ids.iter().filter_map(|id| self.activity_keys.get(id)).collect()
    }

    fn upsert_cell(&mut self, key: MetricCellKey, group_value: f64, sub_groups_value: f64, pipeline_id: &str, execution_id: &str) {
        let value = MetricValue {
            metric_id: key.metric_id.clone(),
            group_id: key.group_id.clone(),
            time_unit: key.time_unit,
            date: key.date,
            group_value,
            sub_groups_value,
            pipeline_id: pipeline_id.to_string(),
            execution_id: execution_id.to_string(),
            updated_at: Utc::now(),
        };
        self.metric_values.insert(key, value);
    }
}

/// Activity and metric store sharing one in-memory state
#[derive(Debug, Clone, Default)]
pub struct MemoryRelationalStore {
    state: Arc<Mutex<RelationalState>>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest numeric value of `(activity, key)`, for assertions
    pub fn latest_number(&self, key: &ActivityKey, value_key: &str) -> Option<f64> {
        let state = self.state.lock();
        let id = state.activities.get(key)?;
        state
            .latest
            .get(&(*id, value_key.to_string()))
            .and_then(|l| l.value.as_number())
    }

    pub fn value_count(&self) -> usize {
        self.state.lock().values.len()
    }
}

#[derive(Debug)]
pub struct MemoryStagingSession {
    state: Arc<Mutex<RelationalState>>,
}

#[async_trait]
impl StagingSession for MemoryStagingSession {
    async fn create_staging_area(&mut self, key: &StagingKey) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.staging.insert(
            key.table_name(),
            StagingArea {
                execution_id: key.execution_id.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn copy_from_artifact(&mut self, key: &StagingKey, artifact: &[u8]) -> StoreResult<u64> {
        let table = key.table_name();
        let mut rows = Vec::new();
        for (idx, line) in artifact.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let row: serde_json::Value = serde_json::from_slice(line).map_err(|e| {
                StoreError::database("copy", format!("{table} line {}: {e}", idx + 1))
            })?;
            rows.push(row);
        }

        let mut state = self.state.lock();
        let area = state
            .staging
            .get_mut(&table)
            .ok_or_else(|| StoreError::not_found("staging table", table.clone()))?;
        if rows.is_empty() {
            return Err(StoreError::ZeroRowsCopied { table });
        }
        let copied = rows.len() as u64;
        area.rows.extend(rows);
        Ok(copied)
    }

    async fn migrate(&mut self, key: &StagingKey) -> StoreResult<MigrationSummary> {
        let table = key.table_name();
        let mut state = self.state.lock();
        let area = state
            .staging
            .get(&table)
            .ok_or_else(|| StoreError::not_found("staging table", table.clone()))?;

        // Decode everything first so a bad row leaves the canonical store untouched
        let records = area
            .rows
            .iter()
            .map(|row| serde_json::from_value::<ActivityRecord>(row.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::database("migrate", format!("{table}: {e}")))?;

        let mut summary = MigrationSummary::default();
        for record in records {
            let (activity_id, created) =
                state.activity_id(ActivityKey::for_record(&key.pipeline_id, &record));
            if created {
                summary.activities_upserted += 1;
            }
            for (value_key, value) in record.values {
                let slot = (activity_id, key.execution_id.clone(), value_key);
                if state.values.contains_key(&slot) {
                    continue;
                }
                match value {
                    ActivityValue::Number(_) => summary.number_values += 1,
                    ActivityValue::Text(_) => summary.string_values += 1,
                    ActivityValue::Boolean(_) => summary.boolean_values += 1,
                }
                state.values.insert(
                    slot,
                    StoredValue {
                        pipeline_id: key.pipeline_id.clone(),
                        value,
                    },
                );
            }
        }
        debug!(table = %table, values = summary.values_written(), "staging area migrated");
        Ok(summary)
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for MemoryRelationalStore {
    async fn open_session(&self) -> StoreResult<Box<dyn StagingSession>> {
        Ok(Box::new(MemoryStagingSession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn staging_area_count(&self, execution_id: &str) -> StoreResult<usize> {
        Ok(self
            .state
            .lock()
            .staging
            .values()
            .filter(|a| a.execution_id == execution_id)
            .count())
    }

    async fn drop_staging_areas(&self, execution_id: &str) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let before = state.staging.len();
        state.staging.retain(|_, a| a.execution_id != execution_id);
        Ok(before - state.staging.len())
    }

    async fn refresh_latest_values(&self, pipeline_id: &str, execution_id: &str) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let updates: Vec<((i64, String), LatestValue)> = state
            .values
            .iter()
            .filter(|((_, exec, _), v)| exec == execution_id && v.pipeline_id == pipeline_id)
            .map(|((id, exec, key), v)| {
                (
                    (*id, key.clone()),
                    LatestValue {
                        value: v.value.clone(),
                        execution_id: exec.clone(),
                    },
                )
            })
            .collect();
        let count = updates.len() as u64;
        state.latest.extend(updates);
        Ok(count)
    }

    async fn affected_time_range(
        &self,
        pipeline_id: &str,
        execution_id: &str,
    ) -> StoreResult<Option<AffectedTimeRange>> {
        let state = self.state.lock();
        Ok(AffectedTimeRange::covering(
            state
                .execution_activities(pipeline_id, execution_id)
                .into_iter()
                .map(|a| a.date),
        ))
    }

    async fn group_leaves(&self, pipeline_id: &str, execution_id: &str) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        let leaves: BTreeSet<String> = state
            .execution_activities(pipeline_id, execution_id)
            .into_iter()
            .map(|a| normalize(&a.group_id))
            .collect();
        Ok(leaves.into_iter().collect())
    }

    async fn activity_count(&self, pipeline_id: &str) -> StoreResult<u64> {
        Ok(self
            .state
            .lock()
            .activities
            .keys()
            .filter(|k| k.pipeline_id == pipeline_id)
            .count() as u64)
    }

    async fn latest_activities(
        &self,
        pipeline_id: &str,
        group_id: &str,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<ActivityRecord>> {
        let group = normalize(group_id);
        let state = self.state.lock();
        let mut records: BTreeMap<i64, ActivityRecord> = BTreeMap::new();
        for ((activity_id, value_key), latest) in &state.latest {
            let Some(activity) = state.activity_keys.get(activity_id) else {
                continue;
            };
            if activity.pipeline_id != pipeline_id
                || activity.activity_type != "raw"
                || !range.contains(activity.date)
                || !is_ancestor_or_self(&group, &activity.group_id)
            {
                continue;
            }
            records
                .entry(*activity_id)
                .or_insert_with(|| ActivityRecord {
                    activity_type: activity.activity_type.clone(),
                    name: activity.name.clone(),
                    date: activity.date,
                    group_id: normalize(&activity.group_id),
                    values: BTreeMap::new(),
                })
                .values
                .insert(value_key.clone(), latest.value.clone());
        }
        Ok(records.into_values().collect())
    }

    async fn upsert_aggregated_activities(&self, rows: &[AggregatedActivity]) -> StoreResult<u64> {
        let mut state = self.state.lock();
        for row in rows {
            let key = (
                row.pipeline_id.clone(),
                normalize(&row.group_id),
                row.date,
                row.group_key.clone(),
            );
            state.aggregated.insert(key, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn aggregated_activities(
        &self,
        pipeline_id: &str,
        group_id: &str,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<AggregatedActivity>> {
        let group = normalize(group_id);
        Ok(self
            .state
            .lock()
            .aggregated
            .iter()
            .filter(|((pipeline, g, date, _), _)| pipeline == pipeline_id && *g == group && range.contains(*date))
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[async_trait]
impl MetricStore for MemoryRelationalStore {
    async fn aggregate_day(&self, request: &DayAggregation) -> StoreResult<u64> {
        let group = normalize(&request.group_id);
        let mut state = self.state.lock();
        let mut group_values: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        let mut sub_values: BTreeMap<NaiveDate, f64> = BTreeMap::new();

        for ((activity_id, value_key), latest) in &state.latest {
            let Some(activity) = state.activity_keys.get(activity_id) else {
                continue;
            };
            if normalize(&activity.group_id) != group || !request.range.contains(activity.date) {
                continue;
            }
            let consumed = request
                .input_pipelines
                .iter()
                .any(|i| i.pipeline_id == activity.pipeline_id && &i.output == value_key);
            if let (true, Some(number)) = (consumed, latest.value.as_number()) {
                *group_values.entry(activity.date).or_default() += number;
            }
        }

        for (key, cell) in &state.metric_values {
            if key.time_unit != TimeUnit::Day || !request.range.contains(key.date) {
                continue;
            }
            if key.group_id == group && request.input_metric_ids.contains(&key.metric_id) {
                *group_values.entry(key.date).or_default() += cell.group_value;
            }
            if key.metric_id == request.metric_id && parent_of(&key.group_id).as_deref() == Some(group.as_str()) {
                *sub_values.entry(key.date).or_default() += cell.total();
            }
        }

        let dates: BTreeSet<NaiveDate> = group_values.keys().chain(sub_values.keys()).copied().collect();
        for date in &dates {
            let key = MetricCellKey {
                metric_id: request.metric_id.clone(),
                group_id: group.clone(),
                time_unit: TimeUnit::Day,
                date: *date,
            };
            state.upsert_cell(
                key,
                group_values.get(date).copied().unwrap_or_default(),
                sub_values.get(date).copied().unwrap_or_default(),
                &request.pipeline_id,
                &request.execution_id,
            );
        }
        Ok(dates.len() as u64)
    }

    async fn rollup(&self, request: &Rollup) -> StoreResult<u64> {
        let group = normalize(&request.group_id);
        let mut state = self.state.lock();
        let mut buckets: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();

        for (key, cell) in &state.metric_values {
            if key.metric_id == request.metric_id
                && key.group_id == group
                && key.time_unit == request.from_unit
                && request.range.contains(key.date)
            {
                let bucket = buckets.entry(request.to_unit.start_of(key.date)).or_default();
                bucket.0 += cell.group_value;
                bucket.1 += cell.sub_groups_value;
            }
        }

        let written = buckets.len() as u64;
        for (date, (group_value, sub_groups_value)) in buckets {
            let key = MetricCellKey {
                metric_id: request.metric_id.clone(),
                group_id: group.clone(),
                time_unit: request.to_unit,
                date,
            };
            state.upsert_cell(key, group_value, sub_groups_value, &request.pipeline_id, &request.execution_id);
        }
        Ok(written)
    }

    async fn metric_values(
        &self,
        metric_id: &str,
        group_id: &str,
        unit: TimeUnit,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<MetricValue>> {
        let group = normalize(group_id);
        Ok(self
            .state
            .lock()
            .metric_values
            .iter()
            .filter(|(k, _)| {
                k.metric_id == metric_id && k.group_id == group && k.time_unit == unit && range.contains(k.date)
            })
            .map(|(_, v)| v.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryExecutionRepository {
    executions: DashMap<String, PipelineExecution>,
    transitions: DashMap<String, Vec<ExecutionTransition>>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(execution_id: &str) -> StoreError {
        StoreError::not_found("pipeline execution", execution_id)
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn create(&self, execution: &PipelineExecution) -> StoreResult<()> {
        match self.executions.entry(execution.execution_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::invalid_state(
                "pipeline execution",
                &execution.execution_id,
                "already exists",
            )),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, execution_id: &str) -> StoreResult<Option<PipelineExecution>> {
        Ok(self.executions.get(execution_id).map(|e| e.clone()))
    }

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        message: Option<String>,
    ) -> StoreResult<PipelineExecution> {
        let mut execution = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| Self::missing(execution_id))?;
        if !execution.status.can_transition_to(status) {
            return Err(StoreError::invalid_state(
                "pipeline execution",
                execution_id,
                format!("{} -> {status}", execution.status),
            ));
        }
        execution.status = status;
        if message.is_some() {
            execution.status_message = message;
        }
        execution.audit_version += 1;
        execution.updated_at = Utc::now();
        Ok(execution.clone())
    }

    async fn amend_status_message(&self, execution_id: &str, message: &str) -> StoreResult<PipelineExecution> {
        let mut execution = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| Self::missing(execution_id))?;
        execution.status_message = Some(message.to_string());
        execution.updated_at = Utc::now();
        Ok(execution.clone())
    }

    async fn claim(&self, execution_id: &str, at: DateTime<Utc>) -> StoreResult<Option<PipelineExecution>> {
        let mut execution = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| Self::missing(execution_id))?;
        if execution.status != ExecutionStatus::Waiting {
            return Ok(None);
        }
        execution.status = ExecutionStatus::InProgress;
        execution.started_at.get_or_insert(at);
        execution.audit_version += 1;
        execution.updated_at = Utc::now();
        Ok(Some(execution.clone()))
    }

    async fn record_transition(
        &self,
        execution_id: &str,
        from: Option<OrchestratorStage>,
        to: OrchestratorStage,
    ) -> StoreResult<ExecutionTransition> {
        let mut rows = self.transitions.entry(execution_id.to_string()).or_default();
        for row in rows.iter_mut() {
            row.most_recent = false;
        }
        let transition = ExecutionTransition {
            execution_id: execution_id.to_string(),
            from_stage: from,
            to_stage: to,
            sort_key: rows.len() as i32 + 1,
            most_recent: true,
            created_at: Utc::now(),
        };
        rows.push(transition.clone());
        Ok(transition)
    }

    async fn transitions(&self, execution_id: &str) -> StoreResult<Vec<ExecutionTransition>> {
        Ok(self
            .transitions
            .get(execution_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAggregationJobRepository {
    jobs: DashMap<String, AggregationJob>,
}

impl MemoryAggregationJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl AggregationJobRepository for MemoryAggregationJobRepository {
    async fn create(&self, job: &AggregationJob) -> StoreResult<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<AggregationJob>> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }

    async fn update(&self, job: &AggregationJob) -> StoreResult<()> {
        let mut stored = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::not_found("aggregation job", &job.id))?;
        if stored.status != AggregationJobStatus::Pending {
            return Err(StoreError::invalid_state(
                "aggregation job",
                &job.id,
                format!("cannot modify a {} job", stored.status),
            ));
        }
        stored.time_range = job.time_range;
        stored.groups_queue = job.groups_queue.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(
        &self,
        job_id: &str,
        status: AggregationJobStatus,
        message: Option<String>,
    ) -> StoreResult<AggregationJob> {
        let mut stored = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("aggregation job", job_id))?;
        if stored.status.is_terminal() {
            return Err(StoreError::invalid_state(
                "aggregation job",
                job_id,
                format!("{} is terminal", stored.status),
            ));
        }
        stored.status = status;
        stored.status_message = message;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn claim(&self, job_id: &str) -> StoreResult<Option<AggregationJob>> {
        let mut stored = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("aggregation job", job_id))?;
        if stored.status != AggregationJobStatus::Pending {
            return Ok(None);
        }
        stored.status = AggregationJobStatus::Running;
        stored.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }

    async fn find_pending(&self, tenant_id: &str, pipeline_id: &str) -> StoreResult<Vec<AggregationJob>> {
        let mut pending: Vec<AggregationJob> = self
            .jobs
            .iter()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && j.pipeline_id == pipeline_id
                    && j.status == AggregationJobStatus::Pending
            })
            .map(|j| j.clone())
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending)
    }
}

/// Pipeline and metric definitions keyed by tenant
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    pipelines: DashMap<(String, String), PipelineDefinition>,
    metrics: RwLock<BTreeMap<String, Vec<MetricDefinition>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pipeline(&self, pipeline: PipelineDefinition) {
        self.pipelines
            .insert((pipeline.tenant_id.clone(), pipeline.id.clone()), pipeline);
    }

    /// Replaces a metric of the same name
    pub fn insert_metric(&self, metric: MetricDefinition) {
        let mut metrics = self.metrics.write();
        let tenant = metrics.entry(metric.tenant_id.clone()).or_default();
        tenant.retain(|m| m.name != metric.name);
        tenant.push(metric);
    }
}

#[async_trait]
impl PipelineCatalog for MemoryCatalog {
    async fn pipeline(&self, tenant_id: &str, pipeline_id: &str) -> StoreResult<Option<PipelineDefinition>> {
        Ok(self
            .pipelines
            .get(&(tenant_id.to_string(), pipeline_id.to_string()))
            .map(|p| p.clone()))
    }
}

#[async_trait]
impl MetricCatalog for MemoryCatalog {
    async fn metrics(&self, tenant_id: &str) -> StoreResult<Vec<MetricDefinition>> {
        Ok(self.metrics.read().get(tenant_id).cloned().unwrap_or_default())
    }
}

/// Lock table with expiry evaluated on every attempt
#[derive(Debug, Default)]
pub struct MemoryLockTable {
    locks: DashMap<String, LockRecord>,
}

impl MemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(name: &str, holder: &str, ttl: Duration) -> LockRecord {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        LockRecord {
            name: name.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }
}

#[async_trait]
impl LockTable for MemoryLockTable {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<LockAttempt> {
        match self.locks.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                let record = Self::record(name, holder, ttl);
                slot.insert(record.clone());
                Ok(LockAttempt::Acquired(record))
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.is_expired(Utc::now()) {
                    let record = Self::record(name, holder, ttl);
                    slot.insert(record.clone());
                    Ok(LockAttempt::Acquired(record))
                } else {
                    Ok(LockAttempt::Held(current.clone()))
                }
            }
        }
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        match self.locks.get_mut(name) {
            Some(mut record) if record.holder == holder => {
                let renewed = Self::record(name, holder, ttl);
                record.expires_at = renewed.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder: &str) -> StoreResult<bool> {
        Ok(self
            .locks
            .remove_if(name, |_, record| record.holder == holder)
            .is_some())
    }

    async fn current(&self, name: &str) -> StoreResult<Option<LockRecord>> {
        Ok(self.locks.get(name).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PipelineInput;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn line(name: &str, day: u32, group: &str, co2: f64) -> String {
        format!(
            r#"{{"name":"{name}","date":"{}","group_id":"{group}","values":{{"co2":{co2},"fuel":"diesel"}}}}"#,
            d(day)
        )
    }

    async fn load(store: &MemoryRelationalStore, execution: &str, sequence: u32, lines: &[String]) -> MigrationSummary {
        let key = StagingKey::new("p1", execution, sequence);
        let mut session = store.open_session().await.unwrap();
        session.create_staging_area(&key).await.unwrap();
        session
            .copy_from_artifact(&key, lines.join("\n").as_bytes())
            .await
            .unwrap();
        let summary = session.migrate(&key).await.unwrap();
        session.close().await.unwrap();
        summary
    }

    #[tokio::test]
    async fn test_empty_copy_reports_zero_rows() {
        let store = MemoryRelationalStore::new();
        let key = StagingKey::new("p1", "e1", 0);
        let mut session = store.open_session().await.unwrap();
        session.create_staging_area(&key).await.unwrap();
        let err = session.copy_from_artifact(&key, b"\n  \n").await.unwrap_err();
        assert!(err.is_zero_rows_copied());
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let store = MemoryRelationalStore::new();
        let lines = vec![line("boiler", 1, "/acme", 2.0), line("truck", 2, "/acme/a", 3.0)];
        let first = load(&store, "e1", 0, &lines).await;
        assert_eq!(first.activities_upserted, 2);
        assert_eq!(first.number_values, 2);
        assert_eq!(first.string_values, 2);

        let second = load(&store, "e1", 0, &lines).await;
        assert_eq!(second.values_written(), 0);
        assert_eq!(store.activity_count("p1").await.unwrap(), 2);
        assert_eq!(store.value_count(), 4);
    }

    #[tokio::test]
    async fn test_time_range_and_leaves_follow_execution_values() {
        let store = MemoryRelationalStore::new();
        load(&store, "e1", 0, &[line("boiler", 3, "/acme/a/", 1.0), line("truck", 5, "/acme/b", 1.0)]).await;
        load(&store, "e2", 0, &[line("boiler", 9, "/acme/c", 1.0)]).await;

        let range = store.affected_time_range("p1", "e1").await.unwrap().unwrap();
        assert_eq!(range, AffectedTimeRange::new(d(3), d(5)).unwrap());
        assert_eq!(
            store.group_leaves("p1", "e1").await.unwrap(),
            vec!["/acme/a".to_string(), "/acme/b".to_string()]
        );
        assert!(store.affected_time_range("p1", "e3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_values_point_at_newest_execution() {
        let store = MemoryRelationalStore::new();
        load(&store, "e1", 0, &[line("boiler", 1, "/acme", 2.0)]).await;
        store.refresh_latest_values("p1", "e1").await.unwrap();
        load(&store, "e2", 0, &[line("boiler", 1, "/acme", 5.0)]).await;
        store.refresh_latest_values("p1", "e2").await.unwrap();

        let key = ActivityKey {
            pipeline_id: "p1".into(),
            activity_type: "raw".into(),
            name: "boiler".into(),
            date: d(1),
            group_id: "/acme".into(),
        };
        assert_eq!(store.latest_number(&key, "co2"), Some(5.0));
    }

    #[tokio::test]
    async fn test_day_cells_split_group_and_sub_group_values() {
        let store = MemoryRelationalStore::new();
        load(&store, "e1", 0, &[line("a", 1, "/acme", 1.0), line("b", 1, "/acme/x", 4.0)]).await;
        store.refresh_latest_values("p1", "e1").await.unwrap();

        let range = AffectedTimeRange::single_day(d(1));
        for group in ["/acme/x", "/acme"] {
            store
                .aggregate_day(&DayAggregation {
                    metric_id: "m1".into(),
                    input_pipelines: vec![PipelineInput {
                        pipeline_id: "p1".into(),
                        output: "co2".into(),
                    }],
                    input_metric_ids: vec![],
                    group_id: group.into(),
                    range,
                    pipeline_id: "p1".into(),
                    execution_id: "e1".into(),
                })
                .await
                .unwrap();
        }

        let cells = store.metric_values("m1", "/acme", TimeUnit::Day, &range).await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].group_value, 1.0);
        assert_eq!(cells[0].sub_groups_value, 4.0);
    }

    #[tokio::test]
    async fn test_lock_table_is_holder_conditional() {
        let table = MemoryLockTable::new();
        let ttl = Duration::from_secs(60);
        assert!(matches!(table.try_acquire("t:p", "e1", ttl).await.unwrap(), LockAttempt::Acquired(_)));
        assert!(matches!(table.try_acquire("t:p", "e2", ttl).await.unwrap(), LockAttempt::Held(_)));
        assert!(matches!(table.try_acquire("t:p", "e1", ttl).await.unwrap(), LockAttempt::Held(_)));
        assert!(!table.release("t:p", "e2").await.unwrap());
        assert!(table.release("t:p", "e1").await.unwrap());
        assert!(matches!(table.try_acquire("t:p", "e2", ttl).await.unwrap(), LockAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn test_renew_extends_only_the_owners_lease() {
        let table = MemoryLockTable::new();
        table.try_acquire("t:p", "e1", Duration::from_secs(1)).await.unwrap();
        let before = table.current("t:p").await.unwrap().unwrap().expires_at;
        assert!(!table.renew("t:p", "e2", Duration::from_secs(600)).await.unwrap());
        assert!(table.renew("t:p", "e1", Duration::from_secs(600)).await.unwrap());
        let after = table.current("t:p").await.unwrap().unwrap();
        assert!(after.expires_at > before);
        assert_eq!(after.holder, "e1");
        assert!(!table.renew("t:missing", "e1", Duration::from_secs(600)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let table = MemoryLockTable::new();
        table.try_acquire("t:p", "e1", Duration::ZERO).await.unwrap();
        assert!(matches!(
            table.try_acquire("t:p", "e2", Duration::from_secs(60)).await.unwrap(),
            LockAttempt::Acquired(_)
        ));
        assert!(!table.release("t:p", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_only_a_waiting_execution_can_be_claimed() {
        let repo = MemoryExecutionRepository::new();
        let execution = crate::models::NewPipelineExecution {
            pipeline_id: "p1".into(),
            tenant_id: "t".into(),
            group_context_id: "/acme".into(),
            input_key: "in.jsonl".into(),
        }
        .into_execution();
        repo.create(&execution).await.unwrap();

        let claimed = repo.claim(&execution.execution_id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, ExecutionStatus::InProgress);
        assert!(claimed.started_at.is_some());
        assert!(repo.claim(&execution.execution_id, Utc::now()).await.unwrap().is_none());
        assert!(repo.claim("missing", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_execution_rejects_status_changes() {
        let repo = MemoryExecutionRepository::new();
        let execution = crate::models::NewPipelineExecution {
            pipeline_id: "p1".into(),
            tenant_id: "t".into(),
            group_context_id: "/acme".into(),
            input_key: "in.jsonl".into(),
        }
        .into_execution();
        repo.create(&execution).await.unwrap();
        repo.update_status(&execution.execution_id, ExecutionStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        assert!(repo
            .update_status(&execution.execution_id, ExecutionStatus::InProgress, None)
            .await
            .is_err());
        let amended = repo
            .amend_status_message(&execution.execution_id, "boom, see chunk 2")
            .await
            .unwrap();
        assert_eq!(amended.status_message.as_deref(), Some("boom, see chunk 2"));
    }
}
