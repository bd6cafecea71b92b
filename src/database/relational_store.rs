//! # PostgreSQL Relational Store
//!
//! Staging areas are tables in the `staging` schema holding one `jsonb`
//! column. Artifacts are streamed in with `COPY … FROM STDIN` using CSV
//! framing with control characters as quote and delimiter, so every line
//! lands whole in the `record` column without escaping.
//!
//! Migration runs in one transaction on the session's connection: canonical
//! activities are upserted on their natural key, then values are inserted
//! once per `(activity, execution, key)`.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{Connection, FromRow, PgPool, Postgres};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::error::{StoreError, StoreResult};
use crate::models::{
    ActivityRecord, ActivityValue, AffectedTimeRange, AggregatedActivity, MetricValue, TimeUnit,
};
use crate::storage::hierarchy::normalize;
use crate::storage::{
    ActivityStore, DayAggregation, MetricStore, MigrationSummary, Rollup, StagingKey,
    StagingSession,
};

const STAGING_SCHEMA: &str = "staging";

fn staging_table(key: &StagingKey) -> String {
    format!("{STAGING_SCHEMA}.\"{}\"", key.table_name())
}

/// Non-blank artifact lines joined with `\n`
fn copy_payload(artifact: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(artifact.len());
    for line in artifact.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        payload.extend_from_slice(line.strip_suffix(b"\r").unwrap_or(line));
        payload.push(b'\n');
    }
    payload
}

#[derive(Debug, FromRow)]
struct MetricValueRow {
    metric_id: String,
    group_id: String,
    time_unit: String,
    date: NaiveDate,
    group_value: f64,
    sub_groups_value: f64,
    pipeline_id: String,
    execution_id: String,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<MetricValueRow> for MetricValue {
    type Error = StoreError;

    fn try_from(row: MetricValueRow) -> Result<Self, Self::Error> {
        Ok(MetricValue {
            metric_id: row.metric_id,
            group_id: row.group_id,
            time_unit: row
                .time_unit
                .parse::<TimeUnit>()
                .map_err(|message| StoreError::Serialization { message })?,
            date: row.date,
            group_value: row.group_value,
            sub_groups_value: row.sub_groups_value,
            pipeline_id: row.pipeline_id,
            execution_id: row.execution_id,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LatestValueRow {
    activity_id: i64,
    name: String,
    date: NaiveDate,
    group_id: String,
    key: String,
    value_type: String,
    number_val: Option<f64>,
    string_val: Option<String>,
    boolean_val: Option<bool>,
}

impl LatestValueRow {
    fn value(&self) -> Option<ActivityValue> {
        match self.value_type.as_str() {
            "number" => self.number_val.map(ActivityValue::Number),
            "string" => self.string_val.clone().map(ActivityValue::Text),
            "boolean" => self.boolean_val.map(ActivityValue::Boolean),
            _ => None,
        }
    }
}

#[derive(Debug, FromRow)]
struct AggregatedRow {
    pipeline_id: String,
    group_id: String,
    date: NaiveDate,
    group_key: Vec<String>,
    aggregated_values: Json<BTreeMap<String, ActivityValue>>,
    execution_id: String,
}

impl From<AggregatedRow> for AggregatedActivity {
    fn from(row: AggregatedRow) -> Self {
        AggregatedActivity {
            pipeline_id: row.pipeline_id,
            group_id: row.group_id,
            date: row.date,
            group_key: row.group_key,
            values: row.aggregated_values.0,
            execution_id: row.execution_id,
        }
    }
}

/// Activity and metric tables on one pool
#[derive(Debug, Clone)]
pub struct PgRelationalStore {
    pool: PgPool,
}

impl PgRelationalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn staging_tables(&self, execution_id: &str) -> StoreResult<Vec<String>> {
        let prefix = StagingKey::execution_table_prefix(execution_id);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT tablename::text FROM pg_tables \
             WHERE schemaname = $1 AND tablename ~ ('^' || $2 || '[0-9]+$')",
        )
        .bind(STAGING_SCHEMA)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("list_staging_tables", e))?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

/// Holds one pooled connection for the lifetime of a chunk load
pub struct PgStagingSession {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl StagingSession for PgStagingSession {
    async fn create_staging_area(&mut self, key: &StagingKey) -> StoreResult<()> {
        let table = staging_table(key);
        // a crashed earlier attempt may have left rows behind
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *self.conn)
            .await
            .map_err(|e| StoreError::database("drop_staging_table", e))?;
        sqlx::query(&format!("CREATE TABLE {table} (record jsonb NOT NULL)"))
            .execute(&mut *self.conn)
            .await
            .map_err(|e| StoreError::database("create_staging_table", e))?;
        Ok(())
    }

    async fn copy_from_artifact(&mut self, key: &StagingKey, artifact: &[u8]) -> StoreResult<u64> {
        let table = staging_table(key);
        let statement = format!(
            "COPY {table} (record) FROM STDIN WITH (FORMAT csv, QUOTE e'\\x01', DELIMITER e'\\x02')"
        );
        let payload = copy_payload(artifact);

        let mut copy = self
            .conn
            .copy_in_raw(&statement)
            .await
            .map_err(|e| StoreError::database("copy", e))?;
        if !payload.is_empty() {
            if let Err(e) = copy.send(payload).await {
                let _ = copy.abort(e.to_string()).await;
                return Err(StoreError::database("copy", e));
            }
        }
        let rows = copy.finish().await.map_err(|e| StoreError::database("copy", e))?;

        if rows == 0 {
            return Err(StoreError::ZeroRowsCopied {
                table: key.table_name(),
            });
        }
        debug!(table = %table, rows, "artifact copied into staging");
        Ok(rows)
    }

    async fn migrate(&mut self, key: &StagingKey) -> StoreResult<MigrationSummary> {
        let table = staging_table(key);
        let mut tx = self.conn.begin().await?;

        let activities = sqlx::query(&format!(
            r#"
            INSERT INTO activities (pipeline_id, activity_type, name, date, group_id)
            SELECT DISTINCT $1,
                   COALESCE(record->>'activity_type', 'raw'),
                   record->>'name',
                   (record->>'date')::date,
                   normalize_group(record->>'group_id')
            FROM {table}
            ON CONFLICT (pipeline_id, activity_type, name, date, group_id) DO NOTHING
            "#
        ))
        .bind(&key.pipeline_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::database("migrate_activities", e))?;

        let (numbers, strings, booleans): (i64, i64, i64) = sqlx::query_as(&format!(
            r#"
            WITH inserted AS (
                INSERT INTO activity_values
                    (activity_id, execution_id, pipeline_id, key, value_type, number_val, string_val, boolean_val)
                SELECT a.activity_id, $2, $1, v.key, jsonb_typeof(v.value),
                       CASE WHEN jsonb_typeof(v.value) = 'number' THEN (v.value #>> '{{}}')::double precision END,
                       CASE WHEN jsonb_typeof(v.value) = 'string' THEN v.value #>> '{{}}' END,
                       CASE WHEN jsonb_typeof(v.value) = 'boolean' THEN (v.value #>> '{{}}')::boolean END
                FROM {table} s
                CROSS JOIN LATERAL jsonb_each(COALESCE(s.record->'values', '{{}}'::jsonb)) AS v(key, value)
                JOIN activities a
                  ON a.pipeline_id = $1
                 AND a.activity_type = COALESCE(s.record->>'activity_type', 'raw')
                 AND a.name = s.record->>'name'
                 AND a.date = (s.record->>'date')::date
                 AND a.group_id = normalize_group(s.record->>'group_id')
                WHERE jsonb_typeof(v.value) IN ('number', 'string', 'boolean')
                ON CONFLICT (activity_id, execution_id, key) DO NOTHING
                RETURNING value_type
            )
            SELECT COUNT(*) FILTER (WHERE value_type = 'number'),
                   COUNT(*) FILTER (WHERE value_type = 'string'),
                   COUNT(*) FILTER (WHERE value_type = 'boolean')
            FROM inserted
            "#
        ))
        .bind(&key.pipeline_id)
        .bind(&key.execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::database("migrate_values", e))?;

        tx.commit().await?;

        let summary = MigrationSummary {
            activities_upserted: activities.rows_affected(),
            number_values: numbers as u64,
            string_values: strings as u64,
            boolean_values: booleans as u64,
        };
        debug!(table = %table, values = summary.values_written(), "staging area migrated");
        Ok(summary)
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        // dropping the connection hands it back to the pool
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for PgRelationalStore {
    async fn open_session(&self) -> StoreResult<Box<dyn StagingSession>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::database("acquire_connection", e))?;
        Ok(Box::new(PgStagingSession { conn }))
    }

    async fn staging_area_count(&self, execution_id: &str) -> StoreResult<usize> {
        Ok(self.staging_tables(execution_id).await?.len())
    }

    #[instrument(skip(self))]
    async fn drop_staging_areas(&self, execution_id: &str) -> StoreResult<usize> {
        let tables = self.staging_tables(execution_id).await?;
        for table in &tables {
            sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_SCHEMA}.\"{table}\""))
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::database("drop_staging_table", e))?;
        }
        Ok(tables.len())
    }

    async fn refresh_latest_values(&self, pipeline_id: &str, execution_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO activity_latest_values
                (activity_id, key, execution_id, value_type, number_val, string_val, boolean_val, updated_at)
            SELECT activity_id, key, execution_id, value_type, number_val, string_val, boolean_val, now()
            FROM activity_values
            WHERE pipeline_id = $1 AND execution_id = $2
            ON CONFLICT (activity_id, key) DO UPDATE
            SET execution_id = EXCLUDED.execution_id,
                value_type = EXCLUDED.value_type,
                number_val = EXCLUDED.number_val,
                string_val = EXCLUDED.string_val,
                boolean_val = EXCLUDED.boolean_val,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(pipeline_id)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("refresh_latest_values", e))?;
        Ok(result.rows_affected())
    }

    async fn affected_time_range(
        &self,
        pipeline_id: &str,
        execution_id: &str,
    ) -> StoreResult<Option<AffectedTimeRange>> {
        let (from, to): (Option<NaiveDate>, Option<NaiveDate>) = sqlx::query_as(
            "SELECT MIN(a.date), MAX(a.date) FROM activity_values v \
             JOIN activities a ON a.activity_id = v.activity_id \
             WHERE v.pipeline_id = $1 AND v.execution_id = $2",
        )
        .bind(pipeline_id)
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::database("affected_time_range", e))?;
        Ok(AffectedTimeRange::covering(from.into_iter().chain(to)))
    }

    async fn group_leaves(&self, pipeline_id: &str, execution_id: &str) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT a.group_id FROM activity_values v \
             JOIN activities a ON a.activity_id = v.activity_id \
             WHERE v.pipeline_id = $1 AND v.execution_id = $2 ORDER BY 1",
        )
        .bind(pipeline_id)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("group_leaves", e))?;
        Ok(rows.into_iter().map(|(group,)| normalize(&group)).collect())
    }

    async fn activity_count(&self, pipeline_id: &str) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM activities WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::database("activity_count", e))?;
        Ok(count as u64)
    }

    async fn latest_activities(
        &self,
        pipeline_id: &str,
        group_id: &str,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<ActivityRecord>> {
        let rows = sqlx::query_as::<_, LatestValueRow>(
            r#"
            SELECT a.activity_id, a.name, a.date, a.group_id,
                   l.key, l.value_type, l.number_val, l.string_val, l.boolean_val
            FROM activities a
            JOIN activity_latest_values l ON l.activity_id = a.activity_id
            WHERE a.pipeline_id = $1 AND a.activity_type = 'raw'
              AND a.date BETWEEN $3 AND $4
              AND ($2 = '/' OR a.group_id = $2 OR starts_with(a.group_id, $2 || '/'))
            ORDER BY a.activity_id, l.key
            "#,
        )
        .bind(pipeline_id)
        .bind(normalize(group_id))
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("latest_activities", e))?;

        let mut records: Vec<(i64, ActivityRecord)> = Vec::new();
        for row in rows {
            let Some(value) = row.value() else {
                continue;
            };
            match records.last_mut() {
                Some((id, record)) if *id == row.activity_id => {
                    record.values.insert(row.key, value);
                }
                _ => records.push((
                    row.activity_id,
                    ActivityRecord {
                        activity_type: "raw".to_string(),
                        name: row.name,
                        date: row.date,
                        group_id: row.group_id,
                        values: BTreeMap::from([(row.key, value)]),
                    },
                )),
            }
        }
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_aggregated_activities(&self, rows: &[AggregatedActivity]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO aggregated_activities
                    (pipeline_id, group_id, date, group_key, aggregated_values, execution_id, updated_at)
                VALUES ($1, normalize_group($2), $3, $4, $5, $6, now())
                ON CONFLICT (pipeline_id, group_id, date, group_key) DO UPDATE
                SET aggregated_values = EXCLUDED.aggregated_values,
                    execution_id = EXCLUDED.execution_id,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&row.pipeline_id)
            .bind(&row.group_id)
            .bind(row.date)
            .bind(&row.group_key)
            .bind(Json(&row.values))
            .bind(&row.execution_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database("upsert_aggregated_activity", e))?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn aggregated_activities(
        &self,
        pipeline_id: &str,
        group_id: &str,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<AggregatedActivity>> {
        Ok(sqlx::query_as::<_, AggregatedRow>(
            "SELECT pipeline_id, group_id, date, group_key, aggregated_values, execution_id \
             FROM aggregated_activities \
             WHERE pipeline_id = $1 AND group_id = $2 AND date BETWEEN $3 AND $4 \
             ORDER BY date, group_key",
        )
        .bind(pipeline_id)
        .bind(normalize(group_id))
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("aggregated_activities", e))?
        .into_iter()
        .map(AggregatedActivity::from)
        .collect())
    }
}

#[async_trait]
impl MetricStore for PgRelationalStore {
    #[instrument(skip(self, request), fields(metric_id = %request.metric_id, group_id = %request.group_id))]
    async fn aggregate_day(&self, request: &DayAggregation) -> StoreResult<u64> {
        let (pipelines, outputs): (Vec<String>, Vec<String>) = request
            .input_pipelines
            .iter()
            .map(|i| (i.pipeline_id.clone(), i.output.clone()))
            .unzip();

        let result = sqlx::query(
            r#"
            WITH own_values AS (
                SELECT a.date, l.number_val AS v
                FROM activity_latest_values l
                JOIN activities a ON a.activity_id = l.activity_id
                JOIN unnest($3::text[], $4::text[]) AS i(pipeline_id, output)
                  ON i.pipeline_id = a.pipeline_id AND i.output = l.key
                WHERE a.group_id = $2 AND a.date BETWEEN $5 AND $6 AND l.value_type = 'number'
                UNION ALL
                SELECT m.date, m.group_value
                FROM metric_values m
                WHERE m.metric_id = ANY($7) AND m.group_id = $2 AND m.time_unit = 'day'
                  AND m.date BETWEEN $5 AND $6
            ),
            child_values AS (
                SELECT m.date, m.group_value + m.sub_groups_value AS v
                FROM metric_values m
                WHERE m.metric_id = $1 AND parent_group(m.group_id) = $2 AND m.time_unit = 'day'
                  AND m.date BETWEEN $5 AND $6
            ),
            cells AS (
                SELECT date, SUM(v) AS group_value, 0::double precision AS sub_groups_value
                FROM own_values GROUP BY date
                UNION ALL
                SELECT date, 0::double precision, SUM(v) FROM child_values GROUP BY date
            )
            INSERT INTO metric_values
                (metric_id, group_id, time_unit, date, group_value, sub_groups_value, pipeline_id, execution_id, updated_at)
            SELECT $1, $2, 'day', date, SUM(group_value), SUM(sub_groups_value), $8, $9, now()
            FROM cells GROUP BY date
            ON CONFLICT (metric_id, group_id, time_unit, date) DO UPDATE
            SET group_value = EXCLUDED.group_value,
                sub_groups_value = EXCLUDED.sub_groups_value,
                pipeline_id = EXCLUDED.pipeline_id,
                execution_id = EXCLUDED.execution_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&request.metric_id)
        .bind(normalize(&request.group_id))
        .bind(pipelines)
        .bind(outputs)
        .bind(request.range.from)
        .bind(request.range.to)
        .bind(&request.input_metric_ids)
        .bind(&request.pipeline_id)
        .bind(&request.execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("aggregate_day", e))?;
        Ok(result.rows_affected())
    }

    async fn rollup(&self, request: &Rollup) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO metric_values
                (metric_id, group_id, time_unit, date, group_value, sub_groups_value, pipeline_id, execution_id, updated_at)
            SELECT $1, $2, $3, bucket, SUM(group_value), SUM(sub_groups_value), $7, $8, now()
            FROM (
                SELECT date_trunc($3, date::timestamp)::date AS bucket, group_value, sub_groups_value
                FROM metric_values
                WHERE metric_id = $1 AND group_id = $2 AND time_unit = $4 AND date BETWEEN $5 AND $6
            ) source
            GROUP BY bucket
            ON CONFLICT (metric_id, group_id, time_unit, date) DO UPDATE
            SET group_value = EXCLUDED.group_value,
                sub_groups_value = EXCLUDED.sub_groups_value,
                pipeline_id = EXCLUDED.pipeline_id,
                execution_id = EXCLUDED.execution_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&request.metric_id)
        .bind(normalize(&request.group_id))
        .bind(request.to_unit.date_part())
        .bind(request.from_unit.date_part())
        .bind(request.range.from)
        .bind(request.range.to)
        .bind(&request.pipeline_id)
        .bind(&request.execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("rollup", e))?;
        Ok(result.rows_affected())
    }

    async fn metric_values(
        &self,
        metric_id: &str,
        group_id: &str,
        unit: TimeUnit,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<MetricValue>> {
        sqlx::query_as::<_, MetricValueRow>(
            "SELECT metric_id, group_id, time_unit, date, group_value, sub_groups_value, \
                    pipeline_id, execution_id, updated_at \
             FROM metric_values \
             WHERE metric_id = $1 AND group_id = $2 AND time_unit = $3 AND date BETWEEN $4 AND $5 \
             ORDER BY date",
        )
        .bind(metric_id)
        .bind(normalize(group_id))
        .bind(unit.date_part())
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("metric_values", e))?
        .into_iter()
        .map(MetricValue::try_from)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_payload_drops_blank_lines() {
        let payload = copy_payload(b"{\"a\":1}\r\n\n   \n{\"b\":2}");
        assert_eq!(payload, b"{\"a\":1}\n{\"b\":2}\n".to_vec());
        assert!(copy_payload(b"\n \n").is_empty());
    }

    #[test]
    fn test_staging_table_is_schema_qualified() {
        let key = StagingKey::new("p1", "E-1", 3);
        assert_eq!(staging_table(&key), format!("staging.\"{}\"", key.table_name()));
        assert!(staging_table(&key).starts_with("staging.\"activity_e_1_"));
    }
}
