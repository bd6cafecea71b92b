use chrono::NaiveDate;
use std::collections::BTreeMap;

use pipeline_engine::config::EngineConfig;
use pipeline_engine::models::{
    ActivityRecord, ActivityValue, MetricDefinition, OutputAggregate, OutputType,
    PipelineDefinition, PipelineInput, ProcessorOptions, TimeUnit, TransformerOutput,
};

pub const TENANT: &str = "t1";
pub const PIPELINE: &str = "p-emissions";
pub const GROUP_CONTEXT: &str = "/acme";
pub const TOTAL_METRIC: &str = "total_co2";
pub const TOTAL_METRIC_ID: &str = "m-total";

/// Six equal-length lines, two per plant per day from 2024-01-03 (a Wednesday)
pub const EMISSIONS_INPUT: &str = "\
boiler-01,2024-01-03,/acme/plant-a,10
boiler-02,2024-01-03,/acme/plant-b,20
boiler-03,2024-01-04,/acme/plant-a,30
boiler-04,2024-01-04,/acme/plant-b,40
boiler-05,2024-01-05,/acme/plant-a,50
boiler-06,2024-01-05,/acme/plant-b,60
";

/// Byte length of one [`EMISSIONS_INPUT`] line, terminator included
pub const EMISSIONS_LINE_BYTES: u64 = 38;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Engine defaults shrunk so failure paths finish in milliseconds
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.calculation.callback_timeout_seconds = 5;
    config.calculation.retry.base_delay_ms = 1;
    config.calculation.retry.max_delay_ms = 4;
    config.gate.poll_interval_ms = 10;
    config.lock.poll_interval_ms = 5;
    config.lock.acquire_timeout_seconds = 5;
    config
}

pub fn emissions_pipeline(inline_aggregation: bool) -> PipelineDefinition {
    PipelineDefinition {
        id: PIPELINE.into(),
        tenant_id: TENANT.into(),
        name: "emissions".into(),
        version: 3,
        outputs: vec![TransformerOutput {
            key: "co2".into(),
            output_type: OutputType::Number,
            metrics: vec![TOTAL_METRIC.into()],
            aggregate: Some(OutputAggregate::Sum),
        }],
        processor_options: ProcessorOptions {
            chunk_size_mb: None,
            trigger_metric_aggregations: inline_aggregation,
        },
    }
}

pub fn total_co2_metric() -> MetricDefinition {
    MetricDefinition {
        id: TOTAL_METRIC_ID.into(),
        tenant_id: TENANT.into(),
        name: TOTAL_METRIC.into(),
        time_unit: TimeUnit::Month,
        input_metrics: vec![],
        input_pipelines: vec![PipelineInput {
            pipeline_id: PIPELINE.into(),
            output: "co2".into(),
        }],
    }
}

pub fn activity(name: &str, day: NaiveDate, group: &str, co2: f64) -> ActivityRecord {
    ActivityRecord {
        activity_type: "raw".into(),
        name: name.into(),
        date: day,
        group_id: group.into(),
        values: BTreeMap::from([("co2".to_string(), ActivityValue::Number(co2))]),
    }
}

/// `name,date,group,co2` into an activity record
pub fn parse_input_line(line: &[u8]) -> Option<ActivityRecord> {
    let text = std::str::from_utf8(line).ok()?;
    let mut fields = text.split(',');
    let name = fields.next()?;
    let day = fields.next()?.parse::<NaiveDate>().ok()?;
    let group = fields.next()?;
    let co2 = fields.next()?.trim().parse::<f64>().ok()?;
    Some(activity(name, day, group, co2))
}
