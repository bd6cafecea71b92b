use chrono::NaiveDate;
use proptest::prelude::*;
use proptest::sample::Index;

use pipeline_engine::models::{MetricDefinition, PipelineInput, TimeUnit};

/// Input object sizes and chunk sizes, small enough to enumerate chunks
pub fn object_and_chunk_size_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0u64..200_000, 1u64..20_000)
}

/// Non-blank lines without carriage returns
pub fn input_lines_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9,/.-]{1,24}", 1..40)
}

pub fn time_unit_strategy() -> impl Strategy<Value = TimeUnit> {
    prop_oneof![
        Just(TimeUnit::Day),
        Just(TimeUnit::Week),
        Just(TimeUnit::Month),
        Just(TimeUnit::Quarter),
        Just(TimeUnit::Year),
    ]
}

pub fn date_strategy() -> impl Strategy<Value = NaiveDate> {
    (0i64..40_000).prop_map(|offset| {
        NaiveDate::from_ymd_opt(1990, 1, 1).unwrap() + chrono::Duration::days(offset)
    })
}

/// Group paths of depth 0 to 5, with optional trailing slash
pub fn group_path_strategy() -> impl Strategy<Value = String> {
    (prop::collection::vec("[a-z][a-z0-9-]{0,8}", 0..6), any::<bool>()).prop_map(|(segments, trailing)| {
        let mut path = format!("/{}", segments.join("/"));
        if trailing && path.len() > 1 {
            path.push('/');
        }
        path
    })
}

/// Metrics in layers: layer 0 is fed by the pipeline, every metric of layer
/// `k > 0` takes one or more inputs from layer `k - 1`
pub fn layered_metrics_strategy() -> impl Strategy<Value = Vec<MetricDefinition>> {
    prop::collection::vec(
        prop::collection::vec(prop::collection::vec(any::<Index>(), 1..3), 1..4),
        1..5,
    )
    .prop_map(|layers| {
        let mut metrics = Vec::new();
        let mut previous_len = 0usize;
        for (layer, members) in layers.iter().enumerate() {
            for (position, picks) in members.iter().enumerate() {
                let name = format!("m{layer}_{position}");
                let mut input_metrics: Vec<String> = Vec::new();
                if layer > 0 {
                    for pick in picks {
                        let input = format!("m{}_{}", layer - 1, pick.index(previous_len));
                        if !input_metrics.contains(&input) {
                            input_metrics.push(input);
                        }
                    }
                }
                metrics.push(MetricDefinition {
                    id: format!("id-{name}"),
                    tenant_id: "t1".into(),
                    name,
                    time_unit: TimeUnit::Day,
                    input_pipelines: if layer == 0 {
                        vec![PipelineInput {
                            pipeline_id: "p1".into(),
                            output: "co2".into(),
                        }]
                    } else {
                        vec![]
                    },
                    input_metrics,
                });
            }
            previous_len = members.len();
        }
        metrics
    })
}
