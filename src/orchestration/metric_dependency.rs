//! # Metric Dependency Resolution
//!
//! Metrics form a graph through `input_metrics`: if `B` lists `A` as an
//! input, `A` rolls into `B` and must be aggregated first. The graph is held
//! as an arena of nodes indexed by metric name, with the reverse
//! ("consumer") edges precomputed.
//!
//! The processing queue is built breadth-first, level by level, starting
//! from the metrics the pipeline's outputs feed. Each level is the
//! deduplicated set of consumers of the previous level. A metric that shows
//! up again after it has been queued is a configuration error; nothing is
//! silently skipped.

use std::collections::HashMap;

use crate::error::DependencyError;
use crate::models::{MetricDefinition, MetricQueueEntry};

/// Referrer reported when a seed metric has no definition
pub const PIPELINE_REFERRER: &str = "pipeline output";

#[derive(Debug, Clone)]
struct MetricNode {
    definition: MetricDefinition,
    /// Metrics that list this one in `input_metrics`
    consumers: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricGraph {
    nodes: Vec<MetricNode>,
    index: HashMap<String, usize>,
}

impl MetricGraph {
    /// Build the graph, rejecting self-references and undefined inputs
    pub fn build(metrics: Vec<MetricDefinition>) -> Result<Self, DependencyError> {
        let mut graph = Self::default();
        for definition in metrics {
            // later definitions of the same name replace earlier ones
            if let Some(&idx) = graph.index.get(&definition.name) {
                graph.nodes[idx].definition = definition;
                continue;
            }
            graph.index.insert(definition.name.clone(), graph.nodes.len());
            graph.nodes.push(MetricNode {
                definition,
                consumers: Vec::new(),
            });
        }

        for consumer in 0..graph.nodes.len() {
            let name = graph.nodes[consumer].definition.name.clone();
            let inputs = graph.nodes[consumer].definition.input_metrics.clone();
            for input in inputs {
                if input == name {
                    return Err(DependencyError::SelfReference { metric: name });
                }
                let Some(&producer) = graph.index.get(&input) else {
                    return Err(DependencyError::UnknownMetric {
                        metric: input,
                        referenced_by: name,
                    });
                };
                if !graph.nodes[producer].consumers.contains(&consumer) {
                    graph.nodes[producer].consumers.push(consumer);
                }
            }
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.index.get(name).map(|&idx| &self.nodes[idx].definition)
    }

    /// Names of the metrics that consume `name`, in definition order
    pub fn consumers(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&idx| {
                self.nodes[idx]
                    .consumers
                    .iter()
                    .map(|&c| self.nodes[c].definition.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Order every metric reachable from `seeds` so inputs precede consumers.
    /// Orders are 1-based.
    pub fn resolve_queue(&self, seeds: &[String]) -> Result<Vec<MetricQueueEntry>, DependencyError> {
        let mut queued: Vec<usize> = Vec::new();
        let mut frontier: Vec<usize> = Vec::new();
        for seed in seeds {
            let idx = *self
                .index
                .get(seed)
                .ok_or_else(|| DependencyError::UnknownMetric {
                    metric: seed.clone(),
                    referenced_by: PIPELINE_REFERRER.to_string(),
                })?;
            if !frontier.contains(&idx) {
                frontier.push(idx);
            }
        }
        queued.extend(&frontier);

        while !frontier.is_empty() {
            // (consumer, the metric that led to it)
            let mut next: Vec<(usize, usize)> = Vec::new();
            for &producer in &frontier {
                for &consumer in &self.nodes[producer].consumers {
                    if !next.iter().any(|(c, _)| *c == consumer) {
                        next.push((consumer, producer));
                    }
                }
            }
            for &(consumer, via) in &next {
                if queued.contains(&consumer) {
                    return Err(DependencyError::Duplicated {
                        metric: self.nodes[consumer].definition.name.clone(),
                        via: self.nodes[via].definition.name.clone(),
                    });
                }
                queued.push(consumer);
            }
            frontier = next.into_iter().map(|(consumer, _)| consumer).collect();
        }

        Ok(queued
            .into_iter()
            .enumerate()
            .map(|(i, idx)| MetricQueueEntry {
                order: i as u32 + 1,
                metric: self.nodes[idx].definition.name.clone(),
            })
            .collect())
    }
}

/// Build the graph from `metrics` and resolve the queue for `seeds`
pub fn resolve_metric_queue(
    metrics: Vec<MetricDefinition>,
    seeds: &[String],
) -> Result<Vec<MetricQueueEntry>, DependencyError> {
    MetricGraph::build(metrics)?.resolve_queue(seeds)
}
