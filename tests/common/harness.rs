//! In-memory engine plus a scripted calculation worker.
//!
//! [`FakeWorker`] reads its chunk's lines from the input object, turns each
//! `name,date,group,co2` line into an activity, writes the artifact to the
//! requested output key and reports back through the completion registry
//! from a spawned task, the way an out-of-process worker would.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;

use pipeline_engine::config::EngineConfig;
use pipeline_engine::models::activity::encode_artifact;
use pipeline_engine::models::{
    CalculationCallback, CalculationRequest, NewPipelineExecution, PipelineExecution,
};
use pipeline_engine::orchestration::{
    CalculationWorker, CompletionRegistry, EngineStores, Orchestrator, WorkerError,
};
use pipeline_engine::state_machine::OrchestratorStage;
use pipeline_engine::storage::{MemoryCatalog, ObjectKeys, ObjectStore, WritePrecondition};

use super::builders::{
    emissions_pipeline, parse_input_line, total_co2_metric, EMISSIONS_LINE_BYTES, GROUP_CONTEXT,
    PIPELINE, TENANT,
};

/// What the worker does when handed a chunk
#[derive(Debug, Clone)]
pub enum Behavior {
    Compute,
    /// Accept the chunk but write an artifact with no records
    EmptyOutput,
    /// Refuse every invocation as throttled
    Throttle,
    Reject,
    /// Accept, then report calculation errors instead of an artifact
    ReportErrors(Vec<String>),
    /// Accept, then compute once a permit is available
    Hold(Arc<Semaphore>),
}

pub struct FakeWorker {
    objects: Arc<dyn ObjectStore>,
    registry: OnceLock<Arc<CompletionRegistry>>,
    default_behavior: Mutex<Behavior>,
    behaviors: Mutex<HashMap<u32, Behavior>>,
    invocations: Mutex<Vec<(String, u32)>>,
}

impl FakeWorker {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            registry: OnceLock::new(),
            default_behavior: Mutex::new(Behavior::Compute),
            behaviors: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, registry: Arc<CompletionRegistry>) {
        let _ = self.registry.set(registry);
    }

    pub fn set_default(&self, behavior: Behavior) {
        *self.default_behavior.lock() = behavior;
    }

    pub fn set_behavior(&self, sequence: u32, behavior: Behavior) {
        self.behaviors.lock().insert(sequence, behavior);
    }

    pub fn invocations(&self) -> Vec<(String, u32)> {
        self.invocations.lock().clone()
    }

    pub fn invocations_of(&self, execution_id: &str, sequence: u32) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|(e, s)| e == execution_id && *s == sequence)
            .count()
    }

    fn behavior_for(&self, sequence: u32) -> Behavior {
        self.behaviors
            .lock()
            .get(&sequence)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.lock().clone())
    }
}

#[async_trait]
impl CalculationWorker for FakeWorker {
    async fn invoke(&self, request: &CalculationRequest) -> Result<(), WorkerError> {
        self.invocations
            .lock()
            .push((request.context.execution_id.clone(), request.chunk.sequence));
        let registry = self
            .registry
            .get()
            .cloned()
            .ok_or_else(|| WorkerError::Unavailable("worker not attached".into()))?;

        let behavior = self.behavior_for(request.chunk.sequence);
        let objects = Arc::clone(&self.objects);
        let request = request.clone();
        match behavior {
            Behavior::Throttle => return Err(WorkerError::Throttled("rate exceeded".into())),
            Behavior::Reject => return Err(WorkerError::Rejected("unsupported input".into())),
            Behavior::ReportErrors(errors) => {
                tokio::spawn(async move {
                    registry
                        .complete(CalculationCallback::failure(request.completion_token, errors))
                        .unwrap();
                });
            }
            Behavior::Hold(gate) => {
                tokio::spawn(async move {
                    let _permit = gate.acquire().await.unwrap();
                    compute_and_report(objects, registry, request, false).await;
                });
            }
            Behavior::EmptyOutput => {
                tokio::spawn(compute_and_report(objects, registry, request, true));
            }
            Behavior::Compute => {
                tokio::spawn(compute_and_report(objects, registry, request, false));
            }
        }
        Ok(())
    }
}

async fn compute_and_report(
    objects: Arc<dyn ObjectStore>,
    registry: Arc<CompletionRegistry>,
    request: CalculationRequest,
    empty: bool,
) {
    let input = objects.get(&request.source.input_key).await.unwrap();
    let records: Vec<_> = if empty {
        Vec::new()
    } else {
        request
            .chunk
            .range
            .owned_lines(&input)
            .into_iter()
            .filter_map(parse_input_line)
            .collect()
    };
    let artifact = encode_artifact(&records).unwrap();
    objects
        .put(&request.output_key, artifact, WritePrecondition::None)
        .await
        .unwrap();
    registry
        .complete(CalculationCallback::success(
            request.completion_token,
            request.output_key,
        ))
        .unwrap();
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub stores: EngineStores,
    pub catalog: Arc<MemoryCatalog>,
    pub worker: Arc<FakeWorker>,
    pub keys: ObjectKeys,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let (stores, catalog) = EngineStores::in_memory();
        let worker = Arc::new(FakeWorker::new(Arc::clone(&stores.objects)));
        let keys = ObjectKeys::new(&config.storage.prefix);
        let orchestrator = Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::clone(&worker) as Arc<dyn CalculationWorker>,
            config,
        ));
        worker.attach(Arc::clone(orchestrator.registry()));
        Self {
            orchestrator,
            stores,
            catalog,
            worker,
            keys,
        }
    }

    /// Emissions pipeline and its metric registered, two input lines per chunk
    pub fn with_emissions(mut config: EngineConfig, inline_aggregation: bool) -> Self {
        config.calculation.chunk_size_bytes = 2 * EMISSIONS_LINE_BYTES;
        let harness = Self::new(config);
        harness.catalog.insert_pipeline(emissions_pipeline(inline_aggregation));
        harness.catalog.insert_metric(total_co2_metric());
        harness
    }

    pub async fn put_input(&self, key: &str, data: &str) {
        self.stores
            .objects
            .put(key, data.as_bytes().to_vec(), WritePrecondition::None)
            .await
            .unwrap();
    }

    pub async fn submit(&self, input_key: &str) -> PipelineExecution {
        self.submit_for(PIPELINE, input_key).await
    }

    pub async fn submit_for(&self, pipeline_id: &str, input_key: &str) -> PipelineExecution {
        self.orchestrator
            .submit(NewPipelineExecution {
                pipeline_id: pipeline_id.into(),
                tenant_id: TENANT.into(),
                group_context_id: GROUP_CONTEXT.into(),
                input_key: input_key.into(),
            })
            .await
            .unwrap()
    }

    pub async fn execution(&self, execution_id: &str) -> PipelineExecution {
        self.stores.executions.get(execution_id).await.unwrap().unwrap()
    }

    pub async fn stages(&self, execution_id: &str) -> Vec<OrchestratorStage> {
        self.stores
            .executions
            .transitions(execution_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.to_stage)
            .collect()
    }

    pub async fn object_count(&self, prefix: &str) -> usize {
        self.stores.objects.list(prefix).await.unwrap().len()
    }
}
