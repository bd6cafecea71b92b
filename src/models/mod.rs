pub mod activity;
pub mod aggregation_job;
pub mod calculation;
pub mod chunk;
pub mod execution;
pub mod lock;
pub mod metric;
pub mod pipeline;
pub mod time_range;

// Re-export core models for easy access
pub use activity::{ActivityKey, ActivityRecord, ActivityValue, AggregatedActivity};
pub use aggregation_job::{AggregationJob, AggregationJobStatus, GroupQueueEntry};
pub use calculation::{
    CalculationCallback, CalculationRequest, CalculationResult, CalculationStatus,
    CompletionToken, PendingCall, SourceContext,
};
pub use chunk::{ByteRange, Chunk, ChunkMarker, ChunkOutcome, ChunkPlan, ChunkStage};
pub use execution::{
    ExecutionContext, ExecutionTransition, InputReference, NewPipelineExecution,
    PipelineExecution,
};
pub use lock::{LockKey, LockRecord};
pub use metric::{MetricCellKey, MetricDefinition, MetricQueueEntry, MetricValue, PipelineInput};
pub use pipeline::{
    OutputAggregate, OutputType, PipelineDefinition, ProcessorOptions, TransformerOutput,
};
pub use time_range::{AffectedTimeRange, TimeUnit, ROLLUP_LADDER};
