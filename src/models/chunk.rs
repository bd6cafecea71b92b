//! # Chunk Planning
//!
//! An execution's input object is split into half-open byte ranges of at most
//! `max_chunk_bytes`. Ranges tile `[0, object_size)` exactly and sequences are
//! dense from zero, so the chunk count is fixed the moment the plan exists.
//!
//! Ranges cut through lines. A line belongs to the chunk its first byte falls
//! in ([`ByteRange::owned_lines`]), which lets workers read whole lines
//! without two neighbouring chunks processing the same one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

/// `[start, end)` in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// Lines of `data` (the whole object) that start inside this range.
    /// Line terminators are stripped, blank lines skipped.
    pub fn owned_lines<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        let mut lines = Vec::new();
        let mut line_start = 0usize;
        for (idx, byte) in data.iter().enumerate() {
            if *byte == b'\n' {
                self.push_owned(&mut lines, data, line_start, idx);
                line_start = idx + 1;
            }
        }
        if line_start < data.len() {
            self.push_owned(&mut lines, data, line_start, data.len());
        }
        lines
    }

    fn push_owned<'a>(&self, lines: &mut Vec<&'a [u8]>, data: &'a [u8], start: usize, end: usize) {
        if !self.contains(start as u64) {
            return;
        }
        let mut line = &data[start..end];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if !line.iter().all(u8::is_ascii_whitespace) {
            lines.push(line);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub sequence: u32,
    pub range: ByteRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub input_key: String,
    pub object_size: u64,
    pub chunks: Vec<Chunk>,
}

impl ChunkPlan {
    pub fn plan(input_key: impl Into<String>, object_size: u64, max_chunk_bytes: u64) -> Result<Self> {
        if max_chunk_bytes == 0 {
            return Err(PipelineError::validation("chunk size must be positive"));
        }
        let mut chunks = Vec::new();
        let mut start = 0u64;
        let mut sequence = 0u32;
        while start < object_size {
            let end = start.saturating_add(max_chunk_bytes).min(object_size);
            chunks.push(Chunk {
                sequence,
                range: ByteRange::new(start, end),
            });
            sequence = sequence
                .checked_add(1)
                .ok_or_else(|| PipelineError::validation("input needs more chunks than u32 allows"))?;
            start = end;
        }
        Ok(Self {
            input_key: input_key.into(),
            object_size,
            chunks,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn expected_chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    Success,
    Failed,
}

impl fmt::Display for ChunkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkOutcome::Success => f.write_str("success"),
            ChunkOutcome::Failed => f.write_str("failed"),
        }
    }
}

/// Stage a failed chunk stopped at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStage {
    Calculation,
    Load,
}

/// Terminal per-chunk record. Its existence in the object store is the
/// idempotency key for `(executionId, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMarker {
    pub sequence: u32,
    pub outcome: ChunkOutcome,
    #[serde(default)]
    pub rows_loaded: u64,
    #[serde(default)]
    pub no_activities_processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<ChunkStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ChunkMarker {
    pub fn success(sequence: u32, rows_loaded: u64, no_activities_processed: bool) -> Self {
        Self {
            sequence,
            outcome: ChunkOutcome::Success,
            rows_loaded,
            no_activities_processed,
            failed_stage: None,
            message: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(sequence: u32, stage: ChunkStage, message: impl Into<String>) -> Self {
        Self {
            sequence,
            outcome: ChunkOutcome::Failed,
            rows_loaded: 0,
            no_activities_processed: false,
            failed_stage: Some(stage),
            message: Some(message.into()),
            recorded_at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == ChunkOutcome::Failed
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
