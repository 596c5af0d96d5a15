//! Document pipeline: a fixed chain of stages over an append-only event log.
//!
//! `Received → ingest → Ingested → enhance → Enhanced → assemble → Assembled`

pub mod engine;
pub mod errors;
pub mod stage;
pub mod stages;
pub mod types;

pub use engine::{PipelineBuilder, PipelineEngine};
pub use errors::{PipelineError, StageError, StageFailure, TimeoutScope};
pub use stage::{Stage, StageContext};
pub use stages::{
    document_pipeline, AssembleStage, ContentEnhancer, EnhanceStage, Enhancement,
    ExtractiveEnhancer, IngestStage, ToolUse,
};
pub use types::{
    Assembled, Document, Enhanced, Event, EventKind, Ingested, Metadata, QaPair, Received,
};
